//! In-memory cluster adapter
//!
//! Implements every port against a process-local object store with the
//! parts of API server behavior the reconciler depends on: resource-version
//! conflicts on full updates, finalizer-gated deletion, claim binding the
//! way device discovery binds a claim to its device, and owner-reference
//! garbage collection on demand. Every successful write is counted and
//! logged so tests can assert on what a pass did.

use crate::crd::{
    BlockDevice, BlockDeviceClaim, CStorPool, CStorPoolCluster, CStorPoolClusterStatus, ClaimPhase,
    ClaimState, BlockDeviceClaimStatus, BlockDeviceStatus,
};
use crate::domain::ports::{ClaimApi, InventoryApi, PodApi, PoolApi, PoolClusterApi, WorkloadApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct Store {
    clusters: BTreeMap<Key, CStorPoolCluster>,
    pools: BTreeMap<Key, CStorPool>,
    devices: BTreeMap<Key, BlockDevice>,
    claims: BTreeMap<Key, BlockDeviceClaim>,
    deployments: BTreeMap<Key, Deployment>,
    budgets: BTreeMap<Key, PodDisruptionBudget>,
    pod_phases: BTreeMap<Key, String>,
    next_version: u64,
    next_uid: u64,
    mutations: Vec<String>,
    failing: BTreeSet<String>,
    defer_binding: bool,
}

impl Store {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }

    fn admit(&mut self, meta: &mut ObjectMeta, kind: &str) {
        if meta.uid.is_none() {
            self.next_uid += 1;
            meta.uid = Some(format!("{}-{:06}", kind.to_lowercase(), self.next_uid));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        self.bump(meta);
    }

    fn record(&mut self, op: &str, kind: &str, name: &str) {
        debug!(op, kind, name, "in-memory write");
        self.mutations.push(format!("{} {}/{}", op, kind, name));
    }

    fn check_failure(&self, op: &str) -> Result<()> {
        if self.failing.contains(op) {
            return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("injected failure for {}", op),
                reason: "InternalError".into(),
                code: 500,
            })));
        }
        Ok(())
    }

    /// Full update semantics shared by every kind
    fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, kind: &str, name: &str) -> Result<()> {
        match &incoming.resource_version {
            Some(rv) if Some(rv) != stored.resource_version.as_ref() => Err(Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn bind_device(&mut self, namespace: &str, claim: &BlockDeviceClaim) {
        let device_key = key(namespace, &claim.spec.block_device_name);
        if let Some(device) = self.devices.get_mut(&device_key) {
            if device.is_claimed() {
                return;
            }
            device.spec.claim_ref = Some(ObjectReference {
                kind: Some("BlockDeviceClaim".into()),
                namespace: Some(namespace.to_string()),
                name: claim.metadata.name.clone(),
                uid: claim.metadata.uid.clone(),
                ..Default::default()
            });
            device.status = Some(BlockDeviceStatus {
                claim_state: ClaimState::Claimed,
                state: "Active".into(),
            });
        }
    }

    fn unbind_device(&mut self, namespace: &str, claim: &BlockDeviceClaim) {
        let device_key = key(namespace, &claim.spec.block_device_name);
        if let Some(device) = self.devices.get_mut(&device_key) {
            if device.claim_name() == claim.metadata.name.as_deref() {
                device.spec.claim_ref = None;
                device.status = Some(BlockDeviceStatus {
                    claim_state: ClaimState::Unclaimed,
                    state: "Active".into(),
                });
            }
        }
    }

    fn remove_claim(&mut self, claim_key: &Key) {
        if let Some(claim) = self.claims.remove(claim_key) {
            let namespace = claim_key.0.clone();
            self.unbind_device(&namespace, &claim);
        }
    }

    /// Delete an object, honoring finalizers by only stamping the deletion
    /// timestamp while any remain
    fn finalizable(meta: &mut ObjectMeta) -> bool {
        let has_finalizers = meta.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if has_finalizers {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            false
        } else {
            true
        }
    }

    fn released(meta: &ObjectMeta) -> bool {
        meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true)
    }

    fn owner_alive(&self, meta: &ObjectMeta, uids: &BTreeSet<String>) -> bool {
        match meta.owner_references.as_ref() {
            Some(owners) if !owners.is_empty() => owners.iter().any(|o| uids.contains(&o.uid)),
            _ => true,
        }
    }
}

// =============================================================================
// InMemoryCluster
// =============================================================================

/// Process-local cluster implementing every port
#[derive(Default)]
pub struct InMemoryCluster {
    store: RwLock<Store>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Insert a cluster as if a user had applied it
    pub fn add_cluster(&self, namespace: &str, mut cspc: CStorPoolCluster) -> CStorPoolCluster {
        let mut store = self.store.write();
        cspc.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut cspc.metadata, "CStorPoolCluster");
        let name = cspc.metadata.name.clone().unwrap_or_default();
        store.clusters.insert(key(namespace, &name), cspc.clone());
        cspc
    }

    /// Insert a discovered block device; the uid defaults to `<name>-uid`
    pub fn add_block_device(&self, namespace: &str, mut device: BlockDevice) -> BlockDevice {
        let mut store = self.store.write();
        let name = device.metadata.name.clone().unwrap_or_default();
        if device.metadata.uid.is_none() {
            device.metadata.uid = Some(format!("{}-uid", name));
        }
        device.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut device.metadata, "BlockDevice");
        store.devices.insert(key(namespace, &name), device.clone());
        device
    }

    /// Insert a claim created by someone else and bind its device
    pub fn add_claim(&self, namespace: &str, mut claim: BlockDeviceClaim) -> BlockDeviceClaim {
        let mut store = self.store.write();
        claim.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut claim.metadata, "BlockDeviceClaim");
        store.bind_device(namespace, &claim);
        let name = claim.metadata.name.clone().unwrap_or_default();
        store.claims.insert(key(namespace, &name), claim.clone());
        claim
    }

    /// Insert an existing pool
    pub fn add_pool(&self, namespace: &str, mut pool: CStorPool) -> CStorPool {
        let mut store = self.store.write();
        pool.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut pool.metadata, "CStorPool");
        let name = pool.metadata.name.clone().unwrap_or_default();
        store.pools.insert(key(namespace, &name), pool.clone());
        pool
    }

    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) {
        self.store
            .write()
            .pod_phases
            .insert(key(namespace, name), phase.to_string());
    }

    /// Make every call of the named port operation fail with a 500
    pub fn fail_operation(&self, op: &str) {
        self.store.write().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.store.write().failing.clear();
    }

    /// Leave new claims unbound until [`Self::bind_pending_claims`] runs, the
    /// way a slow device discovery component would
    pub fn defer_claim_binding(&self, defer: bool) {
        self.store.write().defer_binding = defer;
    }

    /// Bind every unbound claim to its device; returns how many were bound
    pub fn bind_pending_claims(&self) -> usize {
        let mut store = self.store.write();
        let pending: Vec<Key> = store
            .claims
            .iter()
            .filter(|(_, c)| c.status.as_ref().map(|s| s.phase) != Some(ClaimPhase::Bound))
            .map(|(k, _)| k.clone())
            .collect();
        for claim_key in &pending {
            let Some(mut claim) = store.claims.get(claim_key).cloned() else {
                continue;
            };
            claim.status = Some(BlockDeviceClaimStatus {
                phase: ClaimPhase::Bound,
            });
            store.bind_device(&claim_key.0, &claim);
            store.claims.insert(claim_key.clone(), claim);
        }
        pending.len()
    }

    // -------------------------------------------------------------------------
    // User Actions
    // -------------------------------------------------------------------------

    /// Replace a cluster's spec as a user edit would, keeping metadata
    pub fn edit_cluster<F>(&self, namespace: &str, name: &str, edit: F) -> Option<CStorPoolCluster>
    where
        F: FnOnce(&mut CStorPoolCluster),
    {
        let mut store = self.store.write();
        let mut cspc = store.clusters.get(&key(namespace, name))?.clone();
        edit(&mut cspc);
        store.bump(&mut cspc.metadata);
        store.clusters.insert(key(namespace, name), cspc.clone());
        Some(cspc)
    }

    /// Delete a cluster as a user would; finalizers hold it in deletion
    pub fn delete_cluster(&self, namespace: &str, name: &str) {
        let mut store = self.store.write();
        let cluster_key = key(namespace, name);
        let remove = match store.clusters.get_mut(&cluster_key) {
            Some(cspc) => Store::finalizable(&mut cspc.metadata),
            None => false,
        };
        if remove {
            store.clusters.remove(&cluster_key);
        } else if let Some(mut cspc) = store.clusters.remove(&cluster_key) {
            store.bump(&mut cspc.metadata);
            store.clusters.insert(cluster_key, cspc);
        }
    }

    /// Remove objects whose owners are gone, cascading until stable
    pub fn collect_garbage(&self) {
        let mut store = self.store.write();
        loop {
            let cluster_uids: BTreeSet<String> = store
                .clusters
                .values()
                .filter_map(|c| c.metadata.uid.clone())
                .collect();

            let orphan_pools: Vec<Key> = store
                .pools
                .iter()
                .filter(|(_, p)| !store.owner_alive(&p.metadata, &cluster_uids))
                .map(|(k, _)| k.clone())
                .collect();

            let orphan_claims: Vec<Key> = store
                .claims
                .iter()
                .filter(|(_, c)| !store.owner_alive(&c.metadata, &cluster_uids))
                .map(|(k, _)| k.clone())
                .collect();

            let orphan_budgets: Vec<Key> = store
                .budgets
                .iter()
                .filter(|(_, b)| !store.owner_alive(&b.metadata, &cluster_uids))
                .map(|(k, _)| k.clone())
                .collect();

            for k in &orphan_pools {
                store.pools.remove(k);
            }
            for k in &orphan_budgets {
                store.budgets.remove(k);
            }
            for k in &orphan_claims {
                let remove = match store.claims.get_mut(k) {
                    Some(claim) => Store::finalizable(&mut claim.metadata),
                    None => false,
                };
                if remove {
                    store.remove_claim(k);
                }
            }

            let pool_uids: BTreeSet<String> = store
                .pools
                .values()
                .filter_map(|p| p.metadata.uid.clone())
                .collect();
            let orphan_deployments: Vec<Key> = store
                .deployments
                .iter()
                .filter(|(_, d)| !store.owner_alive(&d.metadata, &pool_uids))
                .map(|(k, _)| k.clone())
                .collect();
            for k in &orphan_deployments {
                store.deployments.remove(k);
            }

            if orphan_pools.is_empty() && orphan_deployments.is_empty() {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<CStorPoolCluster> {
        self.store.read().clusters.get(&key(namespace, name)).cloned()
    }

    pub fn block_device(&self, namespace: &str, name: &str) -> Option<BlockDevice> {
        self.store.read().devices.get(&key(namespace, name)).cloned()
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<BlockDeviceClaim> {
        self.store.read().claims.get(&key(namespace, name)).cloned()
    }

    pub fn pools(&self, namespace: &str) -> Vec<CStorPool> {
        self.store
            .read()
            .pools
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn claims(&self, namespace: &str) -> Vec<BlockDeviceClaim> {
        self.store
            .read()
            .claims
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn deployments(&self, namespace: &str) -> Vec<Deployment> {
        self.store
            .read()
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn disruption_budgets(&self, namespace: &str) -> Vec<PodDisruptionBudget> {
        self.store
            .read()
            .budgets
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Number of successful writes so far
    pub fn mutation_count(&self) -> usize {
        self.store.read().mutations.len()
    }

    /// Successful writes in order, as `op Kind/name`
    pub fn mutation_log(&self) -> Vec<String> {
        self.store.read().mutations.clone()
    }

    pub fn reset_mutations(&self) {
        self.store.write().mutations.clear();
    }
}

/// Check a `k=v,k=v` selector against a label map
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).map(|l| l == v).unwrap_or(false),
            None => labels.map(|l| l.contains_key(term)).unwrap_or(false),
        })
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn already_exists(kind: &str, name: &str) -> Error {
    Error::ResourceExists {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

// =============================================================================
// Port Implementations
// =============================================================================

#[async_trait]
impl InventoryApi for InMemoryCluster {
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        let store = self.store.read();
        store.check_failure("get_block_device")?;
        store
            .devices
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("BlockDevice", name))
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim> {
        let store = self.store.read();
        store.check_failure("get_claim")?;
        store
            .claims
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("BlockDeviceClaim", name))
    }

    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<BlockDeviceClaim>> {
        let store = self.store.read();
        store.check_failure("list_claims")?;
        Ok(store
            .claims
            .iter()
            .filter(|((ns, _), c)| ns == namespace && selector_matches(selector, c.metadata.labels.as_ref()))
            .map(|(_, c)| c.clone())
            .collect())
    }
}

#[async_trait]
impl ClaimApi for InMemoryCluster {
    async fn create_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let mut store = self.store.write();
        store.check_failure("create_claim")?;
        let name = claim.metadata.name.clone().unwrap_or_default();
        let claim_key = key(namespace, &name);
        if store.claims.contains_key(&claim_key) {
            return Err(already_exists("BlockDeviceClaim", &name));
        }
        let mut created = claim.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = None;
        store.admit(&mut created.metadata, "BlockDeviceClaim");
        if !store.defer_binding {
            created.status = Some(BlockDeviceClaimStatus {
                phase: ClaimPhase::Bound,
            });
            store.bind_device(namespace, &created);
        }
        store.claims.insert(claim_key, created.clone());
        store.record("create", "BlockDeviceClaim", &name);
        Ok(created)
    }

    async fn replace_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let mut store = self.store.write();
        store.check_failure("replace_claim")?;
        let name = claim.metadata.name.clone().unwrap_or_default();
        let claim_key = key(namespace, &name);
        let stored = store
            .claims
            .get(&claim_key)
            .ok_or_else(|| not_found("BlockDeviceClaim", &name))?;
        Store::check_version(&stored.metadata, &claim.metadata, "BlockDeviceClaim", &name)?;
        let deletion_timestamp = stored.metadata.deletion_timestamp.clone();

        let mut updated = claim.clone();
        updated.metadata.deletion_timestamp = deletion_timestamp;
        store.bump(&mut updated.metadata);
        store.record("replace", "BlockDeviceClaim", &name);
        if Store::released(&updated.metadata) {
            store.claims.insert(claim_key.clone(), updated.clone());
            store.remove_claim(&claim_key);
        } else {
            store.claims.insert(claim_key, updated.clone());
        }
        Ok(updated)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.store.write();
        store.check_failure("delete_claim")?;
        let claim_key = key(namespace, name);
        let remove = match store.claims.get_mut(&claim_key) {
            Some(claim) => Store::finalizable(&mut claim.metadata),
            None => return Err(not_found("BlockDeviceClaim", name)),
        };
        store.record("delete", "BlockDeviceClaim", name);
        if remove {
            store.remove_claim(&claim_key);
        }
        Ok(())
    }
}

#[async_trait]
impl PoolClusterApi for InMemoryCluster {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<CStorPoolCluster> {
        let store = self.store.read();
        store.check_failure("get_cluster")?;
        store
            .clusters
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found("CStorPoolCluster", name))
    }

    async fn replace_cluster(&self, namespace: &str, cspc: &CStorPoolCluster) -> Result<CStorPoolCluster> {
        let mut store = self.store.write();
        store.check_failure("replace_cluster")?;
        let name = cspc.metadata.name.clone().unwrap_or_default();
        let cluster_key = key(namespace, &name);
        let stored = store
            .clusters
            .get(&cluster_key)
            .ok_or_else(|| not_found("CStorPoolCluster", &name))?;
        Store::check_version(&stored.metadata, &cspc.metadata, "CStorPoolCluster", &name)?;

        let mut updated = cspc.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        // Status lives in its own subresource
        updated.status = stored.status.clone();
        store.bump(&mut updated.metadata);
        store.record("replace", "CStorPoolCluster", &name);
        if Store::released(&updated.metadata) {
            store.clusters.remove(&cluster_key);
        } else {
            store.clusters.insert(cluster_key, updated.clone());
        }
        Ok(updated)
    }

    async fn json_patch_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<CStorPoolCluster> {
        let mut store = self.store.write();
        store.check_failure("json_patch_cluster")?;
        let cluster_key = key(namespace, name);
        let stored = store
            .clusters
            .get(&cluster_key)
            .ok_or_else(|| not_found("CStorPoolCluster", name))?;

        let mut doc = serde_json::to_value(stored)?;
        json_patch::patch(&mut doc, &patch.0).map_err(|e| Error::JsonPatch(e.to_string()))?;
        let mut patched: CStorPoolCluster = serde_json::from_value(doc)?;
        store.bump(&mut patched.metadata);
        store.record("patch", "CStorPoolCluster", name);
        store.clusters.insert(cluster_key, patched.clone());
        Ok(patched)
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CStorPoolClusterStatus,
    ) -> Result<()> {
        let mut store = self.store.write();
        store.check_failure("patch_cluster_status")?;
        let cluster_key = key(namespace, name);
        let mut cspc = store
            .clusters
            .get(&cluster_key)
            .cloned()
            .ok_or_else(|| not_found("CStorPoolCluster", name))?;
        cspc.status = Some(status.clone());
        store.bump(&mut cspc.metadata);
        store.record("patch-status", "CStorPoolCluster", name);
        store.clusters.insert(cluster_key, cspc);
        Ok(())
    }
}

#[async_trait]
impl PoolApi for InMemoryCluster {
    async fn list_pools(&self, namespace: &str, selector: &str) -> Result<Vec<CStorPool>> {
        let store = self.store.read();
        store.check_failure("list_pools")?;
        Ok(store
            .pools
            .iter()
            .filter(|((ns, _), p)| ns == namespace && selector_matches(selector, p.metadata.labels.as_ref()))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn create_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool> {
        let mut store = self.store.write();
        store.check_failure("create_pool")?;
        let name = pool.metadata.name.clone().unwrap_or_default();
        let pool_key = key(namespace, &name);
        if store.pools.contains_key(&pool_key) {
            return Err(already_exists("CStorPool", &name));
        }
        let mut created = pool.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = None;
        store.admit(&mut created.metadata, "CStorPool");
        store.pools.insert(pool_key, created.clone());
        store.record("create", "CStorPool", &name);
        Ok(created)
    }

    async fn replace_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool> {
        let mut store = self.store.write();
        store.check_failure("replace_pool")?;
        let name = pool.metadata.name.clone().unwrap_or_default();
        let pool_key = key(namespace, &name);
        let stored = store
            .pools
            .get(&pool_key)
            .ok_or_else(|| not_found("CStorPool", &name))?;
        Store::check_version(&stored.metadata, &pool.metadata, "CStorPool", &name)?;
        let mut updated = pool.clone();
        updated.status = stored.status.clone();
        store.bump(&mut updated.metadata);
        store.pools.insert(pool_key, updated.clone());
        store.record("replace", "CStorPool", &name);
        Ok(updated)
    }

    async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.store.write();
        store.check_failure("delete_pool")?;
        store
            .pools
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("CStorPool", name))?;
        store.record("delete", "CStorPool", name);
        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for InMemoryCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let store = self.store.read();
        store.check_failure("get_deployment")?;
        Ok(store.deployments.get(&key(namespace, name)).cloned())
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        let mut store = self.store.write();
        store.check_failure("create_deployment")?;
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let deployment_key = key(namespace, &name);
        if store.deployments.contains_key(&deployment_key) {
            return Err(already_exists("Deployment", &name));
        }
        let mut created = deployment.clone();
        created.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut created.metadata, "Deployment");
        store.deployments.insert(deployment_key, created.clone());
        store.record("create", "Deployment", &name);
        Ok(created)
    }

    async fn list_disruption_budgets(&self, namespace: &str, selector: &str) -> Result<Vec<PodDisruptionBudget>> {
        let store = self.store.read();
        store.check_failure("list_disruption_budgets")?;
        Ok(store
            .budgets
            .iter()
            .filter(|((ns, _), b)| ns == namespace && selector_matches(selector, b.metadata.labels.as_ref()))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn create_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<PodDisruptionBudget> {
        let mut store = self.store.write();
        store.check_failure("create_disruption_budget")?;
        let name = budget.metadata.name.clone().unwrap_or_default();
        let budget_key = key(namespace, &name);
        if store.budgets.contains_key(&budget_key) {
            return Err(already_exists("PodDisruptionBudget", &name));
        }
        let mut created = budget.clone();
        created.metadata.namespace = Some(namespace.to_string());
        store.admit(&mut created.metadata, "PodDisruptionBudget");
        store.budgets.insert(budget_key, created.clone());
        store.record("create", "PodDisruptionBudget", &name);
        Ok(created)
    }

    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<()> {
        let mut store = self.store.write();
        store.check_failure("delete_disruption_budget")?;
        store
            .budgets
            .remove(&key(namespace, name))
            .ok_or_else(|| not_found("PodDisruptionBudget", name))?;
        store.record("delete", "PodDisruptionBudget", name);
        Ok(())
    }
}

#[async_trait]
impl PodApi for InMemoryCluster {
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let store = self.store.read();
        store.check_failure("pod_phase")?;
        Ok(store.pod_phases.get(&key(namespace, name)).cloned())
    }
}
