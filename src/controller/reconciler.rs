//! Pool Reconciler
//!
//! One pass over one pool cluster key. A pass first observes, read-only,
//! what the cluster needs; only when there is mutating work does it take the
//! per-cluster lease and act. A pass over a converged cluster writes
//! nothing.

use crate::algorithm::expansion::replace_block_devices;
use crate::algorithm::{
    device_reference_counts, orphan_pools, plan_expansion, select_pools, validate_pool_spec,
    ExpansionPlan, SelectedPool,
};
use crate::cluster::events::reasons;
use crate::cluster::BoundedPublisher;
use crate::config::OperatorConfig;
use crate::controller::claim::ClaimCoordinator;
use crate::controller::deletion::{downscale_pool, finalize_cluster};
use crate::controller::deployment::ensure_pool_deployment;
use crate::controller::disruption::{apply_budget_change, observe_disruption_budget, BudgetChange};
use crate::controller::lease::PoolLease;
use crate::crd::{
    cluster_selector, controller_owner, CStorPool, CStorPoolCluster, CStorPoolClusterStatus, CStorPoolSpec,
    ClusterPhase, CSPC_FINALIZER, CSPC_LABEL, DISABLE_RECONCILE_ANNOTATION, VERSION_LABEL,
};
use crate::domain::ports::{ClusterApi, ClusterApiRef, EventPublisherRef, PoolEvent};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cluster no longer exists
    Missing,
    /// The operator namespace is not configured
    NamespaceUnset,
    /// Reconciliation is disabled by annotation
    Disabled,
    /// The cluster is being deleted; finalizers were released
    Deleted,
    /// Nothing to do
    Idle,
    /// Mutating work was performed under the lease
    Reconciled,
}

/// Everything one pass observed before acting
#[derive(Default)]
struct Observation {
    pending: Vec<SelectedPool>,
    missing_deployments: Vec<CStorPool>,
    expansions: Vec<(CStorPool, ExpansionPlan)>,
    orphans: Vec<CStorPool>,
    budget: Option<BudgetChange>,
}

impl Observation {
    fn has_work(&self) -> bool {
        !self.pending.is_empty()
            || !self.missing_deployments.is_empty()
            || !self.expansions.is_empty()
            || !self.orphans.is_empty()
            || self.budget.is_some()
    }
}

pub struct PoolReconciler {
    api: ClusterApiRef,
    events: EventPublisherRef,
    config: OperatorConfig,
    metrics: Metrics,
}

impl PoolReconciler {
    /// Every publish is bounded by `config.event_timeout`, so a stalled
    /// event sink cannot hold a pass and its lease.
    pub fn new(api: ClusterApiRef, events: EventPublisherRef, config: OperatorConfig, metrics: Metrics) -> Self {
        let events: EventPublisherRef = Arc::new(BoundedPublisher::new(events, config.event_timeout));
        Self {
            api,
            events,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    async fn publish(&self, cspc: &CStorPoolCluster, event: PoolEvent) {
        self.events.publish(&cspc.object_ref(&()), event).await;
    }

    /// Reconcile the cluster named by `key` (`namespace/name`)
    #[instrument(skip(self), fields(cspc = %key))]
    pub async fn sync_key(&self, key: &str) -> Result<SyncOutcome> {
        let (cspc_namespace, name) = key
            .split_once('/')
            .ok_or_else(|| Error::Internal(format!("invalid key {}", key)))?;

        let cspc = match self.api().get_cluster(cspc_namespace, name).await {
            Ok(cspc) => cspc,
            Err(e) if e.is_not_found() => {
                debug!("cluster is gone");
                return Ok(SyncOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let Some(namespace) = self.config.operator_namespace().map(str::to_string) else {
            self.publish(
                &cspc,
                PoolEvent::warning(
                    reasons::GETTING_NAMESPACE,
                    "Could not sync cluster: operator namespace is not set",
                ),
            )
            .await;
            return Ok(SyncOutcome::NamespaceUnset);
        };

        if cspc.is_reconcile_disabled() {
            return self.report_disabled(&cspc, &namespace).await;
        }

        if cspc.is_deleting() {
            return self.delete(cspc, &namespace).await;
        }

        let cspc = self.ensure_finalizer(cspc).await?;
        let observed = self.observe(&cspc, &namespace).await?;

        if !observed.has_work() {
            self.update_status(&cspc, &namespace).await?;
            return Ok(SyncOutcome::Idle);
        }

        let holder = self
            .config
            .lease_holder()
            .ok_or_else(|| Error::Configuration("operator namespace is not set".to_string()))?;
        let lease = PoolLease::new(self.api(), holder);
        let grant = lease.hold(&cspc).await?;
        if grant.acquired {
            self.metrics.record_lease_transition();
        }

        let failure = self.act(&grant.cspc, &namespace, observed).await;
        lease.release_quietly(&grant.cspc).await;

        self.update_status(&grant.cspc, &namespace).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(SyncOutcome::Reconciled),
        }
    }

    async fn report_disabled(&self, cspc: &CStorPoolCluster, namespace: &str) -> Result<SyncOutcome> {
        let reason = if cspc.is_deleting() {
            reasons::DELETE
        } else if self
            .api()
            .list_pools(namespace, &cluster_selector(cspc.name()))
            .await?
            .is_empty()
        {
            reasons::CREATE
        } else {
            reasons::UPDATE
        };
        info!(reason, "reconcile is disabled");
        self.publish(
            cspc,
            PoolEvent::warning(
                reason,
                format!(
                    "reconcile is disabled via annotation {}",
                    DISABLE_RECONCILE_ANNOTATION
                ),
            ),
        )
        .await;
        Ok(SyncOutcome::Disabled)
    }

    async fn delete(&self, mut cspc: CStorPoolCluster, namespace: &str) -> Result<SyncOutcome> {
        let status = CStorPoolClusterStatus {
            phase: ClusterPhase::Deleting,
            ..cspc.status.clone().unwrap_or_default()
        };
        if cspc.status.as_ref() != Some(&status) {
            let cspc_namespace = cspc.metadata.namespace.clone().unwrap_or_default();
            match self
                .api()
                .patch_cluster_status(&cspc_namespace, cspc.name(), &status)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(SyncOutcome::Missing),
                Err(e) => return Err(e),
            }
            // The status write bumped the resource version
            cspc = self.api().get_cluster(&cspc_namespace, cspc.name()).await?;
        }

        finalize_cluster(self.api(), namespace, &cspc).await?;
        info!("released cluster for deletion");
        Ok(SyncOutcome::Deleted)
    }

    async fn ensure_finalizer(&self, cspc: CStorPoolCluster) -> Result<CStorPoolCluster> {
        if cspc.has_finalizer() {
            return Ok(cspc);
        }
        let mut updated = cspc.clone();
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(CSPC_FINALIZER.to_string());
        let cspc_namespace = cspc.metadata.namespace.as_deref().unwrap_or_default();
        let written = self.api().replace_cluster(cspc_namespace, &updated).await?;
        debug!("added cluster finalizer");
        Ok(written)
    }

    /// Collect the work of this pass without writing anything
    async fn observe(&self, cspc: &CStorPoolCluster, namespace: &str) -> Result<Observation> {
        let pools = self
            .api()
            .list_pools(namespace, &cluster_selector(cspc.name()))
            .await?;

        let selection = select_pools(cspc, &pools);
        for rejected in selection.rejected() {
            warn!(index = rejected.index, selector = %rejected.selector, reason = %rejected.reason, "invalid pool spec");
            self.publish(
                cspc,
                PoolEvent::warning(
                    reasons::CREATE,
                    format!(
                        "Invalid pool spec {} ({}): {}",
                        rejected.index + 1,
                        rejected.selector,
                        rejected.reason
                    ),
                ),
            )
            .await;
        }

        let orphans: Vec<CStorPool> = orphan_pools(cspc, &pools).into_iter().cloned().collect();
        let device_refs = device_reference_counts(cspc);

        let mut observed = Observation {
            pending: selection.pending().to_vec(),
            orphans,
            budget: observe_disruption_budget(self.api(), cspc, namespace).await?,
            ..Default::default()
        };

        for csp in &pools {
            let Some(spec) = cspc.pool_for_host(&csp.spec.host_name) else {
                continue;
            };

            if self.api().get_deployment(namespace, csp.name()).await?.is_none() {
                observed.missing_deployments.push(csp.clone());
            }

            if let Err(e) = validate_pool_spec(spec, &device_refs) {
                warn!(pool = %csp.name(), error = %e, "skipping expansion of invalid pool spec");
                self.publish(
                    cspc,
                    PoolEvent::warning(
                        reasons::UPDATE,
                        format!("Could not update pool {}: {}", csp.name(), e),
                    ),
                )
                .await;
                continue;
            }

            replace_block_devices(spec, csp);
            let plan = plan_expansion(spec, csp);
            if !plan.is_empty() {
                observed.expansions.push((csp.clone(), plan));
            }
        }

        Ok(observed)
    }

    /// Perform the observed work. Every failure is reported as an event and
    /// the pass carries on with the remaining work; the most actionable
    /// error is returned for requeue.
    async fn act(&self, cspc: &CStorPoolCluster, namespace: &str, observed: Observation) -> Option<Error> {
        let mut failure = None;

        let total = observed.pending.len();
        for (i, selected) in observed.pending.iter().enumerate() {
            match self.provision(cspc, namespace, selected).await {
                Ok(csp) => {
                    self.metrics.record_pool_provisioned();
                    info!(pool = %csp.name(), host = %selected.hostname, "pool provisioned {}/{}", i + 1, total);
                    self.publish(
                        cspc,
                        PoolEvent::normal(reasons::CREATE, format!("Pool Provisioned {}/{}", i + 1, total)),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(host = %selected.hostname, error = %e, "pool provisioning failed {}/{}", i + 1, total);
                    self.publish(
                        cspc,
                        PoolEvent::warning(
                            reasons::CREATE,
                            format!("Pool provisioning failed for {}/{}: {}", i + 1, total, e),
                        ),
                    )
                    .await;
                    remember(&mut failure, e);
                }
            }
        }

        for csp in &observed.missing_deployments {
            if let Err(e) = ensure_pool_deployment(self.api(), csp, cspc, namespace, &self.config).await {
                warn!(pool = %csp.name(), error = %e, "pool deployment creation failed");
                self.publish(
                    cspc,
                    PoolEvent::warning(
                        reasons::POOL_DEPLOYMENT_CREATE,
                        format!("Failed to create pool deployment for {}: {}", csp.name(), e),
                    ),
                )
                .await;
                remember(&mut failure, e);
            }
        }

        for (csp, plan) in &observed.expansions {
            match self.expand(cspc, namespace, csp, plan).await {
                Ok(()) => {
                    self.publish(
                        cspc,
                        PoolEvent::normal(
                            reasons::UPDATE,
                            format!(
                                "Expanded pool {} with {} block device(s)",
                                csp.name(),
                                plan.new_block_devices().len()
                            ),
                        ),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(pool = %csp.name(), error = %e, "pool expansion failed");
                    self.publish(
                        cspc,
                        PoolEvent::warning(
                            reasons::UPDATE,
                            format!("Failed to expand pool {}: {}", csp.name(), e),
                        ),
                    )
                    .await;
                    remember(&mut failure, e);
                }
            }
        }

        for csp in &observed.orphans {
            if let Err(e) = downscale_pool(self.api(), self.events.as_ref(), namespace, cspc, csp).await {
                remember(&mut failure, e);
            }
        }

        if let Some(change) = &observed.budget {
            if let Err(e) = apply_budget_change(self.api(), namespace, change).await {
                warn!(change = %change.describe(), error = %e, "pod disruption budget update failed");
                self.publish(
                    cspc,
                    PoolEvent::warning(
                        reasons::UPDATE,
                        format!("Failed to {} pod disruption budget: {}", change.describe(), e),
                    ),
                )
                .await;
                remember(&mut failure, e);
            }
        }

        failure
    }

    /// Claims, then the pool once every claim is bound, then its Deployment
    async fn provision(&self, cspc: &CStorPoolCluster, namespace: &str, selected: &SelectedPool) -> Result<CStorPool> {
        ClaimCoordinator::new(self.api(), namespace, cspc)
            .on_host(&selected.hostname)
            .claim_devices(&selected.block_devices)
            .await?
            .ensure_bound()?;

        let csp = build_pool(cspc, namespace, selected)?;
        let csp = match self.api().create_pool(namespace, &csp).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => self
                .api()
                .list_pools(namespace, &cluster_selector(cspc.name()))
                .await?
                .into_iter()
                .find(|p| p.metadata.name == csp.metadata.name)
                .ok_or(e)?,
            Err(e) => return Err(e),
        };

        ensure_pool_deployment(self.api(), &csp, cspc, namespace, &self.config).await?;
        Ok(csp)
    }

    /// Claim the new devices, then write the grown pool in one update
    async fn expand(
        &self,
        cspc: &CStorPoolCluster,
        namespace: &str,
        csp: &CStorPool,
        plan: &ExpansionPlan,
    ) -> Result<()> {
        ClaimCoordinator::new(self.api(), namespace, cspc)
            .on_host(&csp.spec.host_name)
            .claim_devices(&plan.new_block_devices())
            .await?
            .ensure_bound()?;

        let mut grown = csp.clone();
        plan.apply(&mut grown);
        self.api().replace_pool(namespace, &grown).await?;
        info!(
            pool = %csp.name(),
            new_groups = plan.new_groups.len(),
            grown_groups = plan.grown_groups.len(),
            "expanded pool"
        );
        Ok(())
    }

    /// Write desired and provisioned counts when they changed
    async fn update_status(&self, cspc: &CStorPoolCluster, namespace: &str) -> Result<()> {
        let provisioned = self
            .api()
            .list_pools(namespace, &cluster_selector(cspc.name()))
            .await?
            .len() as u32;
        let desired = cspc.spec.pools.len() as u32;
        let status = CStorPoolClusterStatus {
            phase: if provisioned == desired {
                ClusterPhase::Online
            } else {
                ClusterPhase::Pending
            },
            desired_pools: desired,
            provisioned_pools: provisioned,
        };
        if cspc.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let cspc_namespace = cspc.metadata.namespace.as_deref().unwrap_or_default();
        match self
            .api()
            .patch_cluster_status(cspc_namespace, cspc.name(), &status)
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Keep the error most worth a retry
fn remember(slot: &mut Option<Error>, error: Error) {
    let replace = match slot {
        None => true,
        Some(kept) => !kept.is_retryable() && error.is_retryable(),
    };
    if replace {
        *slot = Some(error);
    }
}

/// Pool object for a selected pool spec, owned by the cluster
pub fn build_pool(cspc: &CStorPoolCluster, namespace: &str, selected: &SelectedPool) -> Result<CStorPool> {
    let owner = controller_owner(cspc)
        .ok_or_else(|| Error::Internal(format!("cstorpoolcluster {} has no uid", cspc.name())))?;

    let mut csp = CStorPool::new(
        &pool_name(cspc.name(), &selected.hostname),
        CStorPoolSpec {
            host_name: selected.hostname.clone(),
            pool_config: selected.spec.pool_config.clone(),
            raid_groups: selected.spec.raid_groups.clone(),
        },
    );
    csp.metadata.namespace = Some(namespace.to_string());
    csp.metadata.labels = Some(BTreeMap::from([
        (CSPC_LABEL.to_string(), cspc.name().to_string()),
        (VERSION_LABEL.to_string(), crate::VERSION.to_string()),
    ]));
    csp.metadata.owner_references = Some(vec![owner]);
    Ok(csp)
}

const NAME_SUFFIX_LEN: usize = 6;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Deterministic pool name: `<cspc>-<fnv1a32(host) as 6 base36 chars>`
pub fn pool_name(cspc_name: &str, hostname: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in hostname.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }

    // 36^6 fits in a u32
    let mut n = hash % 36u32.pow(NAME_SUFFIX_LEN as u32);
    let mut suffix = [b'0'; NAME_SUFFIX_LEN];
    for slot in suffix.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    format!("{}-{}", cspc_name, String::from_utf8_lossy(&suffix))
}
