//! Kubernetes API adapter
//!
//! Every call is bounded by the request timeout and its error classified at
//! this boundary, so callers only ever see typed [`Error`] variants.

use crate::crd::{BlockDevice, BlockDeviceClaim, CStorPool, CStorPoolCluster, CStorPoolClusterStatus};
use crate::domain::ports::{ClaimApi, InventoryApi, PodApi, PoolApi, PoolClusterApi, WorkloadApi};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Adapter backed by a live API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    request_timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run one API call under the request deadline
    async fn call<T, F>(&self, kind: &str, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(kind, name, error = %e, "API call failed");
                Err(Error::from_kube(e, kind, name))
            }
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }
}

fn object_name(meta: &kube::api::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

// =============================================================================
// Inventory
// =============================================================================

#[async_trait]
impl InventoryApi for KubeCluster {
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice> {
        let api: Api<BlockDevice> = self.api(namespace);
        self.call("BlockDevice", name, api.get(name)).await
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim> {
        let api: Api<BlockDeviceClaim> = self.api(namespace);
        self.call("BlockDeviceClaim", name, api.get(name)).await
    }

    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<BlockDeviceClaim>> {
        let api: Api<BlockDeviceClaim> = self.api(namespace);
        let lp = ListParams::default().labels(selector);
        let list = self.call("BlockDeviceClaim", selector, api.list(&lp)).await?;
        Ok(list.items)
    }
}

// =============================================================================
// Claims
// =============================================================================

#[async_trait]
impl ClaimApi for KubeCluster {
    async fn create_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let api: Api<BlockDeviceClaim> = self.api(namespace);
        let name = object_name(&claim.metadata);
        self.call("BlockDeviceClaim", name, api.create(&PostParams::default(), claim))
            .await
    }

    async fn replace_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim> {
        let api: Api<BlockDeviceClaim> = self.api(namespace);
        let name = object_name(&claim.metadata);
        self.call(
            "BlockDeviceClaim",
            name,
            api.replace(name, &PostParams::default(), claim),
        )
        .await
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<BlockDeviceClaim> = self.api(namespace);
        self.call("BlockDeviceClaim", name, api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }
}

// =============================================================================
// Pool Clusters
// =============================================================================

#[async_trait]
impl PoolClusterApi for KubeCluster {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<CStorPoolCluster> {
        let api: Api<CStorPoolCluster> = self.api(namespace);
        self.call("CStorPoolCluster", name, api.get(name)).await
    }

    async fn replace_cluster(&self, namespace: &str, cspc: &CStorPoolCluster) -> Result<CStorPoolCluster> {
        let api: Api<CStorPoolCluster> = self.api(namespace);
        let name = object_name(&cspc.metadata);
        self.call(
            "CStorPoolCluster",
            name,
            api.replace(name, &PostParams::default(), cspc),
        )
        .await
    }

    async fn json_patch_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<CStorPoolCluster> {
        let api: Api<CStorPoolCluster> = self.api(namespace);
        let patch = Patch::Json::<()>(patch.clone());
        self.call(
            "CStorPoolCluster",
            name,
            api.patch(name, &PatchParams::default(), &patch),
        )
        .await
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CStorPoolClusterStatus,
    ) -> Result<()> {
        let api: Api<CStorPoolCluster> = self.api(namespace);
        let body = serde_json::json!({ "status": status });
        self.call(
            "CStorPoolCluster",
            name,
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body)),
        )
        .await
        .map(|_| ())
    }
}

// =============================================================================
// Pools
// =============================================================================

#[async_trait]
impl PoolApi for KubeCluster {
    async fn list_pools(&self, namespace: &str, selector: &str) -> Result<Vec<CStorPool>> {
        let api: Api<CStorPool> = self.api(namespace);
        let lp = ListParams::default().labels(selector);
        let list = self.call("CStorPool", selector, api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool> {
        let api: Api<CStorPool> = self.api(namespace);
        let name = object_name(&pool.metadata);
        self.call("CStorPool", name, api.create(&PostParams::default(), pool))
            .await
    }

    async fn replace_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool> {
        let api: Api<CStorPool> = self.api(namespace);
        let name = object_name(&pool.metadata);
        self.call("CStorPool", name, api.replace(name, &PostParams::default(), pool))
            .await
    }

    async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<CStorPool> = self.api(namespace);
        self.call("CStorPool", name, api.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }
}

// =============================================================================
// Workloads
// =============================================================================

#[async_trait]
impl WorkloadApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = self.api(namespace);
        self.call("Deployment", name, api.get_opt(name)).await
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment> {
        let api: Api<Deployment> = self.api(namespace);
        let name = object_name(&deployment.metadata);
        self.call(
            "Deployment",
            name,
            api.create(&PostParams::default(), deployment),
        )
        .await
    }

    async fn list_disruption_budgets(&self, namespace: &str, selector: &str) -> Result<Vec<PodDisruptionBudget>> {
        let api: Api<PodDisruptionBudget> = self.api(namespace);
        let lp = ListParams::default().labels(selector);
        let list = self.call("PodDisruptionBudget", selector, api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<PodDisruptionBudget> {
        let api: Api<PodDisruptionBudget> = self.api(namespace);
        let name = object_name(&budget.metadata);
        self.call(
            "PodDisruptionBudget",
            name,
            api.create(&PostParams::default(), budget),
        )
        .await
    }

    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PodDisruptionBudget> = self.api(namespace);
        self.call(
            "PodDisruptionBudget",
            name,
            api.delete(name, &DeleteParams::default()),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl PodApi for KubeCluster {
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Pod> = self.api(namespace);
        let pod = self.call("Pod", name, api.get_opt(name)).await?;
        Ok(pod.and_then(|p| p.status).and_then(|s| s.phase))
    }
}
