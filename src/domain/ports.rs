//! Domain Ports - Core trait definitions for the pool operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! the cluster API. Adapters implement them against a live API server or an
//! in-memory object store.

use crate::crd::{BlockDevice, BlockDeviceClaim, CStorPool, CStorPoolCluster, CStorPoolClusterStatus};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Inventory Port
// =============================================================================

/// Read-only access to the device inventory
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Get a block device, failing with `ResourceNotFound` when absent
    async fn get_block_device(&self, namespace: &str, name: &str) -> Result<BlockDevice>;

    /// Get a claim by name, failing with `ResourceNotFound` when absent
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<BlockDeviceClaim>;

    /// List claims matching a `k=v,k=v` label selector
    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<BlockDeviceClaim>>;
}

// =============================================================================
// Claim Port
// =============================================================================

#[async_trait]
pub trait ClaimApi: Send + Sync {
    async fn create_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim>;

    /// Full update, honoring the resource version carried by `claim`
    async fn replace_claim(&self, namespace: &str, claim: &BlockDeviceClaim) -> Result<BlockDeviceClaim>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Pool Cluster Port
// =============================================================================

#[async_trait]
pub trait PoolClusterApi: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<CStorPoolCluster>;

    /// Full update, honoring the resource version carried by `cspc`
    async fn replace_cluster(&self, namespace: &str, cspc: &CStorPoolCluster) -> Result<CStorPoolCluster>;

    /// Apply an RFC 6902 patch to the cluster object
    async fn json_patch_cluster(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<CStorPoolCluster>;

    /// Merge patch the status subresource
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CStorPoolClusterStatus,
    ) -> Result<()>;
}

// =============================================================================
// Pool Port
// =============================================================================

#[async_trait]
pub trait PoolApi: Send + Sync {
    async fn list_pools(&self, namespace: &str, selector: &str) -> Result<Vec<CStorPool>>;

    async fn create_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool>;

    /// Full update, honoring the resource version carried by `pool`
    async fn replace_pool(&self, namespace: &str, pool: &CStorPool) -> Result<CStorPool>;

    async fn delete_pool(&self, namespace: &str, name: &str) -> Result<()>;
}

// =============================================================================
// Workload Ports
// =============================================================================

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Get a deployment, `None` when absent
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment>;

    /// List disruption budgets matching a `k=v,k=v` label selector
    async fn list_disruption_budgets(&self, namespace: &str, selector: &str) -> Result<Vec<PodDisruptionBudget>>;

    async fn create_disruption_budget(
        &self,
        namespace: &str,
        budget: &PodDisruptionBudget,
    ) -> Result<PodDisruptionBudget>;

    async fn delete_disruption_budget(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait PodApi: Send + Sync {
    /// Phase of the named pod, `None` when the pod does not exist
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

/// Everything the reconciler needs from the cluster
pub trait ClusterApi: InventoryApi + ClaimApi + PoolClusterApi + PoolApi + WorkloadApi + PodApi {}

impl<T> ClusterApi for T where T: InventoryApi + ClaimApi + PoolClusterApi + PoolApi + WorkloadApi + PodApi
{}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Kubernetes event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// An event recorded against a pool cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvent {
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub note: String,
}

impl PoolEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            type_: EventType::Normal,
            action: reason.clone(),
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            type_: EventType::Warning,
            action: reason.clone(),
            reason,
            note: note.into(),
        }
    }
}

/// Fire-and-forget event sink; publishing never fails the caller
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, event: PoolEvent);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        let event = PoolEvent::warning("DownScale", "failed to delete pool");
        assert_eq!(event.type_, EventType::Warning);
        assert_eq!(event.reason, "DownScale");
        assert_eq!(event.action, "DownScale");

        let event = PoolEvent::normal("Create", "Pool Provisioned 1/3");
        assert_eq!(format!("{}", event.type_), "Normal");
    }
}
