//! Custom Resource Definitions for the CStor Pool Operator
//!
//! This module contains all CRD types:
//! - CStorPoolCluster: desired per-node pools, written by users
//! - CStorPool: one realized pool per node, written by the operator
//! - BlockDevice / BlockDeviceClaim: disk inventory and reservations,
//!   owned by the external device discovery component

pub mod block_device;
pub mod pool;
pub mod pool_cluster;

pub use block_device::*;
pub use pool::*;
pub use pool_cluster::*;

// Re-export common types for convenience
pub use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

// =============================================================================
// Well-known keys
// =============================================================================

/// Label carried by every CStorPool and BlockDeviceClaim created for a cluster
pub const CSPC_LABEL: &str = "openebs.io/cstor-pool-cluster";

/// Label naming the pool served by a pool deployment
pub const CSP_LABEL: &str = "openebs.io/cstor-pool";

/// Node hostname label, consumed from node selectors and block devices
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Operator version label stamped on created pools
pub const VERSION_LABEL: &str = "openebs.io/version";

/// Annotation carrying the per-cluster lease
pub const LEASE_ANNOTATION: &str = "openebs.io/cspc-lease";

/// Annotation disabling reconciliation when set to "true"
pub const DISABLE_RECONCILE_ANNOTATION: &str = "openebs.io/disable-reconcile";

/// Finalizer held by a cluster and by every claim it owns
pub const CSPC_FINALIZER: &str = "cstorpoolcluster.openebs.io/finalizer";

/// Render a label map as a `k=v,k=v` selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector matching every object owned by the named cluster
pub fn cluster_selector(cspc_name: &str) -> String {
    format!("{}={}", CSPC_LABEL, cspc_name)
}

/// Controller owner reference to `owner` that also blocks its foreground
/// deletion until the dependent is gone. `None` while `owner` has no uid.
pub fn controller_owner<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).map(|mut reference| {
        reference.block_owner_deletion = Some(true);
        reference
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert(HOSTNAME_LABEL.to_string(), "node-1".to_string());
        labels.insert("zone".to_string(), "a".to_string());
        assert_eq!(label_selector(&labels), "kubernetes.io/hostname=node-1,zone=a");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_controller_owner_blocks_deletion() {
        let mut cspc = CStorPoolCluster::new("cspc-a", CStorPoolClusterSpec::default());
        assert!(controller_owner(&cspc).is_none());

        cspc.metadata.uid = Some("cspc-uid".into());
        let owner = controller_owner(&cspc).unwrap();
        assert_eq!(owner.kind, "CStorPoolCluster");
        assert_eq!(owner.uid, "cspc-uid");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn test_cluster_selector() {
        assert_eq!(
            cluster_selector("cspc-mirror"),
            "openebs.io/cstor-pool-cluster=cspc-mirror"
        );
    }
}
