//! CStorPool CRD
//!
//! One realized pool per node, created and updated by the operator from a
//! [`PoolSpec`](super::PoolSpec) of its owning cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{PoolConfig, RaidGroup, CSPC_LABEL};

// =============================================================================
// CStorPool CRD
// =============================================================================

/// CStorPool is the realized pool on a single node
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha2",
    kind = "CStorPool",
    plural = "cstorpools",
    shortname = "csp",
    status = "CStorPoolStatus",
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.hostName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolSpec {
    /// Node hosting the pool
    pub host_name: String,

    /// Pool level settings copied from the cluster spec
    #[serde(default)]
    pub pool_config: PoolConfig,

    /// RAID groups of the pool; types always resolved
    #[serde(default)]
    pub raid_groups: Vec<RaidGroup>,
}

/// Status of a CStorPool, written by the pool manager on the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolStatus {
    #[serde(default)]
    pub phase: PoolPhase,
}

/// Pool phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Init,
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Init => write!(f, "Init"),
            PoolPhase::Online => write!(f, "Online"),
            PoolPhase::Degraded => write!(f, "Degraded"),
            PoolPhase::Offline => write!(f, "Offline"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl CStorPool {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// Name of the owning cluster, taken from the cluster label
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CSPC_LABEL))
            .map(String::as_str)
    }

    /// Device names across every group, in order
    pub fn block_device_names(&self) -> Vec<String> {
        self.spec
            .raid_groups
            .iter()
            .flat_map(|g| g.block_devices.iter())
            .map(|bd| bd.block_device_name.clone())
            .collect()
    }

    /// Check whether the pool already uses the named device
    pub fn has_block_device(&self, name: &str) -> bool {
        self.spec
            .raid_groups
            .iter()
            .any(|g| g.device_names().any(|d| d == name))
    }
}
