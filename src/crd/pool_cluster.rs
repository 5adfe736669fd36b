//! CStorPoolCluster CRD
//!
//! The declarative document users write: for each node (picked by a node
//! selector) the RAID groups and the block devices they are built from.

use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{CSPC_FINALIZER, DISABLE_RECONCILE_ANNOTATION, HOSTNAME_LABEL, LEASE_ANNOTATION};

// =============================================================================
// CStorPoolCluster CRD
// =============================================================================

/// CStorPoolCluster enumerates the per-node cStor pools that should exist.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorPoolCluster",
    plural = "cstorpoolclusters",
    shortname = "cspc",
    status = "CStorPoolClusterStatus",
    printcolumn = r#"{"name": "Desired", "type": "integer", "jsonPath": ".status.desiredPools"}"#,
    printcolumn = r#"{"name": "Provisioned", "type": "integer", "jsonPath": ".status.provisionedPools"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolClusterSpec {
    /// Pools to create, one per node
    #[serde(default)]
    pub pools: Vec<PoolSpec>,

    /// Default compute resources for the cstor-pool container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Default compute resources for the side car containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_resources: Option<ResourceRequirements>,

    /// Default tolerations for pool pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Default priority class for pool pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Disruption budget kept over the cluster's pool pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PoolDisruptionBudget>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Disruption budget over the pool pods of one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolDisruptionBudget {
    /// Pool pods that must stay available; 0 removes the budget
    #[serde(default)]
    pub min_available: i32,
}

/// Desired pool on a single node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Labels selecting the node; expected to match exactly one node
    /// through the hostname label
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// RAID groups making up the pool, in order
    #[serde(default)]
    pub raid_groups: Vec<RaidGroup>,

    /// Pool level settings
    #[serde(default)]
    pub pool_config: PoolConfig,
}

/// Pool level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// RAID type for groups that do not declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_raid_group_type: Option<RaidGroupType>,

    /// Cache file used for faster pool imports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<String>,

    /// Enable over provisioning
    #[serde(default)]
    pub over_provisioning: bool,

    /// Compression algorithm (lz, off)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    /// Compute resources for the cstor-pool container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Compute resources for the side car containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_resources: Option<ResourceRequirements>,

    /// Tolerations for the pool pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Priority class for the pool pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

/// A set of block devices with a redundancy type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RaidGroup {
    /// RAID type; falls back to the pool's default type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub raid_type: Option<RaidGroupType>,

    /// Use this group as write cache
    #[serde(default)]
    pub is_write_cache: bool,

    /// Use this group as spare
    #[serde(default)]
    pub is_spare: bool,

    /// Use this group as read cache
    #[serde(default)]
    pub is_read_cache: bool,

    /// Block devices in this group, in order
    #[serde(default)]
    pub block_devices: Vec<BlockDeviceRef>,
}

/// Reference to a block device by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceRef {
    /// Name of the BlockDevice object
    pub block_device_name: String,

    /// Capacity, filled in by the system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    /// Device link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_link: Option<String>,
}

impl BlockDeviceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            block_device_name: name.into(),
            ..Default::default()
        }
    }
}

/// Supported RAID group types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RaidGroupType {
    Stripe,
    Mirror,
    Raidz,
    Raidz2,
    /// Any type this operator does not know; rejected at validation
    #[serde(other)]
    Unknown,
}

impl RaidGroupType {
    /// Number of devices the type requires. For stripe this is the minimum,
    /// for every other type the exact count.
    pub fn required_devices(&self) -> usize {
        match self {
            RaidGroupType::Stripe => 1,
            RaidGroupType::Mirror => 2,
            RaidGroupType::Raidz => 3,
            RaidGroupType::Raidz2 => 6,
            RaidGroupType::Unknown => 0,
        }
    }

    /// Check a group's device count against the type's arity
    pub fn accepts_device_count(&self, count: usize) -> bool {
        match self {
            RaidGroupType::Stripe => count >= self.required_devices(),
            RaidGroupType::Unknown => false,
            _ => count == self.required_devices(),
        }
    }
}

impl std::fmt::Display for RaidGroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidGroupType::Stripe => write!(f, "stripe"),
            RaidGroupType::Mirror => write!(f, "mirror"),
            RaidGroupType::Raidz => write!(f, "raidz"),
            RaidGroupType::Raidz2 => write!(f, "raidz2"),
            RaidGroupType::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for RaidGroupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(RaidGroupType::Stripe),
            "mirror" => Ok(RaidGroupType::Mirror),
            "raidz" => Ok(RaidGroupType::Raidz),
            "raidz2" => Ok(RaidGroupType::Raidz2),
            other => Err(format!("unsupported raid group type {}", other)),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the CStorPoolCluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of pools declared in the spec
    #[serde(default)]
    pub desired_pools: u32,

    /// Number of pools realized as CStorPool objects
    #[serde(default)]
    pub provisioned_pools: u32,
}

/// Cluster lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Online,
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Online => write!(f, "Online"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl CStorPoolCluster {
    /// Get the cluster name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Check if reconciliation is disabled through the annotation
    pub fn is_reconcile_disabled(&self) -> bool {
        self.annotation(DISABLE_RECONCILE_ANNOTATION) == Some("true")
    }

    /// Check if the cluster is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Check if the cluster carries our finalizer
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == CSPC_FINALIZER))
            .unwrap_or(false)
    }

    /// Raw lease annotation, if any
    pub fn lease_value(&self) -> Option<&str> {
        self.annotation(LEASE_ANNOTATION)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Pool spec targeting the given host
    pub fn pool_for_host(&self, host: &str) -> Option<&PoolSpec> {
        self.spec.pools.iter().find(|p| p.hostname() == Some(host))
    }

    /// Hostnames named by the node selectors, in declared order
    pub fn hostnames(&self) -> Vec<&str> {
        self.spec.pools.iter().filter_map(PoolSpec::hostname).collect()
    }
}

impl PoolSpec {
    /// Hostname the node selector points at
    pub fn hostname(&self) -> Option<&str> {
        self.node_selector
            .get(HOSTNAME_LABEL)
            .map(String::as_str)
            .filter(|h| !h.trim().is_empty())
    }

    /// Resolved RAID type of a group, falling back to the pool default
    pub fn raid_type_of(&self, group: &RaidGroup) -> Option<RaidGroupType> {
        group.raid_type.or(self.pool_config.default_raid_group_type)
    }

    /// Flattened, order preserving list of device names
    pub fn block_device_names(&self) -> Vec<String> {
        self.raid_groups
            .iter()
            .flat_map(|g| g.block_devices.iter())
            .map(|bd| bd.block_device_name.clone())
            .collect()
    }

    /// RAID groups with every missing type filled from the pool default
    pub fn resolved_raid_groups(&self) -> Vec<RaidGroup> {
        self.raid_groups
            .iter()
            .map(|g| {
                let mut group = g.clone();
                group.raid_type = self.raid_type_of(g);
                group
            })
            .collect()
    }
}

impl RaidGroup {
    pub fn new(raid_type: Option<RaidGroupType>, devices: &[&str]) -> Self {
        Self {
            raid_type,
            block_devices: devices.iter().map(|d| BlockDeviceRef::new(*d)).collect(),
            ..Default::default()
        }
    }

    /// Device names in this group, in order
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.block_devices.iter().map(|bd| bd.block_device_name.as_str())
    }

    /// Groups are the same group when they share at least one device
    pub fn shares_device_with(&self, other: &RaidGroup) -> bool {
        self.device_names()
            .any(|name| other.device_names().any(|o| o == name))
    }
}
