//! BlockDevice and BlockDeviceClaim CRDs
//!
//! Both kinds belong to the external device discovery component. They are
//! modelled here only as far as the operator reads or writes them.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{CSPC_FINALIZER, CSPC_LABEL, HOSTNAME_LABEL};

/// Resource key under which a claim requests capacity
pub const STORAGE_RESOURCE: &str = "storage";

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// A disk discovered on one node
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "NodeName", "type": "string", "jsonPath": ".spec.nodeAttributes.nodeName"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacity.storage"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.state"}"#,
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    #[serde(default)]
    pub node_attributes: NodeAttributes,

    /// Device path on the node
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub capacity: DeviceCapacity,

    /// Claim bound to this device, set by the discovery component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devlinks: Vec<DeviceLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Size in bytes
    #[serde(default)]
    pub storage: u64,

    #[serde(default)]
    pub physical_sector_size: u32,

    #[serde(default)]
    pub logical_sector_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLink {
    /// Link kind (by-id, by-path)
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    #[serde(default)]
    pub claim_state: ClaimState,

    /// Device state reported by discovery (Active, Inactive, Unknown)
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Released,
    Claimed,
}

impl BlockDevice {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// Hostname of the node owning the device. The hostname label wins over
    /// the node attributes.
    pub fn hostname(&self) -> &str {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(HOSTNAME_LABEL))
            .map(String::as_str)
            .unwrap_or(self.spec.node_attributes.node_name.as_str())
    }

    /// Name of the claim bound to this device, if any
    pub fn claim_name(&self) -> Option<&str> {
        self.spec
            .claim_ref
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_name().is_some()
    }

    /// Name of the claim this operator creates for the device
    pub fn claim_name_for(&self) -> Option<String> {
        self.uid().map(|uid| format!("bdc-{}", uid))
    }
}

// =============================================================================
// BlockDeviceClaim CRD
// =============================================================================

/// A reservation binding one device to a consumer
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDeviceClaim",
    plural = "blockdeviceclaims",
    shortname = "bdc",
    status = "BlockDeviceClaimStatus",
    printcolumn = r#"{"name": "BlockDeviceName", "type": "string", "jsonPath": ".spec.blockDeviceName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimSpec {
    #[serde(default)]
    pub resources: ClaimResources,

    /// Device to bind
    #[serde(default)]
    pub block_device_name: String,

    /// Node the device lives on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_device_node_attributes: Option<NodeAttributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResources {
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
}

impl BlockDeviceClaim {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Name of the cluster the claim was made for
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CSPC_LABEL))
            .map(String::as_str)
    }

    pub fn belongs_to(&self, cspc_name: &str) -> bool {
        self.cluster_name() == Some(cspc_name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|f| f == CSPC_FINALIZER))
            .unwrap_or(false)
    }

    /// Drop the cluster finalizer, returning whether anything changed
    pub fn remove_finalizer(&mut self) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(finalizers) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != CSPC_FINALIZER);
                before != finalizers.len()
            }
            None => false,
        }
    }
}
