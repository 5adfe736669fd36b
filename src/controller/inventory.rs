//! Inventory Adapter
//!
//! Read-only lookups over block devices and their claims, scoped to the
//! operator namespace. Nothing here mutates the cluster.

use crate::crd::{cluster_selector, BlockDevice, BlockDeviceClaim};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};

pub struct Inventory<'a> {
    api: &'a dyn ClusterApi,
    namespace: &'a str,
}

impl<'a> Inventory<'a> {
    pub fn new(api: &'a dyn ClusterApi, namespace: &'a str) -> Self {
        Self { api, namespace }
    }

    /// Look up a device by name, failing with `DeviceNotFound`
    pub async fn lookup_device(&self, name: &str) -> Result<BlockDevice> {
        match self.api.get_block_device(self.namespace, name).await {
            Err(e) if e.is_not_found() => Err(Error::DeviceNotFound {
                device: name.to_string(),
            }),
            other => other,
        }
    }

    /// Claim bound to the named device; `None` while the device is free.
    ///
    /// A device pointing at a claim that does not exist fails with
    /// `ClaimPending`.
    pub async fn lookup_claim(&self, device_name: &str) -> Result<Option<BlockDeviceClaim>> {
        let device = self.lookup_device(device_name).await?;
        self.claim_of(&device).await
    }

    /// Claim bound to an already fetched device
    pub async fn claim_of(&self, device: &BlockDevice) -> Result<Option<BlockDeviceClaim>> {
        let Some(claim_name) = device.claim_name() else {
            return Ok(None);
        };
        match self.api.get_claim(self.namespace, claim_name).await {
            Ok(claim) => Ok(Some(claim)),
            Err(e) if e.is_not_found() => Err(Error::ClaimPending {
                device: device.name().to_string(),
                claim: claim_name.to_string(),
                pending: 1,
            }),
            Err(e) => Err(e),
        }
    }

    /// Every claim labelled with the named cluster
    pub async fn list_claims_for_cluster(&self, cspc_name: &str) -> Result<Vec<BlockDeviceClaim>> {
        self.api
            .list_claims(self.namespace, &cluster_selector(cspc_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::{BlockDeviceClaimSpec, BlockDeviceSpec, CSPC_LABEL};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::ObjectReference;
    use std::collections::BTreeMap;

    const NS: &str = "openebs";

    #[tokio::test]
    async fn test_lookups() {
        let store = InMemoryCluster::new();
        store.add_block_device(NS, BlockDevice::new("bd-free", BlockDeviceSpec::default()));
        store.add_block_device(
            NS,
            BlockDevice::new(
                "bd-dangling",
                BlockDeviceSpec {
                    claim_ref: Some(ObjectReference {
                        name: Some("bdc-gone".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
        );
        store.add_block_device(NS, BlockDevice::new("bd-taken", BlockDeviceSpec::default()));
        let mut claim = BlockDeviceClaim::new(
            "bdc-taken",
            BlockDeviceClaimSpec {
                block_device_name: "bd-taken".into(),
                ..Default::default()
            },
        );
        claim.metadata.labels = Some(BTreeMap::from([(CSPC_LABEL.to_string(), "cspc-a".to_string())]));
        store.add_claim(NS, claim);

        let inventory = Inventory::new(&store, NS);

        assert_matches!(
            inventory.lookup_device("bd-missing").await,
            Err(Error::DeviceNotFound { .. })
        );
        assert!(inventory.lookup_claim("bd-free").await.unwrap().is_none());
        assert_matches!(
            inventory.lookup_claim("bd-dangling").await,
            Err(Error::ClaimPending { .. })
        );

        let claim = inventory.lookup_claim("bd-taken").await.unwrap().unwrap();
        assert!(claim.belongs_to("cspc-a"));

        assert_eq!(inventory.list_claims_for_cluster("cspc-a").await.unwrap().len(), 1);
        assert!(inventory.list_claims_for_cluster("cspc-b").await.unwrap().is_empty());
    }
}
