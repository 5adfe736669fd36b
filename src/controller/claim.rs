//! Claim Coordinator
//!
//! Turns the device list of one pool into block device claims owned by the
//! cluster. Devices already claimed for the same cluster are reused; a device
//! claimed for anything else stops the whole request before any new claim
//! is written.

use crate::controller::inventory::Inventory;
use crate::crd::{
    controller_owner, BlockDevice, BlockDeviceClaim, BlockDeviceClaimSpec, CStorPoolCluster,
    ClaimResources, NodeAttributes, CSPC_FINALIZER, CSPC_LABEL, HOSTNAME_LABEL, STORAGE_RESOURCE,
};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// What a claim request did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimReport {
    /// Claims written by this request
    pub created: Vec<String>,
    /// Devices already claimed for this cluster
    pub reused: Vec<String>,
    /// Claims of ours whose device is not bound to them yet
    pub pending: Vec<PendingClaim>,
}

/// A claim waiting for device discovery to bind its device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingClaim {
    pub device: String,
    pub claim: String,
}

impl ClaimReport {
    /// Fail with `ClaimPending` while any claim is still unbound
    pub fn ensure_bound(&self) -> Result<()> {
        match self.pending.first() {
            Some(first) => Err(Error::ClaimPending {
                device: first.device.clone(),
                claim: first.claim.clone(),
                pending: self.pending.len(),
            }),
            None => Ok(()),
        }
    }
}

pub struct ClaimCoordinator<'a> {
    api: &'a dyn ClusterApi,
    namespace: &'a str,
    cspc: &'a CStorPoolCluster,
    host: Option<&'a str>,
}

impl<'a> ClaimCoordinator<'a> {
    pub fn new(api: &'a dyn ClusterApi, namespace: &'a str, cspc: &'a CStorPoolCluster) -> Self {
        Self {
            api,
            namespace,
            cspc,
            host: None,
        }
    }

    /// Only accept devices attached to `host`
    pub fn on_host(mut self, host: &'a str) -> Self {
        self.host = Some(host);
        self
    }

    /// Claim every named device for the cluster.
    ///
    /// All devices are checked first; claims are only created once every
    /// device is known to be free or already ours. A claim counts as pending
    /// until the device it names points back at it.
    pub async fn claim_devices(&self, devices: &[String]) -> Result<ClaimReport> {
        let inventory = Inventory::new(self.api, self.namespace);
        let mut report = ClaimReport::default();
        let mut unclaimed = Vec::new();

        for name in devices {
            let device = inventory.lookup_device(name).await?;
            self.check_host(&device)?;
            match inventory.claim_of(&device).await? {
                None => unclaimed.push(device),
                Some(claim) if claim.belongs_to(self.cspc.name()) => {
                    report.reused.push(name.clone());
                }
                Some(claim) => {
                    return Err(Error::DeviceBusy {
                        device: name.clone(),
                        claim: claim.name().to_string(),
                    })
                }
            }
        }

        for device in &unclaimed {
            let claim = self.build_claim(device)?;
            let claim_name = claim.name().to_string();
            match self.api.create_claim(self.namespace, &claim).await {
                Ok(_) => {
                    debug!(claim = %claim_name, device = %device.name(), "created claim");
                    report.created.push(claim_name.clone());
                }
                Err(e) if e.is_already_exists() => {
                    let existing = self.api.get_claim(self.namespace, &claim_name).await?;
                    if !existing.belongs_to(self.cspc.name()) {
                        return Err(Error::DeviceBusy {
                            device: device.name().to_string(),
                            claim: claim_name,
                        });
                    }
                    report.reused.push(device.name().to_string());
                }
                Err(e) => return Err(e),
            }

            let current = inventory.lookup_device(device.name()).await?;
            if current.claim_name() != Some(claim_name.as_str()) {
                report.pending.push(PendingClaim {
                    device: device.name().to_string(),
                    claim: claim_name,
                });
            }
        }

        if !report.created.is_empty() {
            info!(
                cspc = %self.cspc.name(),
                created = report.created.len(),
                reused = report.reused.len(),
                pending = report.pending.len(),
                "claimed block devices"
            );
        }
        Ok(report)
    }

    fn check_host(&self, device: &BlockDevice) -> Result<()> {
        match self.host {
            Some(host) if device.hostname() != host => Err(Error::InvalidPoolSpec {
                selector: format!("{}={}", HOSTNAME_LABEL, host),
                reason: format!(
                    "block device {} belongs to node {:?}, not {}",
                    device.name(),
                    device.hostname(),
                    host
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Claim for one device: named after the device uid, labelled and owned
    /// by the cluster, holding the cluster finalizer
    pub fn build_claim(&self, device: &BlockDevice) -> Result<BlockDeviceClaim> {
        let name = device
            .claim_name_for()
            .ok_or_else(|| Error::Internal(format!("block device {} has no uid", device.name())))?;
        let owner = controller_owner(self.cspc).ok_or_else(|| {
            Error::Internal(format!("cstorpoolcluster {} has no uid", self.cspc.name()))
        })?;

        let host = device.hostname().to_string();
        let mut claim = BlockDeviceClaim::new(
            &name,
            BlockDeviceClaimSpec {
                resources: ClaimResources {
                    requests: BTreeMap::from([(
                        STORAGE_RESOURCE.to_string(),
                        Quantity(device.spec.capacity.storage.to_string()),
                    )]),
                },
                block_device_name: device.name().to_string(),
                host_name: Some(host.clone()),
                block_device_node_attributes: Some(NodeAttributes { node_name: host }),
            },
        );
        claim.metadata.namespace = Some(self.namespace.to_string());
        claim.metadata.labels = Some(BTreeMap::from([(
            CSPC_LABEL.to_string(),
            self.cspc.name().to_string(),
        )]));
        claim.metadata.owner_references = Some(vec![owner]);
        claim.metadata.finalizers = Some(vec![CSPC_FINALIZER.to_string()]);
        Ok(claim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::{BlockDeviceSpec, CStorPoolClusterSpec, DeviceCapacity};
    use assert_matches::assert_matches;

    const NS: &str = "openebs";

    fn setup(devices: &[&str]) -> (InMemoryCluster, CStorPoolCluster) {
        let store = InMemoryCluster::new();
        for name in devices {
            store.add_block_device(
                NS,
                BlockDevice::new(
                    name,
                    BlockDeviceSpec {
                        capacity: DeviceCapacity {
                            storage: 10 * 1024 * 1024 * 1024,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                ),
            );
        }
        let cspc = store.add_cluster(NS, CStorPoolCluster::new("cspc-a", CStorPoolClusterSpec::default()));
        (store, cspc)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_claims_free_devices() {
        let (store, cspc) = setup(&["bd-a", "bd-b"]);
        let coordinator = ClaimCoordinator::new(&store, NS, &cspc);

        let report = coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        assert_eq!(report.created, vec!["bdc-bd-a-uid", "bdc-bd-b-uid"]);
        assert!(report.pending.is_empty());
        assert!(report.ensure_bound().is_ok());

        let claim = store.claim(NS, "bdc-bd-a-uid").unwrap();
        assert!(claim.belongs_to("cspc-a"));
        assert!(claim.has_finalizer());
        assert_eq!(
            claim.spec.resources.requests.get(STORAGE_RESOURCE),
            Some(&Quantity("10737418240".into()))
        );
        let owner = &claim.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[tokio::test]
    async fn test_rerun_reuses_claims() {
        let (store, cspc) = setup(&["bd-a", "bd-b"]);
        let coordinator = ClaimCoordinator::new(&store, NS, &cspc);
        coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        store.reset_mutations();

        let report = coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.reused, vec!["bd-a", "bd-b"]);
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_device_blocks_all_claims() {
        let (store, cspc) = setup(&["bd-a", "bd-b"]);
        let other = store.add_cluster(NS, CStorPoolCluster::new("cspc-other", CStorPoolClusterSpec::default()));
        ClaimCoordinator::new(&store, NS, &other)
            .claim_devices(&names(&["bd-b"]))
            .await
            .unwrap();
        store.reset_mutations();

        let coordinator = ClaimCoordinator::new(&store, NS, &cspc);
        let err = coordinator
            .claim_devices(&names(&["bd-a", "bd-b"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DeviceBusy { ref device, .. } if device == "bd-b");
        assert_eq!(store.mutation_count(), 0);
        assert!(store.claim(NS, "bdc-bd-a-uid").is_none());
    }

    #[tokio::test]
    async fn test_missing_device() {
        let (store, cspc) = setup(&["bd-a"]);
        let coordinator = ClaimCoordinator::new(&store, NS, &cspc);
        assert_matches!(
            coordinator.claim_devices(&names(&["bd-a", "bd-x"])).await,
            Err(Error::DeviceNotFound { .. })
        );
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_device_on_other_node_is_rejected() {
        let (store, cspc) = setup(&[]);
        for (name, host) in [("bd-a", "node-1"), ("bd-b", "node-2")] {
            let mut device = BlockDevice::new(name, BlockDeviceSpec::default());
            device.spec.node_attributes.node_name = host.to_string();
            store.add_block_device(NS, device);
        }

        let coordinator = ClaimCoordinator::new(&store, NS, &cspc).on_host("node-1");
        let err = coordinator
            .claim_devices(&names(&["bd-a", "bd-b"]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidPoolSpec { ref reason, .. } if reason.contains("bd-b"));
        assert_eq!(store.mutation_count(), 0);

        let report = coordinator.claim_devices(&names(&["bd-a"])).await.unwrap();
        assert_eq!(report.created, vec!["bdc-bd-a-uid"]);
    }

    #[tokio::test]
    async fn test_unbound_claims_are_pending() {
        let (store, cspc) = setup(&["bd-a", "bd-b"]);
        store.defer_claim_binding(true);
        let coordinator = ClaimCoordinator::new(&store, NS, &cspc);

        let report = coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(report.pending.len(), 2);
        assert_eq!(report.pending[0].claim, "bdc-bd-a-uid");
        assert_matches!(
            report.ensure_bound(),
            Err(Error::ClaimPending { pending: 2, ref device, .. }) if device == "bd-a"
        );

        // Still unbound: the existing claims are found again, nothing is written
        store.reset_mutations();
        let report = coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.pending.len(), 2);
        assert_eq!(store.mutation_count(), 0);

        store.bind_pending_claims();
        let report = coordinator.claim_devices(&names(&["bd-a", "bd-b"])).await.unwrap();
        assert_eq!(report.reused, vec!["bd-a", "bd-b"]);
        assert!(report.ensure_bound().is_ok());
    }
}
