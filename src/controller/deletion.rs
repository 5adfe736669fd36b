//! Deletion Coordinator
//!
//! Finalizer-ordered teardown of a deleted cluster, and deprovisioning of
//! single pools whose node selector was removed from the cluster.

use crate::cluster::events::reasons;
use crate::controller::inventory::Inventory;
use crate::crd::{BlockDeviceClaim, CStorPool, CStorPoolCluster, CSPC_FINALIZER};
use crate::domain::ports::{ClusterApi, EventPublisher, PoolEvent};
use crate::error::Result;
use kube::Resource;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Release a deleted cluster: strip the finalizer from every claim labelled
/// with it, then from the cluster itself. The garbage collector removes the
/// owned pools and, through them, the pool Deployments.
///
/// Any failure aborts the sequence; a later pass resumes where this one
/// stopped because removing a finalizer twice is a no-op.
pub async fn finalize_cluster(
    api: &dyn ClusterApi,
    namespace: &str,
    cspc: &CStorPoolCluster,
) -> Result<()> {
    let claims = Inventory::new(api, namespace)
        .list_claims_for_cluster(cspc.name())
        .await?;
    for claim in claims {
        release_claim(api, namespace, claim).await?;
    }

    if !cspc.has_finalizer() {
        return Ok(());
    }
    let mut released = cspc.clone();
    if let Some(finalizers) = released.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != CSPC_FINALIZER);
    }
    let cspc_namespace = cspc.metadata.namespace.as_deref().unwrap_or(namespace);
    match api.replace_cluster(cspc_namespace, &released).await {
        Ok(_) => {
            info!(cspc = %cspc.name(), "removed cluster finalizer");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove the cluster finalizer from one claim with a full update
async fn release_claim(api: &dyn ClusterApi, namespace: &str, mut claim: BlockDeviceClaim) -> Result<()> {
    if !claim.remove_finalizer() {
        return Ok(());
    }
    match api.replace_claim(namespace, &claim).await {
        Ok(_) => {
            debug!(claim = %claim.name(), "removed claim finalizer");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deprovision a pool whose host is no longer in the cluster spec: release
/// and delete its claims, then delete the pool. Progress is reported as
/// `DownScale` events on the cluster.
pub async fn downscale_pool(
    api: &dyn ClusterApi,
    events: &dyn EventPublisher,
    namespace: &str,
    cspc: &CStorPoolCluster,
    csp: &CStorPool,
) -> Result<()> {
    let result = remove_pool(api, namespace, cspc, csp).await;
    let regarding = cspc.object_ref(&());
    match &result {
        Ok(()) => {
            events
                .publish(
                    &regarding,
                    PoolEvent::normal(
                        reasons::DOWN_SCALE,
                        format!(
                            "De-provisioned pool {} on node {}",
                            csp.name(),
                            csp.spec.host_name
                        ),
                    ),
                )
                .await;
        }
        Err(e) => {
            warn!(pool = %csp.name(), error = %e, "failed to de-provision pool");
            events
                .publish(
                    &regarding,
                    PoolEvent::warning(
                        reasons::DOWN_SCALE,
                        format!("Failed to de-provision pool {}: {}", csp.name(), e),
                    ),
                )
                .await;
        }
    }
    result
}

async fn remove_pool(
    api: &dyn ClusterApi,
    namespace: &str,
    cspc: &CStorPoolCluster,
    csp: &CStorPool,
) -> Result<()> {
    let devices: BTreeSet<String> = csp.block_device_names().into_iter().collect();
    let claims = Inventory::new(api, namespace)
        .list_claims_for_cluster(cspc.name())
        .await?;

    for claim in claims
        .into_iter()
        .filter(|c| devices.contains(&c.spec.block_device_name))
    {
        let name = claim.name().to_string();
        release_claim(api, namespace, claim).await?;
        match api.delete_claim(namespace, &name).await {
            Ok(()) => debug!(claim = %name, "deleted claim"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    match api.delete_pool(namespace, csp.name()).await {
        Ok(()) => {
            info!(pool = %csp.name(), host = %csp.spec.host_name, "deleted pool");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, RecordingPublisher};
    use crate::controller::claim::ClaimCoordinator;
    use crate::crd::{
        BlockDevice, BlockDeviceSpec, CStorPoolClusterSpec, CStorPoolSpec, RaidGroup, RaidGroupType,
        CSPC_LABEL,
    };
    use crate::domain::ports::EventType;
    use std::collections::BTreeMap;

    const NS: &str = "openebs";

    fn setup() -> (InMemoryCluster, CStorPoolCluster) {
        let store = InMemoryCluster::new();
        for name in ["bd-a", "bd-b", "bd-c"] {
            store.add_block_device(NS, BlockDevice::new(name, BlockDeviceSpec::default()));
        }
        let mut cspc = CStorPoolCluster::new("cspc-a", CStorPoolClusterSpec::default());
        cspc.metadata.finalizers = Some(vec![CSPC_FINALIZER.to_string()]);
        let cspc = store.add_cluster(NS, cspc);
        (store, cspc)
    }

    async fn claim_all(store: &InMemoryCluster, cspc: &CStorPoolCluster, devices: &[&str]) {
        let names: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
        ClaimCoordinator::new(store, NS, cspc)
            .claim_devices(&names)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finalize_releases_claims_before_cluster() {
        let (store, cspc) = setup();
        claim_all(&store, &cspc, &["bd-a", "bd-b"]).await;
        store.reset_mutations();

        finalize_cluster(&store, NS, &cspc).await.unwrap();

        let log = store.mutation_log();
        assert_eq!(log.len(), 3);
        assert!(log[..2].iter().all(|m| m.starts_with("replace BlockDeviceClaim/")));
        assert_eq!(log[2], "replace CStorPoolCluster/cspc-a");
        assert!(store.claims(NS).iter().all(|c| !c.has_finalizer()));
        assert!(!store.cluster(NS, "cspc-a").unwrap().has_finalizer());

        // Idempotent once everything is released
        store.reset_mutations();
        let cspc = store.cluster(NS, "cspc-a").unwrap();
        finalize_cluster(&store, NS, &cspc).await.unwrap();
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_finalize_aborts_on_claim_failure() {
        let (store, cspc) = setup();
        claim_all(&store, &cspc, &["bd-a"]).await;
        store.fail_operation("replace_claim");

        assert!(finalize_cluster(&store, NS, &cspc).await.is_err());
        assert!(store.cluster(NS, "cspc-a").unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_downscale_removes_claims_and_pool() {
        let (store, cspc) = setup();
        claim_all(&store, &cspc, &["bd-a", "bd-b", "bd-c"]).await;

        let mut csp = CStorPool::new(
            "cspc-a-gone",
            CStorPoolSpec {
                host_name: "node-gone".into(),
                raid_groups: vec![RaidGroup::new(Some(RaidGroupType::Mirror), &["bd-a", "bd-b"])],
                ..Default::default()
            },
        );
        csp.metadata.labels = Some(BTreeMap::from([(CSPC_LABEL.to_string(), "cspc-a".to_string())]));
        let csp = store.add_pool(NS, csp);

        let events = RecordingPublisher::new();
        downscale_pool(&store, &events, NS, &cspc, &csp).await.unwrap();

        assert!(store.pools(NS).is_empty());
        let remaining: Vec<String> = store
            .claims(NS)
            .iter()
            .map(|c| c.spec.block_device_name.clone())
            .collect();
        assert_eq!(remaining, vec!["bd-c"]);
        assert!(!store.block_device(NS, "bd-a").unwrap().is_claimed());

        let recorded = events.with_reason(reasons::DOWN_SCALE);
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].type_, EventType::Normal);
    }

    #[tokio::test]
    async fn test_downscale_failure_emits_warning() {
        let (store, cspc) = setup();
        let csp = store.add_pool(
            NS,
            CStorPool::new(
                "cspc-a-gone",
                CStorPoolSpec {
                    host_name: "node-gone".into(),
                    ..Default::default()
                },
            ),
        );
        store.fail_operation("delete_pool");

        let events = RecordingPublisher::new();
        assert!(downscale_pool(&store, &events, NS, &cspc, &csp).await.is_err());
        assert_eq!(events.events()[0].type_, EventType::Warning);
    }
}
