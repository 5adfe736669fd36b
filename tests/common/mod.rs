//! Shared fixtures for the end-to-end tests
#![allow(dead_code)]

use cstor_pool_operator::crd::{
    BlockDevice, BlockDeviceSpec, CStorPoolCluster, CStorPoolClusterSpec, PoolSpec, RaidGroup,
    RaidGroupType, CSPC_LABEL, HOSTNAME_LABEL,
};
use cstor_pool_operator::{
    InMemoryCluster, Metrics, OperatorConfig, PoolReconciler, RecordingPublisher, Result,
    SyncOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NS: &str = "openebs";
pub const CSPC: &str = "cspc-a";
pub const KEY: &str = "openebs/cspc-a";

/// One in-memory cluster with one reconciler replica
pub struct Env {
    pub store: Arc<InMemoryCluster>,
    pub events: Arc<RecordingPublisher>,
    pub reconciler: PoolReconciler,
}

impl Env {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryCluster::new());
        store.set_pod_phase(NS, "live-pod", "Running");
        let events = Arc::new(RecordingPublisher::new());
        let reconciler = replica_on(&store, &events, "live-pod");
        Self {
            store,
            events,
            reconciler,
        }
    }

    /// Another replica sharing this environment's cluster
    pub fn replica(&self, pod: &str) -> PoolReconciler {
        self.store.set_pod_phase(NS, pod, "Running");
        replica_on(&self.store, &self.events, pod)
    }

    pub async fn sync(&self) -> Result<SyncOutcome> {
        self.reconciler.sync_key(KEY).await
    }

    /// Run passes until one finds nothing to do; returns the pass count
    pub async fn converge(&self) -> usize {
        for pass in 1..=5 {
            if self.sync().await.expect("pass failed") == SyncOutcome::Idle {
                return pass;
            }
        }
        panic!("cluster did not converge");
    }

    pub fn seed_devices(&self, host: &str, devices: &[&str]) {
        for name in devices {
            let mut device = BlockDevice::new(name, BlockDeviceSpec::default());
            device.spec.node_attributes.node_name = host.to_string();
            device.metadata.labels = Some(BTreeMap::from([(
                HOSTNAME_LABEL.to_string(),
                host.to_string(),
            )]));
            self.store.add_block_device(NS, device);
        }
    }

    pub fn seed_cluster(&self, pools: Vec<PoolSpec>) -> CStorPoolCluster {
        self.store.add_cluster(NS, cluster(pools))
    }

    pub fn cluster(&self) -> Option<CStorPoolCluster> {
        self.store.cluster(NS, CSPC)
    }

    /// Names of the claims labelled with the test cluster
    pub fn claimed_devices(&self) -> Vec<String> {
        self.store
            .claims(NS)
            .into_iter()
            .filter(|c| c.belongs_to(CSPC))
            .map(|c| c.spec.block_device_name)
            .collect()
    }
}

fn replica_on(store: &Arc<InMemoryCluster>, events: &Arc<RecordingPublisher>, pod: &str) -> PoolReconciler {
    let config = OperatorConfig {
        namespace: Some(NS.to_string()),
        pod_name: pod.to_string(),
        ..Default::default()
    };
    PoolReconciler::new(
        store.clone(),
        events.clone(),
        config,
        Metrics::new().expect("metrics registry"),
    )
}

pub fn pool(host: &str, raid_type: RaidGroupType, devices: &[&str]) -> PoolSpec {
    PoolSpec {
        node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), host.to_string())]),
        raid_groups: vec![RaidGroup::new(Some(raid_type), devices)],
        ..Default::default()
    }
}

pub fn cluster(pools: Vec<PoolSpec>) -> CStorPoolCluster {
    CStorPoolCluster::new(
        CSPC,
        CStorPoolClusterSpec {
            pools,
            ..Default::default()
        },
    )
}

/// Three mirror pools over six devices
pub fn mirror_cluster(env: &Env) -> CStorPoolCluster {
    env.seed_devices("node-1", &["bd-a", "bd-b"]);
    env.seed_devices("node-2", &["bd-c", "bd-d"]);
    env.seed_devices("node-3", &["bd-e", "bd-f"]);
    env.seed_cluster(vec![
        pool("node-1", RaidGroupType::Mirror, &["bd-a", "bd-b"]),
        pool("node-2", RaidGroupType::Mirror, &["bd-c", "bd-d"]),
        pool("node-3", RaidGroupType::Mirror, &["bd-e", "bd-f"]),
    ])
}

pub fn cspc_labels(cspc: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(CSPC_LABEL.to_string(), cspc.to_string())])
}
