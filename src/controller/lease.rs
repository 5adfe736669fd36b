//! Pool Lease
//!
//! Per-cluster mutual exclusion between controller replicas. The lease is a
//! JSON value in the `openebs.io/cspc-lease` annotation of the cluster
//! itself:
//!
//! ```json
//! {"holder": "openebs/cstor-operator-5d9c", "leaderTransition": 3}
//! ```
//!
//! An empty holder means released. A lease whose holder pod is not
//! `Running` is taken over and the transition counter incremented.
//! Concurrent takeovers are settled by the resource version of the update.

use crate::crd::{CStorPoolCluster, LEASE_ANNOTATION};
use crate::domain::ports::ClusterApi;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// JSON patch path of the lease annotation (`/` escaped as `~1`)
pub const LEASE_PATCH_PATH: &str = "/metadata/annotations/openebs.io~1cspc-lease";

const POD_RUNNING: &str = "Running";

/// Value stored in the lease annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseValue {
    #[serde(default)]
    pub holder: String,
    #[serde(default)]
    pub leader_transition: u64,
}

impl LeaseValue {
    pub fn is_released(&self) -> bool {
        self.holder.trim().is_empty()
    }

    /// Split the holder into pod namespace and name
    pub fn holder_pod(&self) -> Option<(&str, &str)> {
        self.holder
            .split_once('/')
            .filter(|(ns, pod)| !ns.is_empty() && !pod.is_empty())
    }
}

/// Result of a successful hold
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    /// The cluster as written, with a fresh resource version
    pub cspc: CStorPoolCluster,
    /// Whether this hold wrote a new holder
    pub acquired: bool,
    pub leader_transition: u64,
}

/// Parse the lease annotation; `None` when absent or blank
pub fn parse_lease(cspc: &CStorPoolCluster) -> Result<Option<LeaseValue>> {
    match cspc.lease_value().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| Error::MalformedLease {
                cspc: cspc.name().to_string(),
                reason: e.to_string(),
            }),
    }
}

pub struct PoolLease<'a> {
    api: &'a dyn ClusterApi,
    holder: String,
}

impl<'a> PoolLease<'a> {
    /// `holder` is this replica's identity, `<namespace>/<pod>`
    pub fn new(api: &'a dyn ClusterApi, holder: impl Into<String>) -> Self {
        Self {
            api,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lease on `cspc`, failing with `LeaseBusy` while a live pod
    /// holds it.
    pub async fn hold(&self, cspc: &CStorPoolCluster) -> Result<LeaseGrant> {
        let current = parse_lease(cspc)?;

        if let Some(lease) = &current {
            if lease.holder == self.holder {
                debug!(cspc = %cspc.name(), "lease already held");
                return Ok(LeaseGrant {
                    cspc: cspc.clone(),
                    acquired: false,
                    leader_transition: lease.leader_transition,
                });
            }
            if !lease.is_released() && self.is_holder_live(lease).await? {
                return Err(Error::LeaseBusy {
                    cspc: cspc.name().to_string(),
                    holder: lease.holder.clone(),
                });
            }
        }

        let value = match &current {
            // Never leased, or the entry is blank
            None => LeaseValue {
                holder: self.holder.clone(),
                leader_transition: 1,
            },
            // Released, or the previous holder died
            Some(previous) => LeaseValue {
                holder: self.holder.clone(),
                leader_transition: previous.leader_transition + 1,
            },
        };

        let mut updated = cspc.clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(LEASE_ANNOTATION.to_string(), serde_json::to_string(&value)?);

        let written = self
            .api
            .replace_cluster(cspc_namespace(cspc), &updated)
            .await?;
        info!(
            cspc = %cspc.name(),
            holder = %self.holder,
            leader_transition = value.leader_transition,
            "lease acquired"
        );
        Ok(LeaseGrant {
            cspc: written,
            acquired: true,
            leader_transition: value.leader_transition,
        })
    }

    /// Release the lease by blanking the holder through a JSON patch,
    /// keeping the transition counter. Only a lease held by this replica is
    /// released.
    pub async fn release(&self, cspc: &CStorPoolCluster) -> Result<()> {
        let Some(mut lease) = parse_lease(cspc)? else {
            return Ok(());
        };
        if lease.holder != self.holder {
            return Ok(());
        }
        lease.holder.clear();
        let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([{
            "op": "replace",
            "path": LEASE_PATCH_PATH,
            "value": serde_json::to_string(&lease)?,
        }]))?;
        self.api
            .json_patch_cluster(cspc_namespace(cspc), cspc.name(), &patch)
            .await?;
        debug!(cspc = %cspc.name(), "lease released");
        Ok(())
    }

    /// Release, logging instead of failing; a lease left behind is taken
    /// over once this pod stops running
    pub async fn release_quietly(&self, cspc: &CStorPoolCluster) {
        if let Err(e) = self.release(cspc).await {
            warn!(cspc = %cspc.name(), error = %e, "lease could not be released");
        }
    }

    /// A holder is live only when its pod exists and is `Running`
    async fn is_holder_live(&self, lease: &LeaseValue) -> Result<bool> {
        let Some((namespace, pod)) = lease.holder_pod() else {
            warn!(holder = %lease.holder, "malformed lease holder, treating as dead");
            return Ok(false);
        };
        let phase = self.api.pod_phase(namespace, pod).await?;
        Ok(phase.as_deref() == Some(POD_RUNNING))
    }
}

fn cspc_namespace(cspc: &CStorPoolCluster) -> &str {
    cspc.metadata.namespace.as_deref().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::crd::CStorPoolClusterSpec;
    use assert_matches::assert_matches;

    const NS: &str = "openebs";

    fn seeded(store: &InMemoryCluster, lease: Option<&str>) -> CStorPoolCluster {
        let mut cspc = CStorPoolCluster::new("cspc-a", CStorPoolClusterSpec::default());
        if let Some(value) = lease {
            cspc.metadata.annotations = Some(BTreeMap::from([(
                LEASE_ANNOTATION.to_string(),
                value.to_string(),
            )]));
        }
        store.add_cluster(NS, cspc)
    }

    fn stored_lease(store: &InMemoryCluster) -> LeaseValue {
        parse_lease(&store.cluster(NS, "cspc-a").unwrap()).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_first_hold_creates_annotations() {
        let store = InMemoryCluster::new();
        let cspc = seeded(&store, None);
        let lease = PoolLease::new(&store, "openebs/live-pod");

        let grant = lease.hold(&cspc).await.unwrap();
        assert!(grant.acquired);
        assert_eq!(
            stored_lease(&store),
            LeaseValue {
                holder: "openebs/live-pod".into(),
                leader_transition: 1
            }
        );
    }

    #[tokio::test]
    async fn test_hold_by_self_is_a_noop() {
        let store = InMemoryCluster::new();
        let cspc = seeded(&store, Some(r#"{"holder":"openebs/live-pod","leaderTransition":2}"#));
        let lease = PoolLease::new(&store, "openebs/live-pod");

        let grant = lease.hold(&cspc).await.unwrap();
        assert!(!grant.acquired);
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_live_holder_blocks() {
        let store = InMemoryCluster::new();
        store.set_pod_phase("openebs", "other-pod", "Running");
        let cspc = seeded(&store, Some(r#"{"holder":"openebs/other-pod","leaderTransition":1}"#));
        let lease = PoolLease::new(&store, "openebs/live-pod");

        assert_matches!(lease.hold(&cspc).await, Err(Error::LeaseBusy { .. }));
    }

    #[tokio::test]
    async fn test_dead_or_malformed_holder_is_taken_over() {
        let store = InMemoryCluster::new();
        store.set_pod_phase("openebs", "dead-pod", "Failed");
        let cspc = seeded(&store, Some(r#"{"holder":"openebs/dead-pod","leaderTransition":4}"#));
        let lease = PoolLease::new(&store, "openebs/live-pod");
        let grant = lease.hold(&cspc).await.unwrap();
        assert_eq!(grant.leader_transition, 5);

        let store = InMemoryCluster::new();
        let cspc = seeded(&store, Some(r#"{"holder":"no-slash","leaderTransition":7}"#));
        let lease = PoolLease::new(&store, "openebs/live-pod");
        assert_eq!(lease.hold(&cspc).await.unwrap().leader_transition, 8);
    }

    #[tokio::test]
    async fn test_release_keeps_transition_count() {
        let store = InMemoryCluster::new();
        let cspc = seeded(&store, Some(r#"{"holder":"","leaderTransition":3}"#));
        let lease = PoolLease::new(&store, "openebs/live-pod");

        let grant = lease.hold(&cspc).await.unwrap();
        assert_eq!(grant.leader_transition, 4);
        lease.release(&grant.cspc).await.unwrap();

        let value = stored_lease(&store);
        assert!(value.is_released());
        assert_eq!(value.leader_transition, 4);
        assert_eq!(
            store.mutation_log(),
            vec!["replace CStorPoolCluster/cspc-a", "patch CStorPoolCluster/cspc-a"]
        );
    }

    #[tokio::test]
    async fn test_malformed_value_is_an_error() {
        let store = InMemoryCluster::new();
        let cspc = seeded(&store, Some("not json"));
        let lease = PoolLease::new(&store, "openebs/live-pod");
        assert_matches!(lease.hold(&cspc).await, Err(Error::MalformedLease { .. }));
    }

    #[tokio::test]
    async fn test_stale_hold_conflicts() {
        let store = InMemoryCluster::new();
        let cspc = seeded(&store, None);
        let first = PoolLease::new(&store, "openebs/pod-a");
        let second = PoolLease::new(&store, "openebs/pod-b");

        first.hold(&cspc).await.unwrap();
        // Second replica works from the same stale read
        assert_matches!(second.hold(&cspc).await, Err(Error::Conflict { .. }));
    }
}
