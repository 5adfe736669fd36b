//! Node-Selection Engine
//!
//! Given a pool cluster and the pools already realized for it, decides which
//! node selectors still need a pool. Selection is deterministic: pools are
//! visited in declared order and nothing but the inputs influences the
//! result.

use crate::crd::{label_selector, CStorPool, CStorPoolCluster, PoolSpec};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Selection Result
// =============================================================================

/// A pool spec chosen for provisioning
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPool {
    /// Position of the pool in the cluster spec
    pub index: usize,
    /// Host named by the node selector
    pub hostname: String,
    /// The pool spec with every RAID group type resolved
    pub spec: PoolSpec,
    /// Devices to claim, flattened in group order
    pub block_devices: Vec<String>,
}

/// A pool spec that failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedPool {
    pub index: usize,
    pub selector: String,
    pub reason: String,
}

/// Output of one selection run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSelection {
    pending: Vec<SelectedPool>,
    rejected: Vec<RejectedPool>,
}

impl NodeSelection {
    /// Number of pools still to provision
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The next pool to realize, if any
    pub fn next_pool_spec(&self) -> Option<&SelectedPool> {
        self.pending.first()
    }

    pub fn pending(&self) -> &[SelectedPool] {
        &self.pending
    }

    /// Pool specs skipped because they are invalid
    pub fn rejected(&self) -> &[RejectedPool] {
        &self.rejected
    }
}

/// Flattened, order preserving device list of a pool spec
pub fn bd_list_for_pool(pool: &PoolSpec) -> Vec<String> {
    pool.block_device_names()
}

// =============================================================================
// Selection
// =============================================================================

/// Select the pools of `cspc` that have no realized pool yet.
///
/// A node already hosting a pool of this cluster is never selected again;
/// within one run a hostname is selected at most once, later duplicates are
/// rejected.
pub fn select_pools(cspc: &CStorPoolCluster, existing: &[CStorPool]) -> NodeSelection {
    let used_nodes: BTreeSet<&str> = existing.iter().map(|csp| csp.spec.host_name.as_str()).collect();
    let device_refs = device_reference_counts(cspc);

    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut selection = NodeSelection::default();

    for (index, pool) in cspc.spec.pools.iter().enumerate() {
        let reject = |reason: String| RejectedPool {
            index,
            selector: label_selector(&pool.node_selector),
            reason,
        };

        let hostname = match pool.hostname() {
            Some(host) => host.to_string(),
            None => {
                selection.rejected.push(reject(format!(
                    "node selector has no {} label",
                    crate::crd::HOSTNAME_LABEL
                )));
                continue;
            }
        };

        if !visited.insert(hostname.clone()) {
            selection
                .rejected
                .push(reject(format!("hostname {} is already used by another pool spec", hostname)));
            continue;
        }

        if used_nodes.contains(hostname.as_str()) {
            continue;
        }

        if let Err(e) = validate_pool_spec(pool, &device_refs) {
            let reason = match e {
                Error::InvalidPoolSpec { reason, .. } => reason,
                other => other.to_string(),
            };
            selection.rejected.push(reject(reason));
            continue;
        }

        let mut spec = pool.clone();
        spec.raid_groups = pool.resolved_raid_groups();
        selection.pending.push(SelectedPool {
            index,
            block_devices: bd_list_for_pool(&spec),
            hostname,
            spec,
        });
    }

    selection
}

/// Realized pools whose host is no longer named by any node selector
pub fn orphan_pools<'a>(cspc: &CStorPoolCluster, existing: &'a [CStorPool]) -> Vec<&'a CStorPool> {
    let wanted: BTreeSet<&str> = cspc.hostnames().into_iter().collect();
    existing
        .iter()
        .filter(|csp| !wanted.contains(csp.spec.host_name.as_str()))
        .collect()
}

/// How many times each device is referenced across the whole cluster spec
pub fn device_reference_counts(cspc: &CStorPoolCluster) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for name in cspc.spec.pools.iter().flat_map(PoolSpec::block_device_names) {
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}

// =============================================================================
// Validation
// =============================================================================

/// Validate a pool spec: hostname present, at least one RAID group, each
/// group typed and matching its type's device count, and no device named
/// more than once across the cluster.
pub fn validate_pool_spec(pool: &PoolSpec, device_refs: &BTreeMap<String, usize>) -> Result<()> {
    let invalid = |reason: String| Error::InvalidPoolSpec {
        selector: label_selector(&pool.node_selector),
        reason,
    };

    if pool.hostname().is_none() {
        return Err(invalid(format!(
            "node selector has no {} label",
            crate::crd::HOSTNAME_LABEL
        )));
    }

    if pool.raid_groups.is_empty() {
        return Err(invalid("no raid groups specified".to_string()));
    }

    for (i, group) in pool.raid_groups.iter().enumerate() {
        let raid_type = pool
            .raid_type_of(group)
            .ok_or_else(|| invalid(format!("raid group {} has no type and no default type is set", i)))?;
        if raid_type == crate::crd::RaidGroupType::Unknown {
            return Err(invalid(format!("raid group {} has an unsupported raid group type", i)));
        }

        let count = group.block_devices.len();
        if !raid_type.accepts_device_count(count) {
            let qualifier = if raid_type == crate::crd::RaidGroupType::Stripe {
                "at least "
            } else {
                ""
            };
            return Err(invalid(format!(
                "raid group {} of type {} needs {}{} block devices, got {}",
                i,
                raid_type,
                qualifier,
                raid_type.required_devices(),
                count
            )));
        }

        for name in group.device_names() {
            if name.is_empty() {
                return Err(invalid(format!("raid group {} has an empty block device name", i)));
            }
            if device_refs.get(name).copied().unwrap_or(0) > 1 {
                return Err(invalid(format!("block device {} is referenced more than once", name)));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::crd::{
        CStorPoolClusterSpec, CStorPoolSpec, PoolConfig, RaidGroup, RaidGroupType, HOSTNAME_LABEL,
    };

    fn pool(host: &str, groups: Vec<RaidGroup>) -> PoolSpec {
        PoolSpec {
            node_selector: BTreeMap::from([(HOSTNAME_LABEL.to_string(), host.to_string())]),
            raid_groups: groups,
            pool_config: PoolConfig {
                default_raid_group_type: Some(RaidGroupType::Stripe),
                ..Default::default()
            },
        }
    }

    fn cluster(pools: Vec<PoolSpec>) -> CStorPoolCluster {
        CStorPoolCluster::new(
            "cspc-a",
            CStorPoolClusterSpec {
                pools,
                ..Default::default()
            },
        )
    }

    fn realized(host: &str) -> CStorPool {
        CStorPool::new(
            &format!("cspc-a-{}", host),
            CStorPoolSpec {
                host_name: host.to_string(),
                ..Default::default()
            },
        )
    }

    fn mirror(devices: &[&str]) -> RaidGroup {
        RaidGroup::new(Some(RaidGroupType::Mirror), devices)
    }

    #[test]
    fn test_selects_in_declared_order() {
        let cspc = cluster(vec![
            pool("node-1", vec![mirror(&["bd-a", "bd-b"])]),
            pool("node-2", vec![mirror(&["bd-c", "bd-d"])]),
            pool("node-3", vec![mirror(&["bd-e", "bd-f"])]),
        ]);

        let selection = select_pools(&cspc, &[]);
        assert_eq!(selection.pending_count(), 3);
        let next = selection.next_pool_spec().unwrap();
        assert_eq!(next.hostname, "node-1");
        assert_eq!(next.block_devices, vec!["bd-a", "bd-b"]);

        let selection = select_pools(&cspc, &[realized("node-1"), realized("node-3")]);
        assert_eq!(selection.pending_count(), 1);
        assert_eq!(selection.next_pool_spec().unwrap().hostname, "node-2");
    }

    #[test]
    fn test_resolves_default_type() {
        let cspc = cluster(vec![pool("node-1", vec![RaidGroup::new(None, &["bd-a", "bd-b"])])]);
        let selection = select_pools(&cspc, &[]);
        let next = selection.next_pool_spec().unwrap();
        assert_eq!(next.spec.raid_groups[0].raid_type, Some(RaidGroupType::Stripe));
    }

    #[test]
    fn test_rejects_invalid_pools() {
        let mut no_host = pool("", vec![mirror(&["bd-x", "bd-y"])]);
        no_host.node_selector.clear();
        let cspc = cluster(vec![
            pool("node-1", vec![mirror(&["bd-a"])]),
            pool("node-2", vec![RaidGroup::new(Some(RaidGroupType::Raidz), &["bd-b", "bd-c", "bd-d"])]),
            pool("node-2", vec![mirror(&["bd-e", "bd-f"])]),
            no_host,
        ]);

        let selection = select_pools(&cspc, &[]);
        assert_eq!(selection.pending_count(), 1);
        assert_eq!(selection.next_pool_spec().unwrap().index, 1);

        let rejected = selection.rejected();
        assert_eq!(rejected.len(), 3);
        assert_eq!(rejected[0].index, 0);
        assert!(rejected[0].reason.contains("needs 2 block devices"));
        assert_eq!(rejected[1].index, 2);
        assert!(rejected[1].reason.contains("already used"));
        assert_eq!(rejected[2].index, 3);
    }

    #[test]
    fn test_rejects_shared_device() {
        let cspc = cluster(vec![
            pool("node-1", vec![mirror(&["bd-a", "bd-b"])]),
            pool("node-2", vec![mirror(&["bd-b", "bd-c"])]),
        ]);
        let selection = select_pools(&cspc, &[]);
        assert_eq!(selection.pending_count(), 0);
        assert_eq!(selection.rejected().len(), 2);
        assert!(selection.rejected()[0].reason.contains("bd-b"));
    }

    #[test]
    fn test_validate_arity_table() {
        let refs = BTreeMap::new();
        let raidz2 = pool(
            "node-1",
            vec![RaidGroup::new(
                Some(RaidGroupType::Raidz2),
                &["a", "b", "c", "d", "e", "f"],
            )],
        );
        assert!(validate_pool_spec(&raidz2, &refs).is_ok());

        let short = pool("node-1", vec![RaidGroup::new(Some(RaidGroupType::Raidz2), &["a", "b"])]);
        assert!(validate_pool_spec(&short, &refs).is_err());

        let mut untyped = pool("node-1", vec![RaidGroup::new(None, &["a"])]);
        untyped.pool_config.default_raid_group_type = None;
        let err = validate_pool_spec(&untyped, &refs).unwrap_err();
        assert!(err.to_string().contains("no type"));

        let empty = pool("node-1", vec![]);
        assert!(validate_pool_spec(&empty, &refs).is_err());
    }

    #[test]
    fn test_unknown_raid_type_is_rejected() {
        let refs = BTreeMap::new();
        let spec = pool("node-1", vec![RaidGroup::new(Some(RaidGroupType::Unknown), &["a", "b"])]);
        let err = validate_pool_spec(&spec, &refs).unwrap_err();
        assert_matches!(err, Error::InvalidPoolSpec { ref reason, .. } if reason.contains("unsupported raid group type"));

        let selection = select_pools(&cluster(vec![spec]), &[]);
        assert_eq!(selection.pending_count(), 0);
        assert_eq!(selection.rejected().len(), 1);
    }

    #[test]
    fn test_orphan_pools() {
        let cspc = cluster(vec![pool("node-1", vec![mirror(&["bd-a", "bd-b"])])]);
        let existing = vec![realized("node-1"), realized("node-9")];
        let orphans = orphan_pools(&cspc, &existing);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].spec.host_name, "node-9");
    }
}
