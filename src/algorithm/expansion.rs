//! Expansion Planner
//!
//! Diffs one pool spec against its realized pool and emits additive changes
//! only: RAID groups missing from the pool are appended, and striped groups
//! grow by the devices the spec added. Two groups are the same group when
//! they share at least one device.

use crate::crd::{BlockDeviceRef, CStorPool, PoolSpec, RaidGroup, RaidGroupType};
use std::collections::BTreeSet;
use tracing::debug;

/// Devices to append to an existing striped group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupGrowth {
    /// Index of the group in the realized pool
    pub group_index: usize,
    pub devices: Vec<BlockDeviceRef>,
}

/// Additive changes for one realized pool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionPlan {
    /// Groups to append, types resolved
    pub new_groups: Vec<RaidGroup>,
    /// Striped groups to grow
    pub grown_groups: Vec<GroupGrowth>,
}

impl ExpansionPlan {
    pub fn is_empty(&self) -> bool {
        self.new_groups.is_empty() && self.grown_groups.is_empty()
    }

    /// Every device the plan brings into the pool, in plan order
    pub fn new_block_devices(&self) -> Vec<String> {
        self.new_groups
            .iter()
            .flat_map(|g| g.block_devices.iter())
            .chain(self.grown_groups.iter().flat_map(|g| g.devices.iter()))
            .map(|bd| bd.block_device_name.clone())
            .collect()
    }

    /// Apply the plan to a pool. Only appends, so the result is always a
    /// superset of the input.
    pub fn apply(&self, csp: &mut CStorPool) {
        for growth in &self.grown_groups {
            if let Some(group) = csp.spec.raid_groups.get_mut(growth.group_index) {
                group.block_devices.extend(growth.devices.iter().cloned());
            }
        }
        csp.spec.raid_groups.extend(self.new_groups.iter().cloned());
    }
}

/// Compute the additive changes that bring `csp` in line with `spec`
pub fn plan_expansion(spec: &PoolSpec, csp: &CStorPool) -> ExpansionPlan {
    let mut plan = ExpansionPlan::default();
    let realized: BTreeSet<String> = csp.block_device_names().into_iter().collect();

    if spec.raid_groups.len() > csp.spec.raid_groups.len() {
        for group in &spec.raid_groups {
            let present = csp.spec.raid_groups.iter().any(|g| g.shares_device_with(group));
            if !present {
                let mut group = group.clone();
                group.raid_type = spec.raid_type_of(&group);
                plan.new_groups.push(group);
            }
        }
    }

    for group in &spec.raid_groups {
        if spec.raid_type_of(group) != Some(RaidGroupType::Stripe) {
            continue;
        }
        let Some(group_index) = csp
            .spec
            .raid_groups
            .iter()
            .position(|g| g.shares_device_with(group))
        else {
            continue;
        };

        let added: Vec<BlockDeviceRef> = group
            .block_devices
            .iter()
            .filter(|bd| !realized.contains(&bd.block_device_name))
            .map(|bd| BlockDeviceRef::new(bd.block_device_name.clone()))
            .collect();
        if added.is_empty() {
            continue;
        }
        debug!(
            pool = %csp.name(),
            group = group_index,
            devices = added.len(),
            "striped group grows"
        );
        plan.grown_groups.push(GroupGrowth {
            group_index,
            devices: added,
        });
    }

    plan
}

/// Block device replacement is not supported; the pool is left untouched.
pub fn replace_block_devices(_spec: &PoolSpec, csp: &CStorPool) {
    debug!(pool = %csp.name(), "block device replacement is not supported yet");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CStorPoolSpec, PoolConfig};

    fn spec(groups: Vec<RaidGroup>) -> PoolSpec {
        PoolSpec {
            raid_groups: groups,
            pool_config: PoolConfig {
                default_raid_group_type: Some(RaidGroupType::Stripe),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn realized(groups: Vec<RaidGroup>) -> CStorPool {
        CStorPool::new(
            "cspc-a-node1",
            CStorPoolSpec {
                host_name: "node-1".into(),
                pool_config: PoolConfig::default(),
                raid_groups: groups,
            },
        )
    }

    fn stripe(devices: &[&str]) -> RaidGroup {
        RaidGroup::new(Some(RaidGroupType::Stripe), devices)
    }

    fn mirror(devices: &[&str]) -> RaidGroup {
        RaidGroup::new(Some(RaidGroupType::Mirror), devices)
    }

    #[test]
    fn test_no_change_yields_empty_plan() {
        let csp = realized(vec![mirror(&["bd-a", "bd-b"])]);
        let plan = plan_expansion(&spec(vec![mirror(&["bd-a", "bd-b"])]), &csp);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_stripe_growth_preserves_order() {
        let mut csp = realized(vec![stripe(&["bd-a", "bd-b"])]);
        let plan = plan_expansion(&spec(vec![stripe(&["bd-a", "bd-b", "bd-c"])]), &csp);
        assert_eq!(plan.new_block_devices(), vec!["bd-c"]);
        assert!(plan.new_groups.is_empty());

        plan.apply(&mut csp);
        assert_eq!(csp.block_device_names(), vec!["bd-a", "bd-b", "bd-c"]);
    }

    #[test]
    fn test_new_group_inherits_default_type() {
        let mut csp = realized(vec![mirror(&["bd-a", "bd-b"])]);
        let plan = plan_expansion(
            &spec(vec![mirror(&["bd-a", "bd-b"]), RaidGroup::new(None, &["bd-c"])]),
            &csp,
        );
        assert_eq!(plan.new_groups.len(), 1);
        assert_eq!(plan.new_groups[0].raid_type, Some(RaidGroupType::Stripe));

        plan.apply(&mut csp);
        assert_eq!(csp.spec.raid_groups.len(), 2);
        assert_eq!(csp.spec.raid_groups[0], mirror(&["bd-a", "bd-b"]));
    }

    #[test]
    fn test_mirror_groups_never_grow() {
        let csp = realized(vec![mirror(&["bd-a", "bd-b"])]);
        let plan = plan_expansion(&spec(vec![mirror(&["bd-a", "bd-b", "bd-c"])]), &csp);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_group_identity_ignores_index() {
        // Groups reordered in the spec are still matched by membership
        let csp = realized(vec![stripe(&["bd-a"]), mirror(&["bd-b", "bd-c"])]);
        let plan = plan_expansion(
            &spec(vec![
                mirror(&["bd-b", "bd-c"]),
                mirror(&["bd-d", "bd-e"]),
                stripe(&["bd-a", "bd-f"]),
            ]),
            &csp,
        );
        assert_eq!(plan.new_groups, vec![mirror(&["bd-d", "bd-e"])]);
        assert_eq!(
            plan.grown_groups,
            vec![GroupGrowth {
                group_index: 0,
                devices: vec![BlockDeviceRef::new("bd-f")],
            }]
        );
    }
}
