//! Pure planning algorithms
//!
//! Neither module talks to the cluster: both take the observed objects as
//! input and return plans that the controller carries out.
//!
//! - [`node_select`]: which node selectors still need a pool
//! - [`expansion`]: additive updates from a pool spec onto its realized pool

pub mod expansion;
pub mod node_select;

pub use expansion::{plan_expansion, ExpansionPlan, GroupGrowth};
pub use node_select::{
    bd_list_for_pool, device_reference_counts, orphan_pools, select_pools, validate_pool_spec,
    NodeSelection, RejectedPool, SelectedPool,
};
