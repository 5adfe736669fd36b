//! CStor Pool Operator
//!
//! A Kubernetes operator turning CStorPoolCluster resources into per-node
//! cStor pools: it claims the block devices each pool needs, creates the
//! CStorPool objects and their pool Deployments, grows pools additively and
//! tears everything down in finalizer order when a cluster is deleted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                CStorPoolCluster watch (kube Controller)               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                          Pool Reconciler                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌───────────┐  │
//! │  │  Pool Lease  │  │Node Selection│  │  Expansion   │  │ Deletion  │  │
//! │  │ (annotation) │  │   Engine     │  │   Planner    │  │Coordinator│  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └───────────┘  │
//! │           ┌──────────────────┐   ┌──────────────────────┐             │
//! │           │ Claim Coordinator│   │  Inventory Adapter   │             │
//! │           └──────────────────┘   └──────────────────────┘             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │          Ports: ClusterApi + EventPublisher (domain::ports)           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │        KubeCluster (API server)     │     InMemoryCluster (tests)     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: reconciler, lease, claims, deletion and the controller loop
//! - [`algorithm`]: node selection and expansion planning
//! - [`cluster`]: adapters implementing the ports
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits
//! - [`error`]: Error types and handling

pub mod algorithm;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use algorithm::{plan_expansion, select_pools, ExpansionPlan, NodeSelection};

pub use cluster::{InMemoryCluster, KubeCluster, KubeEventPublisher, RecordingPublisher};

pub use config::OperatorConfig;

pub use controller::{Context, PoolReconciler, SyncOutcome};

pub use crd::{
    BlockDevice, BlockDeviceClaim, CStorPool, CStorPoolCluster, CStorPoolClusterSpec,
    CStorPoolClusterStatus, ClusterPhase, PoolSpec, RaidGroup, RaidGroupType,
};

pub use domain::ports::{ClusterApi, EventPublisher, EventType, PoolEvent};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
