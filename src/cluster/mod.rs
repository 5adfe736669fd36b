//! Cluster adapters
//!
//! Implementations of the domain ports:
//! - [`kube::KubeCluster`]: a live API server through `kube`
//! - [`memory::InMemoryCluster`]: an in-process object store for tests and
//!   dry runs
//! - [`events`]: event publishers for both

pub mod events;
pub mod kube;
pub mod memory;

pub use self::events::{BoundedPublisher, KubeEventPublisher, RecordingPublisher};
pub use self::kube::KubeCluster;
pub use self::memory::InMemoryCluster;
