//! Operator configuration
//!
//! Built by the binary from command line flags and environment variables and
//! consumed read-only by the controller.

use std::time::Duration;

/// Default image for the pool container
pub const DEFAULT_POOL_IMAGE: &str = "openebs/cstor-pool:ci";

/// Default image for the pool management side car
pub const DEFAULT_POOL_MGMT_IMAGE: &str = "openebs/cstor-pool-mgmt:ci";

/// Runtime configuration for the pool cluster controller
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator runs in; every read and write is scoped to it
    pub namespace: Option<String>,
    /// Name of the operator pod, half of the lease holder identity
    pub pod_name: String,
    /// Concurrent reconciles across different clusters
    pub workers: u16,
    /// Requeue interval after a successful pass
    pub resync: Duration,
    /// Deadline for each API call
    pub request_timeout: Duration,
    /// Longest a pass waits on one event publish
    pub event_timeout: Duration,
    /// Requeue delay when another replica holds the lease
    pub lease_busy_requeue: Duration,
    /// First retry delay after a failed pass
    pub backoff_base: Duration,
    /// Ceiling for retry delays
    pub backoff_max: Duration,
    pub pool_image: String,
    pub pool_mgmt_image: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: Some("openebs".to_string()),
            pod_name: "cstor-pool-operator".to_string(),
            workers: 2,
            resync: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            event_timeout: Duration::from_secs(5),
            lease_busy_requeue: crate::error::LEASE_BUSY_REQUEUE,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            pool_image: DEFAULT_POOL_IMAGE.to_string(),
            pool_mgmt_image: DEFAULT_POOL_MGMT_IMAGE.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Lease holder identity, `<namespace>/<pod>`
    pub fn lease_holder(&self) -> Option<String> {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.trim().is_empty())
            .map(|ns| format!("{}/{}", ns, self.pod_name))
    }

    /// Operator namespace, ignoring a blank value
    pub fn operator_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_holder() {
        let config = OperatorConfig {
            namespace: Some("openebs".into()),
            pod_name: "maya-0".into(),
            ..Default::default()
        };
        assert_eq!(config.lease_holder().as_deref(), Some("openebs/maya-0"));

        let config = OperatorConfig {
            namespace: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(config.lease_holder(), None);
        assert_eq!(config.operator_namespace(), None);
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.resync, Duration::from_secs(30));
        assert!(config.backoff_base < config.backoff_max);
    }
}
