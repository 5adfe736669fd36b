//! Prometheus metrics for the pool cluster controller

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Controller metrics, registered in a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    reconcile_errors: IntCounterVec,
    reconcile_duration: Histogram,
    pools_provisioned: IntCounter,
    lease_transitions: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("cstor_pool_operator".to_string()), None)?;

        let reconciles = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconcile passes by outcome"),
            &["outcome"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("reconcile_errors_total", "Failed reconcile passes by error kind"),
            &["error"],
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "reconcile_duration_seconds",
            "Duration of reconcile passes",
        ))?;
        let pools_provisioned = IntCounter::new("pools_provisioned_total", "Pools created")?;
        let lease_transitions = IntCounter::new(
            "lease_transitions_total",
            "Pool cluster leases acquired by this replica",
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(pools_provisioned.clone()))?;
        registry.register(Box::new(lease_transitions.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_errors,
            reconcile_duration,
            pools_provisioned,
            lease_transitions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.reconciles.with_label_values(&["success"]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, error_kind: &str, elapsed: Duration) {
        self.reconciles.with_label_values(&["failure"]).inc();
        self.reconcile_errors.with_label_values(&[error_kind]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_pool_provisioned(&self) {
        self.pools_provisioned.inc();
    }

    pub fn record_lease_transition(&self) {
        self.lease_transitions.inc();
    }

    pub fn pools_provisioned(&self) -> u64 {
        self.pools_provisioned.get()
    }

    pub fn lease_transitions(&self) -> u64 {
        self.lease_transitions.get()
    }
}
