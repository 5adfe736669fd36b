//! Pool cluster controller
//!
//! Wires the [`PoolReconciler`] into `kube::runtime::Controller`, which
//! supplies the keyed work queue: a key is never handed to two workers at
//! once and keys of different clusters run in parallel up to the configured
//! worker count.

pub mod claim;
pub mod deletion;
pub mod deployment;
pub mod disruption;
pub mod inventory;
pub mod lease;
pub mod reconciler;

pub use claim::{ClaimCoordinator, ClaimReport};
pub use deletion::{downscale_pool, finalize_cluster};
pub use deployment::{build_pool_deployment, ensure_pool_deployment};
pub use disruption::{apply_budget_change, build_disruption_budget, plan_disruption_budget, BudgetChange};
pub use inventory::Inventory;
pub use lease::{parse_lease, LeaseGrant, LeaseValue, PoolLease};
pub use reconciler::{pool_name, PoolReconciler, SyncOutcome};

use crate::crd::{CStorPool, CStorPoolCluster};
use crate::error::{Error, ErrorAction, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconcile
pub struct Context {
    reconciler: PoolReconciler,
    backoffs: DashMap<String, ExponentialBackoff>,
}

impl Context {
    pub fn new(reconciler: PoolReconciler) -> Self {
        Self {
            reconciler,
            backoffs: DashMap::new(),
        }
    }

    pub fn reconciler(&self) -> &PoolReconciler {
        &self.reconciler
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        let config = self.reconciler.config();
        ExponentialBackoffBuilder::new()
            .with_initial_interval(config.backoff_base)
            .with_max_interval(config.backoff_max)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Next retry delay for `key`, growing on every consecutive failure
    pub fn next_backoff(&self, key: &str) -> std::time::Duration {
        let max = self.reconciler.config().backoff_max;
        let mut entry = self
            .backoffs
            .entry(key.to_string())
            .or_insert_with(|| self.new_backoff());
        entry.next_backoff().unwrap_or(max).min(max)
    }

    pub fn reset_backoff(&self, key: &str) {
        self.backoffs.remove(key);
    }
}

fn object_key(cspc: &CStorPoolCluster) -> String {
    format!("{}/{}", cspc.namespace().unwrap_or_default(), cspc.name_any())
}

/// Reconcile entry point; only the key of the watched object is used, the
/// pass re-fetches the current state
pub async fn reconcile(cspc: Arc<CStorPoolCluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(&cspc);
    let started = Instant::now();
    let metrics = ctx.reconciler.metrics();

    match ctx.reconciler.sync_key(&key).await {
        Ok(outcome) => {
            metrics.record_success(started.elapsed());
            ctx.reset_backoff(&key);
            debug!(cspc = %key, ?outcome, "reconcile finished");
            Ok(match outcome {
                SyncOutcome::Missing | SyncOutcome::Deleted => Action::await_change(),
                _ => Action::requeue(ctx.reconciler.config().resync),
            })
        }
        Err(e) => {
            metrics.record_failure(e.metric_label(), started.elapsed());
            Err(e)
        }
    }
}

/// Map a failed pass to its requeue policy
pub fn error_policy(cspc: Arc<CStorPoolCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&cspc);
    match error.action() {
        ErrorAction::RequeueWithBackoff => {
            let delay = ctx.next_backoff(&key);
            warn!(cspc = %key, error = %error, ?delay, "reconcile failed, retrying");
            Action::requeue(delay)
        }
        ErrorAction::RequeueAfter(_) if matches!(error, Error::LeaseBusy { .. }) => {
            let delay = ctx.reconciler.config().lease_busy_requeue;
            debug!(cspc = %key, error = %error, ?delay, "lease busy");
            Action::requeue(delay)
        }
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => {
            error!(cspc = %key, error = %error, "reconcile failed, waiting for a change");
            Action::await_change()
        }
        ErrorAction::Ignore => Action::await_change(),
    }
}

/// Run the controller until a termination signal arrives. In-flight passes
/// are allowed to finish.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let config = ctx.reconciler.config().clone();
    let (clusters, pools) = match config.operator_namespace() {
        Some(ns) => (
            Api::<CStorPoolCluster>::namespaced(client.clone(), ns),
            Api::<CStorPool>::namespaced(client, ns),
        ),
        None => (
            Api::<CStorPoolCluster>::all(client.clone()),
            Api::<CStorPool>::all(client),
        ),
    };

    info!(workers = config.workers, "starting pool cluster controller");
    Controller::new(clusters, watcher::Config::default())
        .owns(pools, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.workers))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(cspc = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile error"),
            }
        })
        .await;
    info!("pool cluster controller stopped");
}
