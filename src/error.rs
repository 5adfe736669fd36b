//! Error types for the CStor Pool Operator
//!
//! Lower layers return typed errors; the reconciler decides per variant
//! whether a failure is requeued, reported and dropped, or ignored.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting update on {kind}/{name}, object was modified")]
    Conflict { kind: String, name: String },

    #[error("Kubernetes API call timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Lease Errors
    // =========================================================================
    #[error("Lease on cstorpoolcluster {cspc} is held by live pod {holder}")]
    LeaseBusy { cspc: String, holder: String },

    #[error("Malformed lease value on cstorpoolcluster {cspc}: {reason}")]
    MalformedLease { cspc: String, reason: String },

    // =========================================================================
    // Block Device Errors
    // =========================================================================
    #[error("Block device {device} not found")]
    DeviceNotFound { device: String },

    #[error("Block device {device} is already claimed by {claim}")]
    DeviceBusy { device: String, claim: String },

    #[error("{pending} block device claim(s) pending, {claim} is not bound to {device} yet")]
    ClaimPending {
        device: String,
        claim: String,
        pending: usize,
    },

    // =========================================================================
    // Pool Spec Errors
    // =========================================================================
    #[error("Invalid pool spec for node selector {selector}: {reason}")]
    InvalidPoolSpec { selector: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("JSON patch error: {0}")]
    JsonPatch(String),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
    /// Nothing to reconcile, treat as success
    Ignore,
}

/// Delay before retrying a pass that lost the lease race
pub const LEASE_BUSY_REQUEUE: Duration = Duration::from_secs(10);

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // The object vanished mid-pass
            Error::ResourceNotFound { .. } => ErrorAction::Ignore,

            // Another replica is working on this cluster
            Error::LeaseBusy { .. } => ErrorAction::RequeueAfter(LEASE_BUSY_REQUEUE),

            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::ResourceExists { .. }
            | Error::Timeout(_)
            | Error::ClaimPending { .. } => ErrorAction::RequeueWithBackoff,

            // User action required
            Error::DeviceNotFound { .. }
            | Error::DeviceBusy { .. }
            | Error::InvalidPoolSpec { .. }
            | Error::MalformedLease { .. }
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // Programming errors surface without retry
            Error::Internal(_) | Error::JsonParse(_) | Error::JsonPatch(_) => ErrorAction::NoRequeue,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RequeueWithBackoff | ErrorAction::RequeueAfter(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::Timeout(_)
        )
    }

    /// Check if this error means the target object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Check if this error means a create hit an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::ResourceExists { .. })
    }

    /// Short machine friendly label, used for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Internal(_) => "internal",
            Error::Configuration(_) => "configuration",
            Error::Kube(_) => "kube",
            Error::ResourceNotFound { .. } => "not_found",
            Error::ResourceExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::Timeout(_) => "timeout",
            Error::LeaseBusy { .. } => "lease_busy",
            Error::MalformedLease { .. } => "malformed_lease",
            Error::DeviceNotFound { .. } => "device_not_found",
            Error::DeviceBusy { .. } => "device_busy",
            Error::ClaimPending { .. } => "claim_pending",
            Error::InvalidPoolSpec { .. } => "invalid_pool_spec",
            Error::JsonParse(_) => "json_parse",
            Error::JsonPatch(_) => "json_patch",
        }
    }

    /// Classify a raw kube error for the given object.
    ///
    /// 404 becomes [`Error::ResourceNotFound`], 409 `AlreadyExists` becomes
    /// [`Error::ResourceExists`] and any other 409 becomes [`Error::Conflict`].
    pub fn from_kube(error: kube::Error, kind: &str, name: &str) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    Error::ResourceExists {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    }
                } else {
                    Error::Conflict {
                        kind: kind.to_string(),
                        name: name.to_string(),
                    }
                }
            }
            _ => Error::Kube(error),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
