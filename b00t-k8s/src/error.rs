//! Error taxonomy for the workload adapter
//!
//! Two layers, matching who can act on the failure:
//! - [`ClusterError`] is what a single gateway call reports. Callers branch on
//!   the variant, never on raw HTTP status codes.
//! - [`LifecycleError`] is what the lifecycle manager reports to the agent.

use crate::gateway::ResourceKind;
use crate::lifecycle::LifecycleState;
use snafu::Snafu;
use std::time::Duration;

/// Failure of a single cluster control-plane call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClusterError {
    /// Transport, TLS, auth or server-side availability failure.
    /// Retriable by caller policy; the gateway itself never retries.
    #[snafu(display("cluster unavailable during {operation}: {message}"))]
    ClusterUnavailable { operation: String, message: String },

    #[snafu(display("{kind} '{name}' not found"))]
    NotFound { kind: ResourceKind, name: String },

    #[snafu(display("{kind} '{name}' already exists"))]
    Conflict { kind: ResourceKind, name: String },

    /// Missing RBAC permissions. Never retried.
    #[snafu(display("forbidden during {operation}: {message}"))]
    Forbidden { operation: String, message: String },

    /// Any other API status, e.g. a 422 for an invalid object.
    #[snafu(display("cluster rejected {operation} with status {code}: {message}"))]
    Rejected {
        operation: String,
        code: u16,
        message: String,
    },

    /// A dispatched blocking call panicked or was aborted before reporting.
    #[snafu(display("dispatched cluster call did not complete"))]
    Dispatch { source: tokio::task::JoinError },
}

impl ClusterError {
    /// Only availability failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::ClusterUnavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClusterError::Forbidden { .. })
    }
}

/// Failure reported by the lifecycle manager to its owning agent.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LifecycleError {
    #[snafu(display("invalid workload spec: {reason}"))]
    InvalidSpec { reason: String },

    #[snafu(display("cannot {operation} while workload is {state}"))]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[snafu(display("failed to {step} for workload {name}"))]
    Provision {
        step: &'static str,
        name: String,
        source: ClusterError,
    },

    /// No ready pod was observed before the deadline. Resources are left in
    /// place so the caller can inspect them or retry `initialize()`.
    #[snafu(display("no ready pod for {name} after {waited:?}"))]
    ReadinessTimeout { name: String, waited: Duration },

    #[snafu(display("initialization of {name} was cancelled by shutdown"))]
    Cancelled { name: String },

    #[snafu(display("teardown of {name} left {} failure(s): {}", failures.len(), failures.join("; ")))]
    TeardownIncomplete { name: String, failures: Vec<String> },

    #[snafu(display("cluster call failed during {operation}"))]
    Cluster {
        operation: &'static str,
        source: ClusterError,
    },
}

impl LifecycleError {
    /// The underlying cluster condition, when there is one.
    pub fn cluster_error(&self) -> Option<&ClusterError> {
        match self {
            LifecycleError::Provision { source, .. } | LifecycleError::Cluster { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}
