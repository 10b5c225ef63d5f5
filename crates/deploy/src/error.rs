//! Error types shared by the applier and verifier.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::graph::GraphError;
use crate::lock::LockError;
use crate::store::StoreError;

/// Per-unit failure reported in an apply or verify result.
///
/// None of these are retried or recovered automatically. Recovery is a new,
/// operator-initiated pass after a manual fix.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// The cluster rejected the manifest. The message is kept verbatim.
    #[error("apply failed: {message}")]
    ApplyFailure { message: String },

    /// A prerequisite unit never reached `Applied` in this pass.
    #[error("dependency unmet: {missing} was not applied")]
    DependencyUnmet { missing: String },

    /// The unit did not report ready before its timeout.
    #[error("not ready after {timeout_secs}s: {last_reason}")]
    VerificationTimeout {
        timeout_secs: u64,
        last_reason: String,
    },

    /// The unit reported a terminal failure.
    #[error("unhealthy: {reason}")]
    VerificationUnhealthy { reason: String },
}

/// Errors that abort a pass before or around unit processing.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Manifest store could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Dependency graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Apply lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Cluster collaborator failed outside a unit apply.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Result alias for pass-level operations.
pub type ApplyResult<T> = Result<T, ApplyError>;
