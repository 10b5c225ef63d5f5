//! Cluster API collaborator.
//!
//! The applier and verifier only see the live cluster through [`ClusterApi`]:
//! a declarative apply, a server-side diff, and a health query. The live
//! cluster is an external, externally mutable resource; nothing here caches
//! its state between calls.

pub mod health;
pub mod kubernetes;
pub mod kubectl;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Manifest;

pub use self::health::UnitHealth;
pub use self::kubernetes::KubeCluster;
pub use self::kubectl::Kubectl;
pub use self::memory::MemoryCluster;

/// Errors from the cluster collaborator.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster rejected the request. The message is kept verbatim.
    #[error("{0}")]
    Rejected(String),

    /// kubectl could not be started or talked to.
    #[error("failed to run kubectl: {0}")]
    Spawn(#[from] std::io::Error),

    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// `apiVersion`/`kind` not served by the cluster.
    #[error("resource type {api_version}/{kind} is not served by the cluster")]
    UnknownResource { api_version: String, kind: String },

    /// Client configuration problem.
    #[error("cluster configuration error: {0}")]
    Config(String),
}

/// What kubectl reported for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Configured,
    Unchanged,
    ServerSideApplied,
    Other(String),
}

impl ChangeAction {
    /// Parse a kubectl apply action word.
    #[must_use]
    pub fn parse(word: &str) -> Self {
        match word {
            "created" => Self::Created,
            "configured" => Self::Configured,
            "unchanged" => Self::Unchanged,
            "serverside-applied" => Self::ServerSideApplied,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One object touched by an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// kubectl resource reference, e.g. `deployment.apps/n8n`.
    pub resource: String,
    pub action: ChangeAction,
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// False when the cluster reported every object unchanged.
    pub changed: bool,
    pub resources: Vec<ResourceChange>,
}

impl ApplyOutcome {
    /// Build an outcome from per-object changes.
    ///
    /// An apply that reports nothing is treated as a change.
    #[must_use]
    pub fn from_changes(resources: Vec<ResourceChange>) -> Self {
        let changed = resources.is_empty()
            || resources
                .iter()
                .any(|r| r.action != ChangeAction::Unchanged);
        Self { changed, resources }
    }
}

/// Result of comparing a manifest against live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "diff")]
pub enum DiffOutcome {
    InSync,
    Drifted(String),
}

/// Declarative access to the live cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a manifest for declarative application.
    ///
    /// Re-applying unchanged content is a no-op at the cluster level and is
    /// reported with `changed == false`.
    async fn apply(&self, manifest: &Manifest) -> Result<ApplyOutcome, ClusterError>;

    /// Compare a manifest against live state without mutating anything.
    async fn diff(&self, manifest: &Manifest) -> Result<DiffOutcome, ClusterError>;

    /// Current health of the objects a manifest declares.
    async fn status(&self, manifest: &Manifest) -> Result<UnitHealth, ClusterError>;
}
