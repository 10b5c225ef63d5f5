//! Deployment units and their per-pass lifecycle.
//!
//! A [`DeploymentUnit`] is one named entry of the manifest store. During an
//! operator cycle each unit walks the [`UnitPhase`] state machine:
//!
//! ```text
//! Pending -> Applying -> Applied -> Verifying -> Healthy | Unhealthy | TimedOut
//!                     \-> Failed
//! Pending -> DependencyUnmet | Skipped
//! ```
//!
//! Nothing ever moves a unit back to `Pending`; a new cycle is a new pass.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_namespace() -> String {
    "default".to_string()
}

/// A named, declarative description of desired cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentUnit {
    /// Unit identifier, unique within a store.
    pub name: String,
    /// Namespace used for resources that do not set one.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Manifest location relative to the store root.
    #[serde(rename = "manifest")]
    pub manifest_path: PathBuf,
    /// Names of units that must be applied before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// HTTP endpoint that must answer 2xx/3xx before the unit counts as
    /// healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

impl DeploymentUnit {
    /// Create a unit without dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            manifest_path: manifest_path.into(),
            depends_on: Vec::new(),
            health_url: None,
        }
    }

    /// Builder-style helper to declare dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }
}

impl std::fmt::Display for DeploymentUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle phase of a unit within one operator cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPhase {
    /// Selected for the pass, not yet attempted.
    Pending,
    /// Manifest submitted to the cluster.
    Applying,
    /// Cluster accepted the manifest.
    Applied,
    /// Cluster rejected the manifest.
    Failed,
    /// A prerequisite never reached `Applied` in this pass.
    DependencyUnmet,
    /// Not attempted because the pass halted on an unrelated failure.
    Skipped,
    /// Health polling in progress.
    Verifying,
    /// Reported ready within the timeout.
    Healthy,
    /// Reported a terminal failure.
    Unhealthy,
    /// Never became ready within the timeout.
    TimedOut,
}

impl UnitPhase {
    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Applying | Self::DependencyUnmet | Self::Skipped
            ) | (Self::Applying, Self::Applied | Self::Failed)
                | (Self::Applied, Self::Verifying)
                | (
                    Self::Verifying,
                    Self::Healthy | Self::Unhealthy | Self::TimedOut
                )
        )
    }

    /// Terminal phases end the unit's cycle.
    ///
    /// `Applied` is not terminal: a verify step may still follow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::DependencyUnmet
                | Self::Skipped
                | Self::Healthy
                | Self::Unhealthy
                | Self::TimedOut
        )
    }

    /// Short label for console output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::DependencyUnmet => "dependency unmet",
            Self::Skipped => "skipped",
            Self::Verifying => "verifying",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::TimedOut => "timed out",
        }
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
