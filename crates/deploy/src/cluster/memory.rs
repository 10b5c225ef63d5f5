//! In-memory cluster for tests and offline library use.
//!
//! Applied content is tracked per unit by digest, so re-applying identical
//! content reports every object unchanged, the same way kubectl does.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::health::UnitHealth;
use super::{ApplyOutcome, ChangeAction, ClusterApi, ClusterError, DiffOutcome, ResourceChange};
use crate::store::Manifest;

#[derive(Default)]
struct State {
    /// Unit name -> digest of the last applied content.
    applied: HashMap<String, String>,
    /// Units whose apply is rejected, with the rejection message.
    rejections: HashMap<String, String>,
    /// Scripted health answers per unit; the last one repeats.
    health: HashMap<String, VecDeque<UnitHealth>>,
    /// Units whose status query fails.
    status_errors: HashSet<String>,
    /// Every apply attempt, in order.
    attempts: Vec<String>,
    /// Number of apply calls that changed something.
    mutations: usize,
    /// Status queries per unit.
    status_calls: HashMap<String, usize>,
}

/// Scriptable [`ClusterApi`] holding live state in memory.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Reject every apply of `unit` with `message`.
    pub fn reject(&self, unit: &str, message: &str) {
        self.with_state(|s| {
            s.rejections.insert(unit.to_string(), message.to_string());
        });
    }

    /// Accept applies of `unit` again.
    pub fn accept(&self, unit: &str) {
        self.with_state(|s| {
            s.rejections.remove(unit);
        });
    }

    /// Script the health answers for `unit`. The last answer repeats.
    pub fn script_health(&self, unit: &str, answers: impl IntoIterator<Item = UnitHealth>) {
        let answers: VecDeque<UnitHealth> = answers.into_iter().collect();
        self.with_state(|s| {
            s.health.insert(unit.to_string(), answers);
        });
    }

    /// Make status queries for `unit` fail.
    pub fn fail_status(&self, unit: &str) {
        self.with_state(|s| {
            s.status_errors.insert(unit.to_string());
        });
    }

    /// Simulate an out-of-band edit of a unit's live objects.
    pub fn drift(&self, unit: &str) {
        self.with_state(|s| {
            if let Some(digest) = s.applied.get_mut(unit) {
                digest.push_str("-drifted");
            }
        });
    }

    /// Units whose apply was attempted, in order.
    #[must_use]
    pub fn attempts(&self) -> Vec<String> {
        self.with_state(|s| s.attempts.clone())
    }

    /// Number of applies that changed live state.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.with_state(|s| s.mutations)
    }

    /// Status queries made for `unit`.
    #[must_use]
    pub fn status_calls(&self, unit: &str) -> usize {
        self.with_state(|s| s.status_calls.get(unit).copied().unwrap_or(0))
    }
}

fn changes(manifest: &Manifest, action: &ChangeAction) -> Vec<ResourceChange> {
    manifest
        .resources
        .iter()
        .map(|r| ResourceChange {
            resource: r.to_string(),
            action: action.clone(),
        })
        .collect()
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn apply(&self, manifest: &Manifest) -> Result<ApplyOutcome, ClusterError> {
        let unit = manifest.unit.name.as_str();
        self.with_state(|s| {
            s.attempts.push(unit.to_string());
            if let Some(message) = s.rejections.get(unit) {
                return Err(ClusterError::Rejected(message.clone()));
            }

            let action = match s.applied.get(unit) {
                Some(digest) if *digest == manifest.digest => ChangeAction::Unchanged,
                Some(_) => ChangeAction::Configured,
                None => ChangeAction::Created,
            };
            if action != ChangeAction::Unchanged {
                s.mutations += 1;
                s.applied.insert(unit.to_string(), manifest.digest.clone());
            }
            Ok(ApplyOutcome::from_changes(changes(manifest, &action)))
        })
    }

    async fn diff(&self, manifest: &Manifest) -> Result<DiffOutcome, ClusterError> {
        let unit = manifest.unit.name.as_str();
        Ok(self.with_state(|s| match s.applied.get(unit) {
            Some(digest) if *digest == manifest.digest => DiffOutcome::InSync,
            Some(_) => DiffOutcome::Drifted(format!("{unit}: live objects differ")),
            None => DiffOutcome::Drifted(format!("{unit}: not present in cluster")),
        }))
    }

    async fn status(&self, manifest: &Manifest) -> Result<UnitHealth, ClusterError> {
        let unit = manifest.unit.name.as_str();
        self.with_state(|s| {
            *s.status_calls.entry(unit.to_string()).or_default() += 1;
            if s.status_errors.contains(unit) {
                return Err(ClusterError::Rejected(format!("status of {unit} unavailable")));
            }
            if !s.applied.contains_key(unit) {
                return Ok(UnitHealth::Progressing("not found".to_string()));
            }
            let Some(answers) = s.health.get_mut(unit) else {
                return Ok(UnitHealth::Ready);
            };
            let answer = if answers.len() > 1 {
                answers.pop_front()
            } else {
                answers.front().cloned()
            };
            Ok(answer.unwrap_or(UnitHealth::Ready))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::DeploymentUnit;

    fn manifest(name: &str, content: &str) -> Manifest {
        Manifest::parse(&DeploymentUnit::new(name, "homelab", "x.yaml"), content).unwrap()
    }

    const V1: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  v: '1'\n";
    const V2: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  v: '2'\n";

    #[tokio::test]
    async fn test_reapply_is_noop() {
        let cluster = MemoryCluster::new();
        assert!(cluster.apply(&manifest("app", V1)).await.unwrap().changed);
        assert!(!cluster.apply(&manifest("app", V1)).await.unwrap().changed);
        assert!(cluster.apply(&manifest("app", V2)).await.unwrap().changed);
        assert_eq!(cluster.mutations(), 2);
    }

    #[tokio::test]
    async fn test_diff_tracks_drift() {
        let cluster = MemoryCluster::new();
        let m = manifest("app", V1);
        assert!(matches!(cluster.diff(&m).await.unwrap(), DiffOutcome::Drifted(_)));
        cluster.apply(&m).await.unwrap();
        assert_eq!(cluster.diff(&m).await.unwrap(), DiffOutcome::InSync);
        cluster.drift("app");
        assert!(matches!(cluster.diff(&m).await.unwrap(), DiffOutcome::Drifted(_)));
    }

    #[tokio::test]
    async fn test_scripted_health_last_answer_repeats() {
        let cluster = MemoryCluster::new();
        let m = manifest("app", V1);
        cluster.apply(&m).await.unwrap();
        cluster.script_health(
            "app",
            [UnitHealth::Progressing("starting".into()), UnitHealth::Ready],
        );
        assert!(!cluster.status(&m).await.unwrap().is_ready());
        assert!(cluster.status(&m).await.unwrap().is_ready());
        assert!(cluster.status(&m).await.unwrap().is_ready());
        assert_eq!(cluster.status_calls("app"), 3);
    }

    #[tokio::test]
    async fn test_unapplied_unit_is_not_found() {
        let cluster = MemoryCluster::new();
        let status = cluster.status(&manifest("app", V1)).await.unwrap();
        assert_eq!(status, UnitHealth::Progressing("not found".into()));
    }
}
