//! Apply pass: dependency-ordered, sequential, fail-fast.
//!
//! Each selected unit is applied in [`crate::graph`] order. The first apply
//! failure halts the pass: units that transitively depend on the failed one
//! are reported `DependencyUnmet`, every other remaining unit `Skipped`.
//! Nothing is retried and nothing is rolled back.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, DiffOutcome, ResourceChange};
use crate::error::{ApplyResult, ErrorKind};
use crate::graph::{self, Selection};
use crate::lock::PassLock;
use crate::observer::{PassObserver, SilentObserver};
use crate::store::{Manifest, ManifestStore};
use crate::unit::{DeploymentUnit, UnitPhase};

/// Outcome of one unit in an apply pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: String,
    pub namespace: String,
    /// Terminal phase for this pass: `Applied`, `Failed`, `DependencyUnmet`
    /// or `Skipped`.
    pub phase: UnitPhase,
    /// Whether the cluster accepted the manifest.
    pub applied: bool,
    /// Whether the apply changed live state. False for a no-op re-apply.
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Digest of the manifest content that was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceChange>,
}

impl UnitResult {
    fn pending(unit: &DeploymentUnit, phase: UnitPhase, error: Option<ErrorKind>) -> Self {
        debug_assert!(phase.is_terminal(), "{phase} does not end a unit's pass");
        Self {
            unit: unit.name.clone(),
            namespace: unit.namespace.clone(),
            phase,
            applied: false,
            changed: false,
            error,
            digest: None,
            resources: Vec::new(),
        }
    }

    /// Applied without changing anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied && !self.changed
    }
}

/// Tally of unit outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub dependency_unmet: usize,
    pub skipped: usize,
}

/// Result of one apply pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when the operator interrupted the pass.
    #[serde(default)]
    pub interrupted: bool,
    /// One entry per selected unit, in application order.
    pub results: Vec<UnitResult>,
}

impl ApplyReport {
    /// Every unit applied.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.applied)
    }

    /// The unit whose apply failure halted the pass.
    #[must_use]
    pub fn failed_unit(&self) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.phase == UnitPhase::Failed)
    }

    /// Units the cluster accepted.
    #[must_use]
    pub fn applied_units(&self) -> Vec<&UnitResult> {
        self.results.iter().filter(|r| r.applied).collect()
    }

    /// Result for a named unit.
    #[must_use]
    pub fn result(&self, unit: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.unit == unit)
    }

    #[must_use]
    pub fn counts(&self) -> ApplyCounts {
        let mut counts = ApplyCounts::default();
        for result in &self.results {
            match result.phase {
                UnitPhase::Applied if result.changed => counts.changed += 1,
                UnitPhase::Applied => counts.unchanged += 1,
                UnitPhase::Failed => counts.failed += 1,
                UnitPhase::DependencyUnmet => counts.dependency_unmet += 1,
                _ => counts.skipped += 1,
            }
        }
        counts
    }
}

/// One unit of a dry-run plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedUnit {
    pub unit: String,
    pub namespace: String,
    pub depends_on: Vec<String>,
    pub digest: String,
    /// Diff against live state, or the error that prevented it.
    pub diff: Result<DiffOutcome, String>,
}

/// Ordered dry-run of a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub units: Vec<PlannedUnit>,
    /// Dependencies outside the selection, assumed applied.
    pub assumed: Vec<String>,
}

impl PlanReport {
    /// Units whose live state differs from the store.
    #[must_use]
    pub fn drifted(&self) -> Vec<&PlannedUnit> {
        self.units
            .iter()
            .filter(|u| matches!(u.diff, Ok(DiffOutcome::Drifted(_))))
            .collect()
    }
}

/// Move a unit to its next phase.
pub(crate) fn step(unit: &str, from: UnitPhase, to: UnitPhase) -> UnitPhase {
    debug_assert!(from.can_transition_to(to), "{unit}: illegal phase change {from} -> {to}");
    debug!(unit, %from, %to, "Phase change");
    to
}

enum Halt {
    Failed(String),
    Interrupted,
}

/// Drives apply passes against a cluster.
pub struct Applier {
    cluster: Arc<dyn ClusterApi>,
    lock: Arc<dyn PassLock>,
    observer: Arc<dyn PassObserver>,
    interrupt: Arc<AtomicBool>,
}

impl Applier {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, lock: Arc<dyn PassLock>) -> Self {
        Self {
            cluster,
            lock,
            observer: Arc::new(SilentObserver),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PassObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Flag checked between units; once set, the pass stops.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Order the selection and read every manifest up front.
    ///
    /// Store and graph errors surface here, before the cluster is touched.
    fn prepare(store: &dyn ManifestStore, selection: &Selection) -> ApplyResult<Vec<Manifest>> {
        let order = selection.ordered()?;
        let manifests = order
            .iter()
            .map(|unit| store.read_manifest(unit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(manifests)
    }

    /// Run one apply pass over `selection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or dependency graph is invalid, or the
    /// apply lock cannot be taken. Per-unit apply failures are not errors;
    /// they are reported in the [`ApplyReport`].
    pub async fn apply_pass(
        &self,
        store: &dyn ManifestStore,
        selection: &Selection,
    ) -> ApplyResult<ApplyReport> {
        let manifests = Self::prepare(store, selection)?;

        self.lock.acquire().await?;
        let report = self.run(&manifests, &selection.assumed).await;
        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release apply lock");
        }

        Ok(report)
    }

    /// `assumed` dependencies count as applied; they never explain a
    /// `DependencyUnmet`.
    async fn run(&self, manifests: &[Manifest], assumed: &BTreeSet<String>) -> ApplyReport {
        let started_at = Utc::now();
        let units: Vec<DeploymentUnit> = manifests.iter().map(|m| m.unit.clone()).collect();
        let total = manifests.len();

        info!(units = total, "Starting apply pass");

        let mut results: Vec<UnitResult> = Vec::with_capacity(total);
        let mut applied: HashSet<String> = assumed.iter().cloned().collect();
        let mut halt: Option<Halt> = None;
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for (index, manifest) in manifests.iter().enumerate() {
            let unit = &manifest.unit;

            if halt.is_none() && self.interrupt.load(Ordering::SeqCst) {
                warn!("Apply pass interrupted; remaining units are not attempted");
                halt = Some(Halt::Interrupted);
            }

            let result = match &halt {
                Some(Halt::Failed(_)) if blocked.contains(&unit.name) => {
                    let missing = unit
                        .depends_on
                        .iter()
                        .find(|dep| !applied.contains(*dep))
                        .cloned()
                        .unwrap_or_default();
                    debug!(unit = %unit.name, %missing, "Dependency unmet");
                    UnitResult::pending(
                        unit,
                        UnitPhase::DependencyUnmet,
                        Some(ErrorKind::DependencyUnmet { missing }),
                    )
                }
                Some(_) => UnitResult::pending(unit, UnitPhase::Skipped, None),
                None => {
                    self.observer.apply_started(unit, index + 1, total);
                    let result = self.apply_unit(manifest).await;
                    if result.applied {
                        applied.insert(unit.name.clone());
                    } else {
                        blocked = graph::dependents_of(&units, &unit.name);
                        halt = Some(Halt::Failed(unit.name.clone()));
                    }
                    result
                }
            };

            self.observer.apply_finished(&result);
            results.push(result);
        }

        if let Some(Halt::Failed(failed)) = &halt {
            error!(unit = %failed, "Apply pass halted");
        }

        let report = ApplyReport {
            started_at,
            finished_at: Utc::now(),
            interrupted: matches!(halt, Some(Halt::Interrupted)),
            results,
        };
        let counts = report.counts();
        info!(
            changed = counts.changed,
            unchanged = counts.unchanged,
            failed = counts.failed,
            dependency_unmet = counts.dependency_unmet,
            skipped = counts.skipped,
            "Apply pass finished"
        );
        report
    }

    async fn apply_unit(&self, manifest: &Manifest) -> UnitResult {
        let unit = &manifest.unit;
        let phase = step(&unit.name, UnitPhase::Pending, UnitPhase::Applying);
        info!(unit = %unit.name, namespace = %unit.namespace, "Applying unit");

        match self.cluster.apply(manifest).await {
            Ok(outcome) => {
                let phase = step(&unit.name, phase, UnitPhase::Applied);
                if outcome.changed {
                    info!(unit = %unit.name, resources = outcome.resources.len(), "Unit applied");
                } else {
                    info!(unit = %unit.name, "Unit unchanged");
                }
                UnitResult {
                    unit: unit.name.clone(),
                    namespace: unit.namespace.clone(),
                    phase,
                    applied: true,
                    changed: outcome.changed,
                    error: None,
                    digest: Some(manifest.digest.clone()),
                    resources: outcome.resources,
                }
            }
            Err(e) => {
                error!(unit = %unit.name, error = %e, "Apply failed");
                UnitResult {
                    digest: Some(manifest.digest.clone()),
                    ..UnitResult::pending(
                        unit,
                        step(&unit.name, phase, UnitPhase::Failed),
                        Some(ErrorKind::ApplyFailure {
                            message: e.to_string(),
                        }),
                    )
                }
            }
        }
    }

    /// Dry run: order the selection and diff each unit against live state.
    ///
    /// Takes no lock and mutates nothing. Diff errors are reported per unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or dependency graph is invalid.
    pub async fn plan(
        &self,
        store: &dyn ManifestStore,
        selection: &Selection,
    ) -> ApplyResult<PlanReport> {
        let manifests = Self::prepare(store, selection)?;

        let mut units = Vec::with_capacity(manifests.len());
        for manifest in &manifests {
            let diff = self
                .cluster
                .diff(manifest)
                .await
                .map_err(|e| e.to_string());
            debug!(unit = %manifest.unit.name, in_sync = matches!(diff, Ok(DiffOutcome::InSync)), "Planned unit");
            units.push(PlannedUnit {
                unit: manifest.unit.name.clone(),
                namespace: manifest.unit.namespace.clone(),
                depends_on: manifest.unit.depends_on.clone(),
                digest: manifest.digest.clone(),
                diff,
            });
        }

        Ok(PlanReport {
            units,
            assumed: selection.assumed.iter().cloned().collect(),
        })
    }
}
