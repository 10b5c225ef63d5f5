//! Post-apply health verification.
//!
//! Each unit the apply pass accepted is polled until it reports ready, reports
//! a terminal failure, or its timeout elapses. Units that were not applied are
//! never polled and never reported healthy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::applier::{step, ApplyReport};
use crate::cluster::{ClusterApi, UnitHealth};
use crate::error::{ApplyResult, ErrorKind};
use crate::observer::{PassObserver, SilentObserver};
use crate::endpoint::{EndpointCheck, HttpEndpointCheck};
use crate::store::{Manifest, ManifestStore};
use crate::unit::{DeploymentUnit, UnitPhase};

const REMOVED_FROM_STORE: &str = "applied but no longer in the manifest store";

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConfig {
    /// Delay between status queries for one unit.
    pub poll_interval: Duration,
    /// Time a unit is given to become ready.
    pub unit_timeout: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            unit_timeout: Duration::from_secs(300),
        }
    }
}

/// How verification of one unit ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum VerifyOutcome {
    Healthy,
    /// A terminal failure was observed.
    Unhealthy { reason: String },
    /// The unit never became ready within the timeout.
    TimedOut { last_reason: String },
    /// The unit was not applied in this pass and was not polled.
    NotApplied,
    /// The operator stopped verification before the unit had a verdict.
    Interrupted,
}

/// Verification result for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    pub unit: String,
    pub outcome: VerifyOutcome,
    /// Status queries made.
    pub polls: u32,
    /// Wall time spent polling, in milliseconds.
    pub elapsed_ms: u64,
}

impl VerifyResult {
    fn unpolled(unit: &str, outcome: VerifyOutcome) -> Self {
        Self {
            unit: unit.to_string(),
            outcome,
            polls: 0,
            elapsed_ms: 0,
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.outcome == VerifyOutcome::Healthy
    }

    /// Phase the unit ends in. Unapplied units keep `Pending`; interrupted
    /// units stay `Applied`.
    #[must_use]
    pub fn phase(&self) -> UnitPhase {
        match self.outcome {
            VerifyOutcome::Healthy => UnitPhase::Healthy,
            VerifyOutcome::Unhealthy { .. } => UnitPhase::Unhealthy,
            VerifyOutcome::TimedOut { .. } => UnitPhase::TimedOut,
            VerifyOutcome::NotApplied => UnitPhase::Pending,
            VerifyOutcome::Interrupted => UnitPhase::Applied,
        }
    }

    /// Error kind for a failed verification.
    #[must_use]
    pub fn error(&self, timeout: Duration) -> Option<ErrorKind> {
        match &self.outcome {
            VerifyOutcome::Unhealthy { reason } => Some(ErrorKind::VerificationUnhealthy {
                reason: reason.clone(),
            }),
            VerifyOutcome::TimedOut { last_reason } => Some(ErrorKind::VerificationTimeout {
                timeout_secs: timeout.as_secs(),
                last_reason: last_reason.clone(),
            }),
            VerifyOutcome::Healthy | VerifyOutcome::NotApplied | VerifyOutcome::Interrupted => {
                None
            }
        }
    }
}

/// Tally of verification outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyCounts {
    pub healthy: usize,
    pub unhealthy: usize,
    pub timed_out: usize,
    pub not_applied: usize,
    pub interrupted: usize,
}

/// Result of verifying one apply pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub unit_timeout_secs: u64,
    pub results: Vec<VerifyResult>,
}

impl VerifyReport {
    /// Every polled unit is healthy and nothing was left unapplied.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.results.iter().all(VerifyResult::is_healthy)
    }

    /// The operator stopped verification early.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == VerifyOutcome::Interrupted)
    }

    #[must_use]
    pub fn result(&self, unit: &str) -> Option<&VerifyResult> {
        self.results.iter().find(|r| r.unit == unit)
    }

    #[must_use]
    pub fn counts(&self) -> VerifyCounts {
        let mut counts = VerifyCounts::default();
        for result in &self.results {
            match result.outcome {
                VerifyOutcome::Healthy => counts.healthy += 1,
                VerifyOutcome::Unhealthy { .. } => counts.unhealthy += 1,
                VerifyOutcome::TimedOut { .. } => counts.timed_out += 1,
                VerifyOutcome::NotApplied => counts.not_applied += 1,
                VerifyOutcome::Interrupted => counts.interrupted += 1,
            }
        }
        counts
    }
}

/// Polls unit health after an apply pass.
pub struct Verifier {
    cluster: Arc<dyn ClusterApi>,
    config: VerifyConfig,
    observer: Arc<dyn PassObserver>,
    endpoint: Arc<dyn EndpointCheck>,
    interrupt: Arc<AtomicBool>,
}

impl Verifier {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: VerifyConfig) -> Self {
        Self {
            cluster,
            config,
            observer: Arc::new(SilentObserver),
            endpoint: Arc::new(HttpEndpointCheck::default()),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn PassObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Check used for units that declare a `healthUrl`.
    #[must_use]
    pub fn with_endpoint_check(mut self, endpoint: Arc<dyn EndpointCheck>) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Flag checked before every poll; once set, units without a verdict are
    /// reported `Interrupted`.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Verify the units an apply pass accepted.
    ///
    /// Manifests are re-read from `store` to learn which objects each unit
    /// declares. Units the pass did not apply are reported `NotApplied`; an
    /// applied unit that has since left the store is reported `Unhealthy`.
    ///
    /// # Errors
    ///
    /// Returns an error if a manifest can no longer be read from the store.
    pub async fn verify(
        &self,
        report: &ApplyReport,
        store: &dyn ManifestStore,
    ) -> ApplyResult<VerifyReport> {
        let units = store.list_units()?;
        let mut targets = Vec::new();
        let mut removed = HashSet::new();
        for result in report.applied_units() {
            let Some(unit) = units.iter().find(|u| u.name == result.unit) else {
                warn!(unit = %result.unit, "Applied unit is no longer in the manifest store");
                removed.insert(result.unit.as_str());
                continue;
            };
            let manifest = store.read_manifest(unit)?;
            if result.digest.as_ref().is_some_and(|d| *d != manifest.digest) {
                warn!(
                    unit = %unit.name,
                    "Manifest changed since it was applied; verifying the current content"
                );
            }
            targets.push(manifest);
        }

        let mut verified = self.verify_manifests(&targets).await;
        let mut results = Vec::with_capacity(report.results.len());
        for result in &report.results {
            let unit = result.unit.as_str();
            match verified.results.iter().position(|v| v.unit == unit) {
                Some(i) => results.push(verified.results.swap_remove(i)),
                None if removed.contains(unit) => results.push(VerifyResult::unpolled(
                    unit,
                    VerifyOutcome::Unhealthy {
                        reason: REMOVED_FROM_STORE.to_string(),
                    },
                )),
                None => results.push(VerifyResult::unpolled(unit, VerifyOutcome::NotApplied)),
            }
        }
        verified.results = results;
        Ok(verified)
    }

    /// Verify manifests directly, in the given order.
    pub async fn verify_manifests(&self, manifests: &[Manifest]) -> VerifyReport {
        let started_at = Utc::now();
        let total = manifests.len();
        info!(
            units = total,
            timeout_secs = self.config.unit_timeout.as_secs(),
            "Starting verification"
        );

        let mut results = Vec::with_capacity(total);
        for (index, manifest) in manifests.iter().enumerate() {
            self.observer.verify_started(&manifest.unit, index + 1, total);
            let result = self.verify_unit(manifest).await;
            self.observer.verify_finished(&result);
            results.push(result);
        }

        let report = VerifyReport {
            started_at,
            finished_at: Utc::now(),
            unit_timeout_secs: self.config.unit_timeout.as_secs(),
            results,
        };
        let counts = report.counts();
        info!(
            healthy = counts.healthy,
            unhealthy = counts.unhealthy,
            timed_out = counts.timed_out,
            interrupted = counts.interrupted,
            "Verification finished"
        );
        report
    }

    /// Ready objects still need their declared endpoint to answer.
    async fn check_endpoint(&self, unit: &DeploymentUnit) -> UnitHealth {
        match &unit.health_url {
            Some(url) => self.endpoint.check(url).await,
            None => UnitHealth::Ready,
        }
    }

    async fn verify_unit(&self, manifest: &Manifest) -> VerifyResult {
        let unit = manifest.unit.name.as_str();
        let started = Instant::now();
        let deadline = started + self.config.unit_timeout;
        let mut polls = 0u32;
        let phase = step(unit, UnitPhase::Applied, UnitPhase::Verifying);

        let outcome = loop {
            if self.interrupt.load(Ordering::SeqCst) {
                warn!(unit, "Verification interrupted");
                break VerifyOutcome::Interrupted;
            }

            polls += 1;
            let health = match self.cluster.status(manifest).await {
                Ok(UnitHealth::Ready) => self.check_endpoint(&manifest.unit).await,
                Ok(health) => health,
                // Transient API trouble is not a verdict on the unit.
                Err(e) => {
                    debug!(unit, error = %e, "Status query failed");
                    UnitHealth::Progressing(e.to_string())
                }
            };

            let last_reason = match health {
                UnitHealth::Ready => {
                    info!(unit, polls, "Unit healthy");
                    break VerifyOutcome::Healthy;
                }
                UnitHealth::Failed(reason) => {
                    warn!(unit, %reason, "Unit unhealthy");
                    break VerifyOutcome::Unhealthy { reason };
                }
                UnitHealth::Progressing(reason) => {
                    debug!(unit, %reason, "Unit not ready yet");
                    reason
                }
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(unit, %last_reason, "Timed out waiting for unit");
                break VerifyOutcome::TimedOut { last_reason };
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        };

        let result = VerifyResult {
            unit: unit.to_string(),
            outcome,
            polls,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if result.outcome != VerifyOutcome::Interrupted {
            step(unit, phase, result.phase());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::Applier;
    use crate::cluster::MemoryCluster;
    use crate::graph::Selection;
    use crate::lock::NoopLock;
    use crate::endpoint::EndpointCheck;
    use crate::store::MemoryManifestStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn configmap(name: &str) -> String {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n")
    }

    fn store() -> MemoryManifestStore {
        MemoryManifestStore::new()
            .with_unit(DeploymentUnit::new("postgres", "homelab", "postgres.yaml"), configmap("postgres"))
            .with_unit(
                DeploymentUnit::new("n8n", "homelab", "n8n.yaml").depends_on(["postgres"]),
                configmap("n8n"),
            )
    }

    fn config(timeout_secs: u64) -> VerifyConfig {
        VerifyConfig {
            poll_interval: Duration::from_secs(1),
            unit_timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn apply(cluster: &Arc<MemoryCluster>, store: &MemoryManifestStore) -> ApplyReport {
        Applier::new(cluster.clone(), Arc::new(NoopLock))
            .apply_pass(store, &Selection::all(store.list_units().unwrap()))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_progressing() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;
        cluster.script_health(
            "n8n",
            [
                UnitHealth::Progressing("0/1 replicas ready".into()),
                UnitHealth::Progressing("0/1 replicas ready".into()),
                UnitHealth::Ready,
            ],
        );

        let verified = Verifier::new(cluster.clone(), config(30))
            .verify(&report, &store)
            .await
            .unwrap();

        assert!(verified.all_healthy());
        assert_eq!(verified.result("n8n").unwrap().polls, 3);
        assert_eq!(verified.result("postgres").unwrap().polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;
        cluster.script_health("n8n", [UnitHealth::Progressing("0/1 replicas ready".into())]);

        let verified = Verifier::new(cluster.clone(), config(5))
            .verify(&report, &store)
            .await
            .unwrap();

        let n8n = verified.result("n8n").unwrap();
        assert_eq!(
            n8n.outcome,
            VerifyOutcome::TimedOut {
                last_reason: "0/1 replicas ready".into()
            }
        );
        assert_eq!(n8n.phase(), UnitPhase::TimedOut);
        assert!(matches!(
            n8n.error(Duration::from_secs(5)),
            Some(ErrorKind::VerificationTimeout { timeout_secs: 5, .. })
        ));
        // One poll at the start and one per elapsed second.
        assert_eq!(n8n.polls, 6);
        assert!(!verified.all_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_unhealthy_without_waiting() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;
        cluster.script_health(
            "postgres",
            [UnitHealth::Failed("pod/postgres-0: CrashLoopBackOff".into())],
        );

        let verified = Verifier::new(cluster.clone(), config(60))
            .verify(&report, &store)
            .await
            .unwrap();

        let postgres = verified.result("postgres").unwrap();
        assert_eq!(postgres.polls, 1);
        assert_eq!(postgres.phase(), UnitPhase::Unhealthy);
        assert_eq!(verified.counts().unhealthy, 1);
        assert_eq!(verified.counts().healthy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_errors_count_as_progressing() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;
        cluster.fail_status("postgres");

        let verified = Verifier::new(cluster.clone(), config(3))
            .verify(&report, &store)
            .await
            .unwrap();

        assert!(matches!(
            verified.result("postgres").unwrap().outcome,
            VerifyOutcome::TimedOut { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unapplied_units_are_never_healthy() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        cluster.reject("postgres", "invalid");
        let report = apply(&cluster, &store).await;

        let verified = Verifier::new(cluster.clone(), config(5))
            .verify(&report, &store)
            .await
            .unwrap();

        assert!(!verified.all_healthy());
        for unit in ["postgres", "n8n"] {
            let result = verified.result(unit).unwrap();
            assert_eq!(result.outcome, VerifyOutcome::NotApplied);
            assert_eq!(cluster.status_calls(unit), 0);
        }
        assert_eq!(verified.counts().not_applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_stops_polling() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;
        cluster.script_health("postgres", [UnitHealth::Progressing("0/1 replicas ready".into())]);

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = interrupt.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(3500)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let verified = Verifier::new(cluster.clone(), config(300))
            .with_interrupt(interrupt)
            .verify(&report, &store)
            .await
            .unwrap();

        let postgres = verified.result("postgres").unwrap();
        assert_eq!(postgres.outcome, VerifyOutcome::Interrupted);
        assert_eq!(postgres.polls, 4);
        assert!(postgres.elapsed_ms < 5_000);
        assert_eq!(postgres.phase(), UnitPhase::Applied);

        let n8n = verified.result("n8n").unwrap();
        assert_eq!(n8n.outcome, VerifyOutcome::Interrupted);
        assert_eq!(cluster.status_calls("n8n"), 0);

        assert!(verified.interrupted());
        assert!(!verified.all_healthy());
        assert_eq!(verified.counts().interrupted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_removed_after_apply_is_unhealthy() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = store();
        let report = apply(&cluster, &store).await;

        let trimmed = MemoryManifestStore::new().with_unit(
            DeploymentUnit::new("postgres", "homelab", "postgres.yaml"),
            configmap("postgres"),
        );
        let verified = Verifier::new(cluster.clone(), config(5))
            .verify(&report, &trimmed)
            .await
            .unwrap();

        assert_eq!(
            verified.result("n8n").unwrap().outcome,
            VerifyOutcome::Unhealthy {
                reason: "applied but no longer in the manifest store".into()
            }
        );
        assert_eq!(cluster.status_calls("n8n"), 0);
        assert!(verified.result("postgres").unwrap().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_manifest_is_still_verified() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut store = store();
        let report = apply(&cluster, &store).await;

        store.insert(
            DeploymentUnit::new("postgres", "homelab", "postgres.yaml"),
            format!("{}data:\n  v: '2'\n", configmap("postgres")),
        );
        let verified = Verifier::new(cluster.clone(), config(5))
            .verify(&report, &store)
            .await
            .unwrap();

        assert!(verified.result("postgres").unwrap().is_healthy());
        assert_eq!(cluster.status_calls("postgres"), 1);
    }

    /// Answers from a script; the last answer repeats.
    struct ScriptedEndpoint {
        answers: Mutex<Vec<UnitHealth>>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EndpointCheck for ScriptedEndpoint {
        async fn check(&self, url: &str) -> UnitHealth {
            self.urls.lock().unwrap().push(url.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0].clone()
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_url_must_answer_before_healthy() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = MemoryManifestStore::new().with_unit(
            DeploymentUnit::new("n8n", "homelab", "n8n.yaml")
                .with_health_url("http://n8n.homelab.svc:5678/healthz"),
            configmap("n8n"),
        );
        let report = apply(&cluster, &store).await;
        let endpoint = Arc::new(ScriptedEndpoint {
            answers: Mutex::new(vec![
                UnitHealth::Progressing("GET returned 502 Bad Gateway".into()),
                UnitHealth::Ready,
            ]),
            urls: Mutex::new(Vec::new()),
        });

        let verified = Verifier::new(cluster.clone(), config(30))
            .with_endpoint_check(endpoint.clone())
            .verify(&report, &store)
            .await
            .unwrap();

        let n8n = verified.result("n8n").unwrap();
        assert!(n8n.is_healthy());
        assert_eq!(n8n.polls, 2);
        assert_eq!(endpoint.urls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_url_not_checked_until_objects_ready() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = MemoryManifestStore::new().with_unit(
            DeploymentUnit::new("n8n", "homelab", "n8n.yaml")
                .with_health_url("http://n8n.homelab.svc:5678/healthz"),
            configmap("n8n"),
        );
        let report = apply(&cluster, &store).await;
        cluster.script_health("n8n", [UnitHealth::Progressing("0/1 replicas ready".into())]);
        let endpoint = Arc::new(ScriptedEndpoint {
            answers: Mutex::new(vec![UnitHealth::Ready]),
            urls: Mutex::new(Vec::new()),
        });

        let verified = Verifier::new(cluster.clone(), config(3))
            .with_endpoint_check(endpoint.clone())
            .verify(&report, &store)
            .await
            .unwrap();

        assert!(matches!(
            verified.result("n8n").unwrap().outcome,
            VerifyOutcome::TimedOut { .. }
        ));
        assert!(endpoint.urls.lock().unwrap().is_empty());
    }
}
