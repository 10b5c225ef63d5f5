//! Integration tests for apply and verify passes over the demo homelab store.
//!
//! The cluster is the in-memory `MemoryCluster`, so these tests run without
//! kubectl or a live API server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use homelab_deploy::graph::GraphError;
use homelab_deploy::state::RunRecord;
use homelab_deploy::{
    apply_order, select, Applier, ApplyError, EndpointCheck, ErrorKind, FsManifestStore,
    ManifestStore, MemoryCluster, MemoryLock, Selection, UnitHealth, UnitPhase, Verifier,
    VerifyConfig, VerifyOutcome,
};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn demo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/homelab")
}

fn demo_store() -> FsManifestStore {
    FsManifestStore::new(demo_root())
}

fn all(store: &FsManifestStore) -> Selection {
    Selection::all(store.list_units().unwrap())
}

fn names(units: &[homelab_deploy::DeploymentUnit]) -> Vec<&str> {
    units.iter().map(|u| u.name.as_str()).collect()
}

/// Health endpoints that always answer, recording what was checked.
#[derive(Default)]
struct RecordingEndpoint {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl EndpointCheck for RecordingEndpoint {
    async fn check(&self, url: &str) -> UnitHealth {
        self.urls.lock().unwrap().push(url.to_string());
        UnitHealth::Ready
    }
}

/// Copy the demo store into a temp dir so a test can edit it.
fn copy_demo() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("manifests")).unwrap();
    for entry in std::fs::read_dir(demo_root().join("manifests")).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), dir.path().join("manifests").join(entry.file_name()))
            .unwrap();
    }
    std::fs::copy(demo_root().join("units.yaml"), dir.path().join("units.yaml")).unwrap();
    dir
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_demo_store_order() {
    let units = demo_store().list_units().unwrap();
    let order = apply_order(&units).unwrap();
    assert_eq!(
        names(&order),
        ["namespace", "postgres", "redis", "qdrant", "n8n", "prometheus", "grafana", "ingress"]
    );
}

#[test]
fn test_demo_manifests_parse() {
    let store = demo_store();
    for unit in store.list_units().unwrap() {
        let manifest = store.read_manifest(&unit).unwrap();
        assert!(!manifest.resources.is_empty(), "{} declares no resources", unit.name);
    }
}

#[test]
fn test_selecting_n8n_pulls_in_dependencies() {
    let units = demo_store().list_units().unwrap();
    let selection = select(&units, &["n8n".to_string()], true).unwrap();
    assert_eq!(names(&selection.ordered().unwrap()), ["namespace", "postgres", "redis", "n8n"]);
    assert!(selection.assumed.is_empty());

    let only = select(&units, &["n8n".to_string()], false).unwrap();
    assert_eq!(names(&only.ordered().unwrap()), ["n8n"]);
    assert_eq!(
        only.assumed.iter().map(String::as_str).collect::<Vec<_>>(),
        ["postgres", "redis"]
    );
}

#[test]
fn test_cycle_in_edited_store_is_reported() {
    let dir = copy_demo();
    let index = std::fs::read_to_string(dir.path().join("units.yaml")).unwrap();
    // Make the namespace depend on the ingress that transitively needs it.
    let index = index.replace(
        "    manifest: manifests/namespace.yaml\n",
        "    manifest: manifests/namespace.yaml\n    dependsOn: [ingress]\n",
    );
    std::fs::write(dir.path().join("units.yaml"), index).unwrap();

    let units = FsManifestStore::new(dir.path()).list_units().unwrap();
    let err = apply_order(&units).unwrap_err();
    let GraphError::Cycle { path } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert_eq!(path.first(), path.last());
    assert!(path.contains(&"namespace".to_string()));
}

// =============================================================================
// Apply and verify
// =============================================================================

#[tokio::test]
async fn test_full_pass_then_noop_rerun() {
    let store = demo_store();
    let cluster = Arc::new(MemoryCluster::new());
    let applier = Applier::new(cluster.clone(), Arc::new(MemoryLock::new()));

    let first = applier.apply_pass(&store, &all(&store)).await.unwrap();
    assert!(first.succeeded());
    assert_eq!(first.counts().changed, 8);

    let second = applier.apply_pass(&store, &all(&store)).await.unwrap();
    assert!(second.succeeded());
    assert_eq!(second.counts().unchanged, 8);
    assert_eq!(cluster.mutations(), 8);
}

#[tokio::test]
async fn test_postgres_rejection_blocks_n8n_and_ingress() {
    let store = demo_store();
    let cluster = Arc::new(MemoryCluster::new());
    let lock = Arc::new(MemoryLock::new());
    cluster.reject("postgres", "admission webhook denied the request");

    let report = Applier::new(cluster.clone(), lock.clone())
        .apply_pass(&store, &all(&store))
        .await
        .unwrap();

    let phase = |unit: &str| report.result(unit).unwrap().phase;
    assert_eq!(phase("namespace"), UnitPhase::Applied);
    assert_eq!(phase("postgres"), UnitPhase::Failed);
    assert_eq!(phase("n8n"), UnitPhase::DependencyUnmet);
    assert_eq!(phase("ingress"), UnitPhase::DependencyUnmet);
    for unit in ["redis", "qdrant", "prometheus", "grafana"] {
        assert_eq!(phase(unit), UnitPhase::Skipped, "{unit}");
    }
    assert_eq!(cluster.attempts(), ["namespace", "postgres"]);
    assert!(!lock.is_held());

    // Fix and re-run: the namespace is a no-op, everything else applies.
    cluster.accept("postgres");
    let rerun = Applier::new(cluster.clone(), lock)
        .apply_pass(&store, &all(&store))
        .await
        .unwrap();
    assert!(rerun.succeeded());
    assert!(rerun.result("namespace").unwrap().is_noop());
    assert_eq!(rerun.counts().changed, 7);
}

#[test]
fn test_unknown_unit_selection_fails_before_apply() {
    let units = demo_store().list_units().unwrap();
    let err = select(&units, &["jellyfin".to_string()], true).unwrap_err();
    assert_eq!(err, GraphError::UnknownUnit("jellyfin".into()));
}

#[tokio::test]
async fn test_held_lock_stops_second_pass() {
    let store = demo_store();
    let cluster = Arc::new(MemoryCluster::new());
    let lock = Arc::new(MemoryLock::new());
    homelab_deploy::PassLock::acquire(lock.as_ref()).await.unwrap();

    let err = Applier::new(cluster.clone(), lock)
        .apply_pass(&store, &all(&store))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Lock(_)));
    assert!(cluster.attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_apply_then_verify_with_slow_unit() {
    let store = demo_store();
    let cluster = Arc::new(MemoryCluster::new());
    let report = Applier::new(cluster.clone(), Arc::new(MemoryLock::new()))
        .apply_pass(&store, &all(&store))
        .await
        .unwrap();

    cluster.script_health("qdrant", [UnitHealth::Progressing("0/1 replicas ready".into())]);
    cluster.script_health(
        "postgres",
        [
            UnitHealth::Progressing("0/1 replicas ready".into()),
            UnitHealth::Ready,
        ],
    );

    let config = VerifyConfig {
        poll_interval: Duration::from_secs(2),
        unit_timeout: Duration::from_secs(10),
    };
    let endpoints = Arc::new(RecordingEndpoint::default());
    let verified = Verifier::new(cluster.clone(), config)
        .with_endpoint_check(endpoints.clone())
        .verify(&report, &store)
        .await
        .unwrap();

    assert!(!verified.all_healthy());
    assert_eq!(
        *endpoints.urls.lock().unwrap(),
        [
            "http://n8n.homelab.svc.cluster.local:5678/healthz",
            "http://grafana.homelab.svc.cluster.local:3000/api/health",
        ]
    );
    assert!(verified.result("postgres").unwrap().is_healthy());
    let qdrant = verified.result("qdrant").unwrap();
    assert!(matches!(qdrant.outcome, VerifyOutcome::TimedOut { .. }));
    assert!(matches!(
        qdrant.error(config.unit_timeout),
        Some(ErrorKind::VerificationTimeout { timeout_secs: 10, .. })
    ));
    assert_eq!(verified.counts().healthy, 7);

    // Results follow application order.
    let order: Vec<_> = verified.results.iter().map(|r| r.unit.as_str()).collect();
    assert_eq!(order.first(), Some(&"namespace"));
    assert_eq!(order.last(), Some(&"ingress"));
}

#[tokio::test]
async fn test_run_record_round_trip() {
    let store = demo_store();
    let cluster = Arc::new(MemoryCluster::new());
    let report = Applier::new(cluster, Arc::new(MemoryLock::new()))
        .apply_pass(&store, &all(&store))
        .await
        .unwrap();

    let state = TempDir::new().unwrap();
    let mut record = RunRecord::default();
    record.record_apply(report);
    record.save(state.path()).unwrap();

    let loaded = RunRecord::load(state.path()).unwrap().unwrap();
    let apply = loaded.apply.unwrap();
    assert_eq!(apply.results.len(), 8);
    assert!(apply.succeeded());
}
