//! Prerequisite checks for `hdeploy check`.

use std::path::PathBuf;

use anyhow::Result;
use colored::Colorize;
use kube::config::Kubeconfig;

use crate::cluster::Kubectl;
use crate::graph;
use crate::store::{FsManifestStore, ManifestStore};
use crate::ui;

/// Outcome of one prerequisite.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
    pub hint: String,
    /// A failed critical check makes `check` fail.
    pub critical: bool,
}

impl CheckResult {
    fn new(name: &str, outcome: Result<String, String>, hint: &str, critical: bool) -> Self {
        let (passed, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        Self {
            name: name.to_string(),
            passed,
            detail: (!detail.is_empty()).then_some(detail),
            hint: hint.to_string(),
            critical,
        }
    }
}

/// Validates what an apply pass needs before one is attempted.
pub struct PrerequisitesValidator {
    kubectl: Kubectl,
    kubeconfig: Option<PathBuf>,
    store: FsManifestStore,
}

impl PrerequisitesValidator {
    #[must_use]
    pub fn new(kubectl: Kubectl, kubeconfig: Option<PathBuf>, store: FsManifestStore) -> Self {
        Self {
            kubectl,
            kubeconfig,
            store,
        }
    }

    /// Run every check.
    pub async fn run(&self) -> Vec<CheckResult> {
        vec![
            CheckResult::new(
                "kubectl",
                self.kubectl
                    .client_version()
                    .await
                    .map_err(|e| e.to_string()),
                "Install kubectl from https://kubernetes.io/docs/tasks/tools/",
                true,
            ),
            CheckResult::new(
                "kubeconfig",
                self.check_kubeconfig(),
                "Pass --kubeconfig or set KUBECONFIG",
                true,
            ),
            CheckResult::new(
                "manifest store",
                self.check_store(),
                "Fix units.yaml or the manifests it references",
                true,
            ),
        ]
    }

    fn check_kubeconfig(&self) -> Result<String, String> {
        let config = match &self.kubeconfig {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| e.to_string())?;

        match config.current_context {
            Some(context) => Ok(format!("current context {context}")),
            None if config.contexts.is_empty() => Err("no contexts defined".to_string()),
            None => Ok(format!("{} contexts", config.contexts.len())),
        }
    }

    fn check_store(&self) -> Result<String, String> {
        let units = self.store.list_units().map_err(|e| e.to_string())?;
        let order = graph::apply_order(&units).map_err(|e| e.to_string())?;
        for unit in &order {
            self.store.read_manifest(unit).map_err(|e| e.to_string())?;
        }
        Ok(format!("{} units", order.len()))
    }

    /// Run and print every check.
    ///
    /// # Errors
    ///
    /// Returns an error if a critical check failed.
    pub async fn validate(&self) -> Result<()> {
        println!();
        let results = self.run().await;
        for result in &results {
            ui::print_check_result(&result.name, result.passed, result.detail.as_deref());
        }
        println!();

        let failures: Vec<&CheckResult> = results.iter().filter(|r| !r.passed).collect();
        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
            return Ok(());
        }

        ui::print_warning("Some prerequisites are not met:");
        println!();
        for failure in &failures {
            println!(
                "  {} {} - {}",
                "✗".red(),
                failure.name.red(),
                failure.hint.bright_black()
            );
        }
        println!();

        if failures.iter().any(|f| f.critical) {
            anyhow::bail!("Critical prerequisites not met");
        }
        Ok(())
    }
}
