//! `kubectl apply` / `kubectl diff` with manifests piped on stdin.

use std::path::PathBuf;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ApplyOutcome, ChangeAction, ClusterError, DiffOutcome, ResourceChange};
use crate::store::Manifest;

/// Field manager recorded on applied objects.
pub const FIELD_MANAGER: &str = "hdeploy";

/// Thin wrapper around the kubectl binary.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Default for Kubectl {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
        }
    }
}

impl Kubectl {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: Option<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Leading arguments selecting the cluster.
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args
    }

    /// Run kubectl with `yaml` on stdin.
    async fn run_with_stdin(&self, args: &[&str], yaml: &str) -> Result<Output, ClusterError> {
        let mut command = Command::new(&self.binary);
        command
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary.display(), ?args, "Running kubectl");
        let mut child = command.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(yaml.as_bytes()).await?;
            // Dropping stdin closes the pipe so kubectl sees EOF.
        }

        Ok(child.wait_with_output().await?)
    }

    /// Apply a unit's manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Rejected`] with kubectl's stderr when the apply
    /// fails, or [`ClusterError::Spawn`] if kubectl cannot be run.
    pub async fn apply(&self, manifest: &Manifest) -> Result<ApplyOutcome, ClusterError> {
        let namespace = manifest.unit.namespace.as_str();
        let output = self
            .run_with_stdin(
                &[
                    "apply",
                    "--namespace",
                    namespace,
                    "--field-manager",
                    FIELD_MANAGER,
                    "-f",
                    "-",
                ],
                &manifest.content,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::Rejected(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(ApplyOutcome::from_changes(parse_apply_output(&stdout)))
    }

    /// Server-side diff of a unit's manifest against live state.
    ///
    /// kubectl exits 0 when in sync, 1 when there is a diff, anything else on
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Rejected`] when kubectl reports an error.
    pub async fn diff(&self, manifest: &Manifest) -> Result<DiffOutcome, ClusterError> {
        let namespace = manifest.unit.namespace.as_str();
        let output = self
            .run_with_stdin(
                &[
                    "diff",
                    "--namespace",
                    namespace,
                    "--server-side",
                    "--field-manager",
                    FIELD_MANAGER,
                    "-f",
                    "-",
                ],
                &manifest.content,
            )
            .await?;

        match output.status.code() {
            Some(0) => Ok(DiffOutcome::InSync),
            Some(1) => Ok(DiffOutcome::Drifted(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            )),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ClusterError::Rejected(stderr.trim().to_string()))
            }
        }
    }

    /// Check that the kubectl client runs.
    ///
    /// # Errors
    ///
    /// Returns an error if kubectl is missing or fails.
    pub async fn client_version(&self) -> Result<String, ClusterError> {
        let output = Command::new(&self.binary)
            .args(["version", "--client"])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::Rejected(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse `kubectl apply` output lines such as `deployment.apps/n8n configured`.
///
/// Lines that do not look like `<kind>/<name> <action>` are ignored. A
/// trailing `(dry run)` or `(server dry run)` marker is dropped.
#[must_use]
pub fn parse_apply_output(stdout: &str) -> Vec<ResourceChange> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let resource = words.next()?;
            let action = words.next()?;
            if !resource.contains('/') {
                return None;
            }
            Some(ResourceChange {
                resource: resource.to_string(),
                action: ChangeAction::parse(action),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_output() {
        let stdout = "\
namespace/homelab unchanged
service/postgres created
statefulset.apps/postgres configured
Warning: resource is missing the last-applied annotation
";
        let changes = parse_apply_output(stdout);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].resource, "namespace/homelab");
        assert_eq!(changes[0].action, ChangeAction::Unchanged);
        assert_eq!(changes[1].action, ChangeAction::Created);
        assert_eq!(changes[2].resource, "statefulset.apps/postgres");
        assert_eq!(changes[2].action, ChangeAction::Configured);
    }

    #[test]
    fn test_all_unchanged_is_noop() {
        let stdout = "namespace/homelab unchanged\nservice/postgres unchanged\n";
        let outcome = ApplyOutcome::from_changes(parse_apply_output(stdout));
        assert!(!outcome.changed);
    }

    #[test]
    fn test_dry_run_marker_ignored() {
        let changes = parse_apply_output("configmap/app created (server dry run)\n");
        assert_eq!(changes[0].action, ChangeAction::Created);
    }

    #[test]
    fn test_base_args() {
        let kubectl = Kubectl::default()
            .with_kubeconfig(Some(PathBuf::from("/tmp/kubeconfig")))
            .with_context(Some("homelab".into()));
        assert_eq!(
            kubectl.base_args(),
            ["--kubeconfig", "/tmp/kubeconfig", "--context", "homelab"]
        );
        assert!(Kubectl::default().base_args().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let kubectl = Kubectl::new("/nonexistent/kubectl-for-tests");
        let err = kubectl.client_version().await.unwrap_err();
        assert!(matches!(err, ClusterError::Spawn(_)));
    }
}
