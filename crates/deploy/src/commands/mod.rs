//! CLI subcommands.

pub mod apply;
pub mod check;
pub mod plan;
pub mod status;
pub mod verify;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::warn;

use crate::cluster::{KubeCluster, Kubectl};
use crate::config::DeployConfig;
use crate::graph::{self, Selection};
use crate::store::{FsManifestStore, ManifestStore};

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Manifest store root (directory holding units.yaml).
    #[arg(long, global = true, env = "HDEPLOY_STORE", default_value = ".")]
    pub store: PathBuf,

    /// Path to kubeconfig file.
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// kubeconfig context to use.
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Config file (default: hdeploy.yaml in the store root).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// kubectl binary.
    #[arg(long, global = true, env = "HDEPLOY_KUBECTL")]
    pub kubectl: Option<PathBuf>,

    /// Print reports as JSON.
    #[arg(long, global = true, default_value = "false")]
    pub json: bool,
}

/// Unit selection flags.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectArgs {
    /// Units to include (default: all).
    pub units: Vec<String>,

    /// Do not pull in dependencies of the named units; treat them as
    /// already applied.
    #[arg(long, default_value = "false")]
    pub only: bool,
}

/// Verification timing overrides.
#[derive(Args, Debug, Clone, Default)]
pub struct TimingArgs {
    /// Seconds a unit is given to become ready.
    #[arg(long)]
    pub unit_timeout: Option<u64>,

    /// Seconds between health polls.
    #[arg(long)]
    pub poll_interval: Option<u64>,
}

impl TimingArgs {
    /// Apply the overrides to `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override is zero.
    pub fn apply_to(&self, config: &mut DeployConfig) -> Result<()> {
        if let Some(secs) = self.unit_timeout {
            config.unit_timeout_secs = secs;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        config.validate()
    }
}

/// Everything a command needs, resolved from the global flags.
pub struct CommandContext {
    pub store: FsManifestStore,
    pub config: DeployConfig,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub json: bool,
}

impl CommandContext {
    /// Resolve the store and load configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the store root does not exist or the config file
    /// is invalid.
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let root = global.store.canonicalize().with_context(|| {
            format!("Manifest store {} not found", global.store.display())
        })?;

        let mut config = DeployConfig::load(global.config.as_deref(), &root)?;
        if let Some(kubectl) = &global.kubectl {
            config.kubectl.clone_from(kubectl);
        }

        Ok(Self {
            store: FsManifestStore::new(root),
            config,
            kubeconfig: global.kubeconfig.clone(),
            context: global.context.clone(),
            json: global.json,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir(self.store.root())
    }

    pub fn kubectl(&self) -> Kubectl {
        Kubectl::new(&self.config.kubectl)
            .with_kubeconfig(self.kubeconfig.clone())
            .with_context(self.context.clone())
    }

    /// Connect to the target cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable kubeconfig is found.
    pub async fn connect(&self) -> Result<Arc<KubeCluster>> {
        let cluster = KubeCluster::connect(
            self.kubectl(),
            self.kubeconfig.as_deref(),
            self.context.as_deref(),
        )
        .await
        .context("Failed to connect to cluster")?;
        Ok(Arc::new(cluster))
    }

    /// Read the store and select units.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is invalid or a named unit is unknown.
    pub fn select(&self, args: &SelectArgs) -> Result<Selection> {
        let units = self
            .store
            .list_units()
            .with_context(|| format!("Failed to read {}", self.store.index_path().display()))?;
        let selection = graph::select(&units, &args.units, !args.only)?;
        Ok(selection)
    }
}

/// Set the returned flag on the first Ctrl-C.
///
/// The apply pass stops before its next unit and verification before its next
/// poll.
pub fn interrupt_on_ctrl_c() -> Arc<AtomicBool> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            flag.store(true, Ordering::SeqCst);
        }
    });
    interrupt
}

/// Print `value` as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
