//! Dependency-ordered manifest applier and verifier for a homelab cluster.
//!
//! The manifest store lists [`DeploymentUnit`]s and their manifests. An
//! [`Applier`] applies a selection of them in dependency order, stopping at
//! the first rejection, and a [`Verifier`] then polls the applied units until
//! they are ready or time out. The live cluster is reached only through
//! [`ClusterApi`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use homelab_deploy::{
//!     Applier, FsManifestStore, KubeCluster, Kubectl, ManifestStore, NoopLock, Selection,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = FsManifestStore::new("deploy");
//! let cluster = Arc::new(KubeCluster::connect(Kubectl::default(), None, None).await?);
//! let selection = Selection::all(store.list_units()?);
//! let report = Applier::new(cluster, Arc::new(NoopLock))
//!     .apply_pass(&store, &selection)
//!     .await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod applier;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod graph;
pub mod lock;
pub mod observer;
pub mod prereq;
pub mod endpoint;
pub mod state;
pub mod store;
pub mod ui;
pub mod unit;
pub mod verifier;

pub use applier::{Applier, ApplyReport, PlanReport, UnitResult};
pub use cluster::{ClusterApi, ClusterError, KubeCluster, Kubectl, MemoryCluster, UnitHealth};
pub use config::DeployConfig;
pub use error::{ApplyError, ApplyResult, ErrorKind};
pub use graph::{apply_order, select, GraphError, Selection};
pub use lock::{LeaseLock, MemoryLock, NoopLock, PassLock};
pub use endpoint::{EndpointCheck, HttpEndpointCheck};
pub use store::{FsManifestStore, Manifest, ManifestStore, MemoryManifestStore, StoreError};
pub use unit::{DeploymentUnit, UnitPhase};
pub use verifier::{Verifier, VerifyConfig, VerifyOutcome, VerifyReport};
