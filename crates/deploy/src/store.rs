//! Manifest store: the version-controlled source of desired state.
//!
//! A store is a directory with a `units.yaml` index listing deployment units
//! in enumeration order, plus the manifest files those units point at:
//!
//! ```yaml
//! units:
//!   - name: namespace
//!     namespace: homelab
//!     manifest: 00-namespace/namespace.yaml
//!   - name: postgres
//!     namespace: homelab
//!     manifest: 10-data/postgres.yaml
//!     dependsOn: [namespace]
//! ```
//!
//! The store is passive. Ordering by dependencies lives in [`crate::graph`].

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::unit::DeploymentUnit;

/// Index file name at the store root.
pub const INDEX_FILE: &str = "units.yaml";

/// Errors raised while reading the manifest store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid unit index {path}: {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unit name must not be empty")]
    EmptyName,

    #[error("duplicate unit: {0}")]
    DuplicateUnit(String),

    #[error("unit {0} depends on itself")]
    SelfDependency(String),

    #[error("unit {unit} has manifest path outside the store: {path}")]
    InvalidPath { unit: String, path: PathBuf },

    #[error("invalid manifest for unit {unit}: {reason}")]
    InvalidManifest { unit: String, reason: String },

    #[error("no manifest content for unit {0}")]
    MissingManifest(String),
}

/// Passive collaborator exposing units and their manifests.
pub trait ManifestStore: Send + Sync {
    /// All units, in store enumeration order.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or is invalid.
    fn list_units(&self) -> Result<Vec<DeploymentUnit>, StoreError>;

    /// Read and parse the manifest content of a unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is missing or not a valid manifest.
    fn read_manifest(&self, unit: &DeploymentUnit) -> Result<Manifest, StoreError>;
}

/// One Kubernetes object declared in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Namespace from `metadata.namespace`, if set.
    pub namespace: Option<String>,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.to_lowercase(), self.name)
    }
}

/// Parsed manifest content of one unit.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Owning unit.
    pub unit: DeploymentUnit,
    /// Raw YAML, submitted to the cluster as-is.
    pub content: String,
    /// SHA-1 of the raw content, hex encoded.
    pub digest: String,
    /// Objects declared by the manifest, in document order.
    pub resources: Vec<ResourceRef>,
}

impl Manifest {
    /// Parse multi-document YAML for a unit.
    ///
    /// Empty documents are ignored. Every other document must be a mapping
    /// carrying `apiVersion`, `kind` and `metadata.name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidManifest`] on malformed YAML, incomplete
    /// objects, or a manifest that declares nothing.
    pub fn parse(unit: &DeploymentUnit, content: &str) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidManifest {
            unit: unit.name.clone(),
            reason,
        };

        let mut resources = Vec::new();
        for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| invalid(format!("document {index}: {e}")))?;
            if value.is_null() {
                continue;
            }

            let field = |path: &[&str]| -> Option<String> {
                let mut current = &value;
                for key in path {
                    current = current.get(*key)?;
                }
                current.as_str().map(ToString::to_string)
            };

            let missing = |what: &str| invalid(format!("document {index}: missing {what}"));
            let api_version = field(&["apiVersion"]).ok_or_else(|| missing("apiVersion"))?;
            let kind = field(&["kind"]).ok_or_else(|| missing("kind"))?;
            let name = field(&["metadata", "name"]).ok_or_else(|| missing("metadata.name"))?;

            resources.push(ResourceRef {
                api_version,
                kind,
                name,
                namespace: field(&["metadata", "namespace"]),
            });
        }

        if resources.is_empty() {
            return Err(invalid("manifest declares no resources".to_string()));
        }

        Ok(Self {
            unit: unit.clone(),
            content: content.to_string(),
            digest: digest(content),
            resources,
        })
    }
}

/// Hex SHA-1 of manifest content.
#[must_use]
pub fn digest(content: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Deserialize)]
struct UnitIndex {
    #[serde(default, deserialize_with = "null_as_empty")]
    units: Vec<DeploymentUnit>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<DeploymentUnit>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<DeploymentUnit>>::deserialize(deserializer)?.unwrap_or_default())
}

fn check_units(units: &[DeploymentUnit]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for unit in units {
        if unit.name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        if !seen.insert(unit.name.as_str()) {
            return Err(StoreError::DuplicateUnit(unit.name.clone()));
        }
        if unit.depends_on.iter().any(|dep| dep == &unit.name) {
            return Err(StoreError::SelfDependency(unit.name.clone()));
        }
    }
    Ok(())
}

/// Manifest store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsManifestStore {
    root: PathBuf,
}

impl FsManifestStore {
    /// Open a store rooted at `root`.
    ///
    /// The index is read lazily by [`ManifestStore::list_units`].
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the index file.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn manifest_file(&self, unit: &DeploymentUnit) -> Result<PathBuf, StoreError> {
        let escapes = unit.manifest_path.is_absolute()
            || unit
                .manifest_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || unit.manifest_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidPath {
                unit: unit.name.clone(),
                path: unit.manifest_path.clone(),
            });
        }
        Ok(self.root.join(&unit.manifest_path))
    }
}

impl ManifestStore for FsManifestStore {
    fn list_units(&self) -> Result<Vec<DeploymentUnit>, StoreError> {
        let path = self.index_path();
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let index: UnitIndex =
            serde_yaml::from_str(&content).map_err(|source| StoreError::Index { path, source })?;

        check_units(&index.units)?;
        for unit in &index.units {
            self.manifest_file(unit)?;
        }

        debug!(root = %self.root.display(), units = index.units.len(), "Loaded unit index");
        Ok(index.units)
    }

    fn read_manifest(&self, unit: &DeploymentUnit) -> Result<Manifest, StoreError> {
        let path = self.manifest_file(unit)?;
        let content =
            std::fs::read_to_string(&path).map_err(|source| StoreError::Io { path, source })?;
        Manifest::parse(unit, &content)
    }
}

/// In-memory store, for tests and library callers that build units in code.
#[derive(Debug, Clone, Default)]
pub struct MemoryManifestStore {
    units: Vec<DeploymentUnit>,
    contents: BTreeMap<String, String>,
}

impl MemoryManifestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit with its manifest content.
    #[must_use]
    pub fn with_unit(mut self, unit: DeploymentUnit, content: impl Into<String>) -> Self {
        self.insert(unit, content);
        self
    }

    /// Append a unit, or replace the content of an existing one.
    pub fn insert(&mut self, unit: DeploymentUnit, content: impl Into<String>) {
        self.contents.insert(unit.name.clone(), content.into());
        if let Some(existing) = self.units.iter_mut().find(|u| u.name == unit.name) {
            *existing = unit;
        } else {
            self.units.push(unit);
        }
    }
}

impl ManifestStore for MemoryManifestStore {
    fn list_units(&self) -> Result<Vec<DeploymentUnit>, StoreError> {
        check_units(&self.units)?;
        Ok(self.units.clone())
    }

    fn read_manifest(&self, unit: &DeploymentUnit) -> Result<Manifest, StoreError> {
        let content = self
            .contents
            .get(&unit.name)
            .ok_or_else(|| StoreError::MissingManifest(unit.name.clone()))?;
        Manifest::parse(unit, content)
    }
}
