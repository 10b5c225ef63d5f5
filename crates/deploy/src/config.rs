//! Deployment configuration.
//!
//! Read from `--config FILE`, else `hdeploy.yaml` at the store root, else
//! built-in defaults. Command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::verifier::VerifyConfig;

/// Config file looked up at the store root.
pub const CONFIG_FILE: &str = "hdeploy.yaml";

/// Apply lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockConfig {
    /// Namespace holding the lock Lease.
    pub namespace: String,
    /// Lease name.
    pub name: String,
    /// Lease duration; renewed every third of it while a pass runs.
    pub lease_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            name: "hdeploy-apply-lock".to_string(),
            lease_seconds: 60,
        }
    }
}

/// Tool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeployConfig {
    /// Seconds between health polls of one unit.
    pub poll_interval_secs: u64,
    /// Seconds a unit is given to become ready.
    pub unit_timeout_secs: u64,
    pub lock: LockConfig,
    /// kubectl binary.
    pub kubectl: PathBuf,
    /// Run state directory, relative to the store root.
    pub state_dir: PathBuf,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            unit_timeout_secs: 300,
            lock: LockConfig::default(),
            kubectl: PathBuf::from("kubectl"),
            state_dir: PathBuf::from(".hdeploy"),
        }
    }
}

impl DeployConfig {
    /// Load configuration for a store.
    ///
    /// An explicit path must exist. Without one, `hdeploy.yaml` in the store
    /// root is used when present.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read, parsed or validated.
    pub fn load(explicit: Option<&Path>, store_root: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = store_root.join(CONFIG_FILE);
                if !candidate.exists() {
                    debug!("No config file, using defaults");
                    return Ok(Self::default());
                }
                candidate
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;

        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Reject zero durations.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("pollIntervalSecs must be greater than zero");
        }
        if self.unit_timeout_secs == 0 {
            bail!("unitTimeoutSecs must be greater than zero");
        }
        if self.lock.lease_seconds == 0 {
            bail!("lock.leaseSeconds must be greater than zero");
        }
        Ok(())
    }

    #[must_use]
    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            unit_timeout: Duration::from_secs(self.unit_timeout_secs),
        }
    }

    /// State directory resolved against the store root.
    #[must_use]
    pub fn state_dir(&self, store_root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            store_root.join(&self.state_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = DeployConfig::load(None, dir.path()).unwrap();
        assert_eq!(config, DeployConfig::default());
        assert_eq!(config.verify_config().unit_timeout, Duration::from_secs(300));
        assert_eq!(config.state_dir(dir.path()), dir.path().join(".hdeploy"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "unitTimeoutSecs: 120\nlock:\n  namespace: homelab\n",
        )
        .unwrap();

        let config = DeployConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.unit_timeout_secs, 120);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.lock.namespace, "homelab");
        assert_eq!(config.lock.name, "hdeploy-apply-lock");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.yaml");
        std::fs::write(&path, "unitTimeoutSecs: 0\n").unwrap();

        let err = DeployConfig::load(Some(&path), dir.path()).unwrap_err();
        assert!(err.to_string().contains("unitTimeoutSecs"));
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(DeployConfig::load(Some(&missing), dir.path()).is_err());
    }
}
