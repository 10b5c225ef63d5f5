//! Run history persistence.
//!
//! The outcome of the most recent apply and verify is written under the store
//! root so `status` and a later `verify` can see it. The record is
//! informational and never drives automatic actions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::applier::ApplyReport;
use crate::verifier::VerifyReport;

/// File name of the run record inside the state directory.
pub const RUN_FILE: &str = "last-run.json";

/// Outcome of the most recent run against a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRecord {
    /// When the record was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// kubectl context the run targeted, if one was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyReport>,
}

impl RunRecord {
    /// Path of the run record for a state directory.
    #[must_use]
    pub fn state_file(state_dir: &Path) -> PathBuf {
        state_dir.join(RUN_FILE)
    }

    /// Load the last run record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(state_dir);
        if !path.exists() {
            debug!(path = %path.display(), "No run record");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run record {}", path.display()))?;
        let record: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record {}", path.display()))?;
        Ok(Some(record))
    }

    /// Write the record, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory or file cannot be written.
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());

        std::fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory {}", state_dir.display())
        })?;

        let path = Self::state_file(state_dir);
        let content = serde_json::to_string_pretty(self).context("Failed to serialize run record")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write run record {}", path.display()))?;

        info!(path = %path.display(), "Saved run record");
        Ok(())
    }

    /// Record a new apply pass. Any earlier verification is discarded.
    pub fn record_apply(&mut self, report: ApplyReport) {
        self.apply = Some(report);
        self.verify = None;
    }

    pub fn record_verify(&mut self, report: VerifyReport) {
        self.verify = Some(report);
    }
}
