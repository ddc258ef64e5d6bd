use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::store::paths::ProjectPaths;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BLAME_TIMEOUT_MS: u64 = 3000;

/// Project-level migration settings, read from `.flowforge/migration.yaml`
/// when present. Command-line flags are layered on top via [`Overrides`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    pub time_log: PathBuf,
    pub schedule: PathBuf,
    pub task_list: PathBuf,
    pub batch_size: usize,
    pub blame: bool,
    pub blame_timeout_ms: u64,
    pub anonymize: bool,
    pub mark_encrypted: bool,
    pub keep_checkpoints: bool,
    pub non_billable_statuses: Vec<String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            time_log: PathBuf::from("TIME.md"),
            schedule: PathBuf::from("SCHEDULE.md"),
            task_list: PathBuf::from("TASKS.md"),
            batch_size: DEFAULT_BATCH_SIZE,
            blame: true,
            blame_timeout_ms: DEFAULT_BLAME_TIMEOUT_MS,
            anonymize: false,
            mark_encrypted: false,
            keep_checkpoints: false,
            non_billable_statuses: vec![
                "non-billable".into(),
                "nonbillable".into(),
                "unbilled".into(),
            ],
        }
    }
}

/// Flag values from the command line. `None`/`false` leaves the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub batch_size: Option<usize>,
    pub anonymize: bool,
    pub mark_encrypted: bool,
    pub keep_checkpoints: bool,
    pub no_blame: bool,
}

impl MigrationConfig {
    /// Load the project config, falling back to defaults when the file is absent.
    pub fn load(paths: &ProjectPaths) -> Result<Self> {
        let path = paths.config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&data)
            .map_err(|e| MigrateError::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(size) = overrides.batch_size {
            self.batch_size = size;
        }
        self.anonymize |= overrides.anonymize;
        self.mark_encrypted |= overrides.mark_encrypted;
        self.keep_checkpoints |= overrides.keep_checkpoints;
        if overrides.no_blame {
            self.blame = false;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrateError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        for (name, path) in [
            ("time_log", &self.time_log),
            ("schedule", &self.schedule),
            ("task_list", &self.task_list),
        ] {
            if path.as_os_str().is_empty() {
                return Err(MigrateError::InvalidConfig(format!("{name} cannot be empty")));
            }
            let escapes = path
                .components()
                .any(|c| matches!(c, Component::RootDir | Component::Prefix(_) | Component::ParentDir));
            if escapes {
                return Err(MigrateError::InvalidConfig(format!(
                    "{name} must be relative to the project root: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn blame_timeout(&self) -> Duration {
        Duration::from_millis(self.blame_timeout_ms)
    }

    /// Resolve a configured source path against the project root. Validation
    /// keeps every configured path inside the root.
    pub fn source_path(&self, root: &Path, configured: &Path) -> PathBuf {
        root.join(configured)
    }
}
