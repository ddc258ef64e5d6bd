use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::model::{Grammar, SCHEMA_VERSION};
use crate::store::files::{read_json, write_json_atomic};

/// Orchestrator states. `RolledBack` is reachable from any state after
/// `Locked`; `DryRun` is a side path that never writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStep {
    Idle,
    Locked,
    BackingUp,
    Parsing,
    ValidatingInput,
    Processing,
    ValidatingOutput,
    Committed,
    RolledBack,
    DryRun,
}

impl std::fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::BackingUp => "backing-up",
            Self::Parsing => "parsing",
            Self::ValidatingInput => "validating-input",
            Self::Processing => "processing",
            Self::ValidatingOutput => "validating-output",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
            Self::DryRun => "dry-run",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub sessions_processed: usize,
    pub total_sessions: usize,
    pub minutes_processed: u64,
}

impl Progress {
    pub fn percent_complete(&self) -> u8 {
        if self.total_batches == 0 {
            return 100;
        }
        ((self.completed_batches * 100) / self.total_batches).min(100) as u8
    }
}

/// Everything a resumed run needs to continue with the same settings the
/// interrupted run started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub run_id: String,
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub batch_size: usize,
    pub anonymize: bool,
    pub mark_encrypted: bool,
    pub source_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_detected: Option<Grammar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub step: MigrationStep,
    pub percent_complete: u8,
    pub progress: Progress,
    pub resume: ResumeState,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(step: MigrationStep, progress: Progress, resume: ResumeState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            step,
            percent_complete: progress.percent_complete(),
            progress,
            resume,
            written_at: Utc::now(),
        }
    }

    /// A checkpoint left behind by a run that did not reach `committed`.
    pub fn is_pending(&self) -> bool {
        self.step != MigrationStep::Committed
    }
}

/// One JSON file per completed batch under `checkpoints/`:
/// `batch-0000.json` marks the start of processing, `batch-NNNN.json` the
/// state after batch N.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn file_for(&self, batch: usize) -> PathBuf {
        self.dir.join(format!("batch-{batch:04}.json"))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.file_for(checkpoint.progress.completed_batches);
        write_json_atomic(&path, checkpoint)?;
        tracing::debug!(
            path = %path.display(),
            step = %checkpoint.step,
            percent = checkpoint.percent_complete,
            "checkpoint written"
        );
        Ok(path)
    }

    fn batch_files(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(number) = name
                .strip_prefix("batch-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|digits| digits.parse::<usize>().ok())
            else {
                continue;
            };
            files.push((number, path));
        }
        files.sort_by_key(|(n, _)| *n);
        Ok(files)
    }

    /// Checkpoint with the highest batch number, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some((_, path)) = self.batch_files()?.pop() else {
            return Ok(None);
        };
        read_json(&path).map(Some).map_err(|err| {
            MigrateError::MissingFile(format!(
                "checkpoint {} is unreadable ({err}); run `migrate execute --restart`",
                path.display()
            ))
        })
    }

    pub fn clear(&self) -> Result<usize> {
        let files = self.batch_files()?;
        for (_, path) in &files {
            fs::remove_file(path).map_err(|e| MigrateError::from_write(e, path))?;
        }
        if self.dir.is_dir() {
            let _ = fs::remove_dir(&self.dir);
        }
        Ok(files.len())
    }
}
