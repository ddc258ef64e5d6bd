//! Migration state machine.
//!
//! ```text
//! idle → locked → backing-up → parsing → validating-input
//!      → processing(batch 1..N) → validating-output → committed
//! ```
//! `rolled-back` is reachable from any state after `locked`; `dry-run` is a
//! side path that takes no lock and writes nothing.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::git::GitAuthorLookup;
use crate::model::Grammar;
use crate::parse::{ParsedSources, Warning, parse_sources};
use crate::provider::{AuthorLookup, NoLookup};
use crate::store::backup::BackupStore;
use crate::store::canonical::{CanonicalStore, MigrationMetadata, clear_staging, read_metadata};
use crate::store::checkpoint::{Checkpoint, CheckpointStore, MigrationStep, Progress, ResumeState};
use crate::store::lock::MigrationLock;
use crate::store::paths::ProjectPaths;
use crate::transform::Transforms;
use crate::validate::{Expected, ValidationReport, structure, validate_all};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Discard an unfinished checkpoint instead of refusing to start.
    pub restart: bool,
    /// Stop cleanly after this many batches, keeping the checkpoint.
    pub halt_after: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    Halted,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub status: RunStatus,
    pub run_id: String,
    pub backup_id: String,
    pub format_detected: Option<Grammar>,
    pub sessions_migrated: usize,
    pub total_minutes: u64,
    pub users: usize,
    pub tasks: usize,
    pub milestones: usize,
    pub batches_completed: usize,
    pub total_batches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from_batch: Option<usize>,
    pub output_dir: String,
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    pub transitions: Vec<MigrationStep>,
}

impl MigrationOutcome {
    /// Post-write validation failed. The output stays in place.
    pub fn validation_failed(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| !v.passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub format_detected: Option<Grammar>,
    pub sessions: usize,
    pub total_minutes: u64,
    pub users: Vec<String>,
    pub tasks: usize,
    pub milestones: usize,
    pub batch_size: usize,
    pub batches: usize,
    pub would_write: Vec<String>,
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint: Option<Progress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub backup_id: String,
    pub files_restored: usize,
    pub files_removed: usize,
    pub checksums_verified: usize,
    pub checkpoints_cleared: usize,
}

enum BatchRun {
    Finished(Progress),
    Halted(Progress),
}

pub struct Migrator {
    paths: ProjectPaths,
    config: MigrationConfig,
    lookup: Box<dyn AuthorLookup>,
    state: MigrationStep,
    transitions: Vec<MigrationStep>,
}

impl Migrator {
    /// Attribution comes from git history unless the config disables it.
    pub fn new(paths: ProjectPaths, config: MigrationConfig) -> Self {
        let lookup: Box<dyn AuthorLookup> = if config.blame {
            Box::new(GitAuthorLookup::new(paths.root(), config.blame_timeout()))
        } else {
            Box::new(NoLookup)
        };
        Self::with_lookup(paths, config, lookup)
    }

    pub fn with_lookup(
        paths: ProjectPaths,
        config: MigrationConfig,
        lookup: Box<dyn AuthorLookup>,
    ) -> Self {
        Self {
            paths,
            config,
            lookup,
            state: MigrationStep::Idle,
            transitions: vec![MigrationStep::Idle],
        }
    }

    pub fn state(&self) -> MigrationStep {
        self.state
    }

    pub fn transitions(&self) -> &[MigrationStep] {
        &self.transitions
    }

    fn enter(&mut self, step: MigrationStep) {
        tracing::debug!(from = %self.state, to = %step, "migration state");
        self.state = step;
        self.transitions.push(step);
    }

    fn lock(&mut self, command: &str) -> Result<MigrationLock> {
        let lock = MigrationLock::acquire(&self.paths.lock_file(), command)?;
        self.enter(MigrationStep::Locked);
        Ok(lock)
    }

    fn source_paths(&self) -> Vec<PathBuf> {
        let root = self.paths.root();
        [&self.config.time_log, &self.config.task_list, &self.config.schedule]
            .into_iter()
            .map(|p| self.config.source_path(root, p))
            .collect()
    }

    fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(&self.paths.checkpoints_dir())
    }

    fn parse(&mut self) -> Result<ParsedSources> {
        self.enter(MigrationStep::Parsing);
        let parsed = parse_sources(&self.paths, &self.config, self.lookup.as_ref())?;
        self.enter(MigrationStep::ValidatingInput);
        structure::enforce(&parsed)?;
        Ok(parsed)
    }

    /// Parse and report what `execute` would do. No lock, no writes.
    pub fn dry_run(&mut self) -> Result<DryRunReport> {
        self.enter(MigrationStep::DryRun);
        let parsed = parse_sources(&self.paths, &self.config, self.lookup.as_ref())?;
        structure::enforce(&parsed)?;

        let transforms = self.transforms();
        let sessions = transforms.apply_all(&parsed.time_log.sessions);
        let users: Vec<String> = sessions
            .iter()
            .map(|s| s.user.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut would_write = vec![self.paths.consolidated_file()];
        would_write.extend(users.iter().map(|u| self.paths.user_file(u)));
        would_write.extend([
            self.paths.tasks_file(),
            self.paths.milestones_file(),
            self.paths.metadata_file(),
        ]);
        let would_write = would_write
            .iter()
            .filter_map(|p| self.paths.relative(p))
            .collect();

        let pending_checkpoint = self
            .checkpoints()
            .latest()?
            .filter(Checkpoint::is_pending)
            .map(|c| c.progress);

        Ok(DryRunReport {
            format_detected: parsed.time_log.grammar,
            sessions: sessions.len(),
            total_minutes: parsed.time_log.totals.total_minutes,
            users,
            tasks: parsed.tasks.len(),
            milestones: parsed.milestones.len(),
            batch_size: self.config.batch_size,
            batches: sessions.len().div_ceil(self.config.batch_size),
            would_write,
            warnings: parsed.warnings,
            pending_checkpoint,
        })
    }

    fn transforms(&self) -> Transforms {
        Transforms {
            anonymize: self.config.anonymize,
            mark_encrypted: self.config.mark_encrypted,
        }
    }

    pub fn execute(&mut self, options: RunOptions) -> Result<MigrationOutcome> {
        let _lock = self.lock("migrate execute")?;
        self.execute_locked(options)
    }

    fn execute_locked(&mut self, options: RunOptions) -> Result<MigrationOutcome> {
        let checkpoints = self.checkpoints();
        if let Some(existing) = checkpoints.latest()? {
            if existing.is_pending() && !options.restart {
                return Err(MigrateError::PendingCheckpoint {
                    completed: existing.progress.completed_batches,
                    total: existing.progress.total_batches,
                });
            }
            let cleared = checkpoints.clear()?;
            tracing::warn!(cleared, "discarded previous checkpoints");
        }

        self.enter(MigrationStep::BackingUp);
        let backup = BackupStore::new(&self.paths).snapshot(&self.source_paths())?;

        let parsed = self.parse()?;
        let resume = ResumeState {
            run_id: Uuid::new_v4().to_string(),
            backup_id: backup.backup_id,
            started_at: Utc::now(),
            batch_size: self.config.batch_size,
            anonymize: self.config.anonymize,
            mark_encrypted: self.config.mark_encrypted,
            source_digest: parsed.source_digest.clone(),
            format_detected: parsed.time_log.grammar,
        };
        self.process(&parsed, resume, 0, options.halt_after)
    }

    /// Continue from the latest unfinished checkpoint, or start fresh when
    /// there is none.
    pub fn resume(&mut self, halt_after: Option<usize>) -> Result<MigrationOutcome> {
        let _lock = self.lock("migrate resume")?;
        let Some(checkpoint) = self.checkpoints().latest()?.filter(Checkpoint::is_pending) else {
            tracing::info!("no unfinished checkpoint; starting a fresh migration");
            return self.execute_locked(RunOptions {
                restart: true,
                halt_after,
            });
        };

        let resume = &checkpoint.resume;
        if (self.config.batch_size, self.config.anonymize, self.config.mark_encrypted)
            != (resume.batch_size, resume.anonymize, resume.mark_encrypted)
        {
            tracing::warn!(
                batch_size = resume.batch_size,
                anonymize = resume.anonymize,
                mark_encrypted = resume.mark_encrypted,
                "settings differ from the interrupted run; continuing with the checkpoint's"
            );
        }

        let parsed = self.parse()?;
        if parsed.source_digest != checkpoint.resume.source_digest {
            return Err(MigrateError::CheckpointMismatch);
        }
        BackupStore::new(&self.paths).load(&checkpoint.resume.backup_id)?;

        let start = checkpoint.progress.completed_batches;
        tracing::info!(
            run_id = %checkpoint.resume.run_id,
            batch = start,
            total = checkpoint.progress.total_batches,
            "resuming migration"
        );
        self.process(&parsed, checkpoint.resume, start, halt_after)
    }

    /// Write batches from `start`, then finalize and validate. An error while
    /// writing restores the snapshot before it is returned.
    fn process(
        &mut self,
        parsed: &ParsedSources,
        resume: ResumeState,
        start: usize,
        halt_after: Option<usize>,
    ) -> Result<MigrationOutcome> {
        self.enter(MigrationStep::Processing);
        let transforms = Transforms {
            anonymize: resume.anonymize,
            mark_encrypted: resume.mark_encrypted,
        };
        let store = CanonicalStore::new(&self.paths, &self.config.non_billable_statuses)
            .with_encryption(transforms.encryption());
        let checkpoints = self.checkpoints();

        let written = self
            .write_batches(parsed, &resume, start, halt_after, transforms, &store, &checkpoints)
            .and_then(|run| match run {
                BatchRun::Finished(progress) => {
                    self.finalize(parsed, &resume, &store)?;
                    Ok(BatchRun::Finished(progress))
                }
                halted => Ok(halted),
            });

        let progress = match written {
            Ok(BatchRun::Finished(progress)) => progress,
            Ok(BatchRun::Halted(progress)) => {
                tracing::warn!(
                    completed = progress.completed_batches,
                    total = progress.total_batches,
                    "halted; run `migrate resume` to continue"
                );
                return Ok(self.outcome(RunStatus::Halted, parsed, &resume, &progress, start, None));
            }
            Err(err) => return Err(self.roll_back_after(err, &resume.backup_id, &checkpoints)),
        };

        self.enter(MigrationStep::ValidatingOutput);
        let expected_sessions = transforms.apply_all(&parsed.time_log.sessions);
        let expected = Expected {
            sessions: &expected_sessions,
            milestones: &parsed.milestones,
        };
        let report = validate_all(&self.paths, parsed, &expected, &self.config.non_billable_statuses);

        if self.config.keep_checkpoints {
            checkpoints.save(&Checkpoint::new(
                MigrationStep::Committed,
                progress.clone(),
                resume.clone(),
            ))?;
        } else {
            checkpoints.clear()?;
        }
        clear_staging(&self.paths)?;
        self.enter(MigrationStep::Committed);

        tracing::info!(
            sessions = progress.sessions_processed,
            minutes = progress.minutes_processed,
            backup_id = %resume.backup_id,
            "migration committed"
        );
        Ok(self.outcome(RunStatus::Committed, parsed, &resume, &progress, start, Some(report)))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_batches(
        &self,
        parsed: &ParsedSources,
        resume: &ResumeState,
        start: usize,
        halt_after: Option<usize>,
        transforms: Transforms,
        store: &CanonicalStore,
        checkpoints: &CheckpointStore,
    ) -> Result<BatchRun> {
        let sessions = &parsed.time_log.sessions;
        let batch_size = resume.batch_size.max(1);
        let done = (start * batch_size).min(sessions.len());
        let mut progress = Progress {
            completed_batches: start,
            total_batches: sessions.len().div_ceil(batch_size),
            sessions_processed: done,
            total_sessions: sessions.len(),
            minutes_processed: sessions[..done].iter().map(|s| s.minutes).sum(),
        };

        if start == 0 {
            store.reset_session_outputs()?;
            checkpoints.save(&Checkpoint::new(
                MigrationStep::Processing,
                progress.clone(),
                resume.clone(),
            ))?;
        }

        let mut ran = 0;
        for (index, chunk) in sessions.chunks(batch_size).enumerate().skip(start) {
            if halt_after.is_some_and(|limit| ran >= limit) {
                return Ok(BatchRun::Halted(progress));
            }
            let batch = transforms.apply_all(chunk);
            let write = store.stage_batch(index, &batch)?;

            progress.completed_batches = index + 1;
            progress.sessions_processed += write.sessions_written;
            progress.minutes_processed += write.minutes_written;
            checkpoints.save(&Checkpoint::new(
                MigrationStep::Processing,
                progress.clone(),
                resume.clone(),
            ))?;
            ran += 1;

            tracing::info!(
                batch = index + 1,
                total = progress.total_batches,
                percent = progress.percent_complete(),
                users = write.users_touched.len(),
                "batch staged"
            );
        }
        Ok(BatchRun::Finished(progress))
    }

    fn finalize(
        &self,
        parsed: &ParsedSources,
        resume: &ResumeState,
        store: &CanonicalStore,
    ) -> Result<()> {
        let committed = store.commit_staged()?;
        tracing::info!(
            sessions = committed.sessions_written,
            users = committed.users_touched.len(),
            "staged batches committed"
        );
        store.write_tasks(&parsed.tasks)?;
        store.write_milestones(&parsed.milestones)?;
        store.write_metadata(&MigrationMetadata {
            schema_version: crate::model::SCHEMA_VERSION,
            format_detected: resume.format_detected,
            migrated_at: resume.started_at,
            run_id: resume.run_id.clone(),
            backup_id: resume.backup_id.clone(),
            anonymized: resume.anonymize,
            encryption: resume
                .mark_encrypted
                .then(crate::store::canonical::EncryptionMarker::sensitive_fields),
            session_count: parsed.time_log.sessions.len(),
            total_minutes: parsed.time_log.totals.total_minutes,
            source_digest: resume.source_digest.clone(),
        })
    }

    fn roll_back_after(
        &mut self,
        cause: MigrateError,
        backup_id: &str,
        checkpoints: &CheckpointStore,
    ) -> MigrateError {
        tracing::error!(error = %cause, backup_id, "migration failed mid-process; rolling back");
        let backups = BackupStore::new(&self.paths);
        let restored = backups
            .load(backup_id)
            .and_then(|manifest| backups.restore(&manifest));
        match restored {
            Ok(_) => {
                if let Err(err) = checkpoints.clear() {
                    tracing::warn!(error = %err, "failed to clear checkpoints after rollback");
                }
                if let Err(err) = clear_staging(&self.paths) {
                    tracing::warn!(error = %err, "failed to clear staged batches after rollback");
                }
                self.enter(MigrationStep::RolledBack);
                MigrateError::RolledBack {
                    backup_id: backup_id.to_string(),
                    cause: cause.to_string(),
                }
            }
            Err(restore_err) => MigrateError::BackupDamaged {
                backup_id: backup_id.to_string(),
                reason: format!("automatic rollback after '{cause}' failed: {restore_err}"),
            },
        }
    }

    fn outcome(
        &self,
        status: RunStatus,
        parsed: &ParsedSources,
        resume: &ResumeState,
        progress: &Progress,
        start: usize,
        validation: Option<ValidationReport>,
    ) -> MigrationOutcome {
        MigrationOutcome {
            status,
            run_id: resume.run_id.clone(),
            backup_id: resume.backup_id.clone(),
            format_detected: parsed.time_log.grammar,
            sessions_migrated: progress.sessions_processed,
            total_minutes: progress.minutes_processed,
            users: parsed.time_log.totals.users.len(),
            tasks: parsed.tasks.len(),
            milestones: parsed.milestones.len(),
            batches_completed: progress.completed_batches,
            total_batches: progress.total_batches,
            resumed_from_batch: (start > 0).then_some(start),
            output_dir: self.paths.flowforge_dir().display().to_string(),
            warnings: parsed.warnings.clone(),
            validation,
            transitions: self.transitions.clone(),
        }
    }

    /// Check existing output against the current sources. Read-only.
    pub fn validate(&mut self) -> Result<ValidationReport> {
        let parsed = parse_sources(&self.paths, &self.config, self.lookup.as_ref())?;
        structure::enforce(&parsed)?;

        let anonymized = read_metadata(&self.paths)?
            .map(|m| m.anonymized)
            .unwrap_or(self.config.anonymize);
        let transforms = Transforms {
            anonymize: anonymized,
            mark_encrypted: false,
        };
        let sessions = transforms.apply_all(&parsed.time_log.sessions);
        let expected = Expected {
            sessions: &sessions,
            milestones: &parsed.milestones,
        };
        Ok(validate_all(&self.paths, &parsed, &expected, &self.config.non_billable_statuses))
    }

    /// Restore a snapshot (default: most recent) and discard checkpoints.
    pub fn rollback(&mut self, backup_id: Option<&str>) -> Result<RollbackOutcome> {
        let _lock = self.lock("migrate rollback")?;
        let backups = BackupStore::new(&self.paths);
        let manifest = match backup_id {
            Some(id) => backups.load(id)?,
            None => backups.latest()?,
        };
        let report = backups.restore(&manifest)?;
        let checkpoints_cleared = self.checkpoints().clear()?;
        clear_staging(&self.paths)?;
        self.enter(MigrationStep::RolledBack);

        Ok(RollbackOutcome {
            backup_id: report.backup_id,
            files_restored: report.files_restored,
            files_removed: report.files_removed,
            checksums_verified: report.checksums_verified,
            checkpoints_cleared,
        })
    }
}
