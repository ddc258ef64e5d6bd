use std::path::Path;

use crate::config::{MigrationConfig, Overrides};
use crate::error::{MigrateError, Result};
use crate::orchestrator::{MigrationOutcome, Migrator, RunOptions};
use crate::output::{self, Format};
use crate::provider::NoLookup;
use crate::store::paths::ProjectPaths;

fn migrator(root: &Path, overrides: &Overrides) -> Result<Migrator> {
    let paths = ProjectPaths::new(root);
    let config = MigrationConfig::load(&paths)?.with_overrides(overrides)?;
    Ok(Migrator::new(paths, config))
}

fn finish(outcome: &MigrationOutcome, format: Format) -> Result<()> {
    output::print_outcome(outcome, format)?;
    match &outcome.validation {
        Some(report) if !report.passed => Err(MigrateError::ValidationFailed {
            failed: report.failed_checks(),
            total: report.checks_run,
        }),
        _ => Ok(()),
    }
}

pub fn dry_run(root: &Path, overrides: &Overrides, format: Format) -> Result<()> {
    let report = migrator(root, overrides)?.dry_run()?;
    output::print_dry_run(&report, format)
}

pub fn execute(
    root: &Path,
    overrides: &Overrides,
    restart: bool,
    halt_after: Option<usize>,
    format: Format,
) -> Result<()> {
    let outcome = migrator(root, overrides)?.execute(RunOptions {
        restart,
        halt_after,
    })?;
    finish(&outcome, format)
}

pub fn resume(
    root: &Path,
    overrides: &Overrides,
    halt_after: Option<usize>,
    format: Format,
) -> Result<()> {
    let outcome = migrator(root, overrides)?.resume(halt_after)?;
    finish(&outcome, format)
}

pub fn validate(root: &Path, overrides: &Overrides, format: Format) -> Result<()> {
    let report = migrator(root, overrides)?.validate()?;
    output::print_validation(&report, format)?;
    if !report.passed {
        return Err(MigrateError::ValidationFailed {
            failed: report.failed_checks(),
            total: report.checks_run,
        });
    }
    Ok(())
}

/// Ignores `migration.yaml`: every path rollback touches is fixed.
pub fn rollback(root: &Path, backup_id: Option<&str>, format: Format) -> Result<()> {
    let mut migrator = Migrator::with_lookup(
        ProjectPaths::new(root),
        MigrationConfig::default(),
        Box::new(NoLookup),
    );
    let outcome = migrator.rollback(backup_id)?;
    output::print_rollback(&outcome, format)
}
