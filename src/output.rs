use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::orchestrator::{DryRunReport, MigrationOutcome, RollbackOutcome, RunStatus};
use crate::parse::Warning;
use crate::store::lock::LockStatus;
use crate::validate::{CheckResult, Discrepancy, Severity, ValidationReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn severity_prefix(severity: Severity) -> String {
    match severity {
        Severity::Warning => "warn".yellow().to_string(),
        Severity::Error => " ERR".red().bold().to_string(),
        Severity::Critical => "CRIT".red().bold().reversed().to_string(),
    }
}

fn locate(subject: Option<&str>, line: Option<usize>) -> String {
    match (subject, line) {
        (Some(s), Some(l)) => format!("{s}:{l}: "),
        (Some(s), None) => format!("{s}: "),
        (None, Some(l)) => format!("line {l}: "),
        (None, None) => String::new(),
    }
}

fn print_discrepancy(d: &Discrepancy) {
    println!(
        "  {}  {}{}",
        severity_prefix(d.severity),
        locate(d.subject.as_deref(), d.line),
        d.message
    );
}

fn print_warnings(warnings: &[Warning]) {
    if warnings.is_empty() {
        return;
    }
    println!();
    println!("{}", "warnings".bold());
    for w in warnings {
        println!(
            "  {}  {}{}",
            severity_prefix(Severity::Warning),
            locate(Some(&w.source), Some(w.line)),
            w.message
        );
    }
}

fn print_check(check: &CheckResult) {
    println!("{}", check.category.to_string().bold());
    if check.discrepancies.is_empty() {
        let summary: Vec<String> = check
            .details
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("  {}  {}", " ok ".green(), summary.join(" "));
        return;
    }
    for d in &check.discrepancies {
        print_discrepancy(d);
    }
}

pub fn print_validation(report: &ValidationReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report)?,
        Format::Pretty => {
            for (i, check) in report.checks.iter().enumerate() {
                if i > 0 {
                    println!();
                }
                print_check(check);
            }
            println!();
            let verdict = if report.passed {
                "PASSED".green().bold()
            } else {
                "FAILED".red().bold()
            };
            println!(
                "{verdict}: {}/{} checks passed, {} errors, {} warnings, billing accuracy {:.2}%",
                report.checks_passed,
                report.checks_run,
                if report.errors > 0 {
                    report.errors.to_string().red().bold().to_string()
                } else {
                    report.errors.to_string()
                },
                report.warnings.to_string().yellow(),
                report.billing_accuracy,
            );
        }
    }
    Ok(())
}

pub fn print_dry_run(report: &DryRunReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report)?,
        Format::Pretty => {
            println!("{}", "dry run (nothing written)".bold());
            println!(
                "  format:     {}",
                report
                    .format_detected
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "none".into())
            );
            println!("  sessions:   {}", report.sessions);
            println!("  minutes:    {}", report.total_minutes);
            println!("  users:      {}", report.users.join(", "));
            println!("  tasks:      {}", report.tasks);
            println!("  milestones: {}", report.milestones);
            println!("  batches:    {} x {}", report.batches, report.batch_size);
            if let Some(progress) = &report.pending_checkpoint {
                println!(
                    "  {}  unfinished run at batch {}/{}",
                    severity_prefix(Severity::Warning),
                    progress.completed_batches,
                    progress.total_batches
                );
            }
            println!();
            println!("{}", "would write".bold());
            for path in &report.would_write {
                println!("  {path}");
            }
            print_warnings(&report.warnings);
        }
    }
    Ok(())
}

pub fn print_outcome(outcome: &MigrationOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(outcome)?,
        Format::Pretty => {
            let status = match outcome.status {
                RunStatus::Committed => "committed".green().bold(),
                RunStatus::Halted => "halted".yellow().bold(),
            };
            println!("migration {status} (run {})", outcome.run_id);
            if let Some(batch) = outcome.resumed_from_batch {
                println!("  resumed from batch {batch}");
            }
            println!(
                "  batches:  {}/{}",
                outcome.batches_completed, outcome.total_batches
            );
            println!(
                "  sessions: {} ({} minutes, {} users)",
                outcome.sessions_migrated, outcome.total_minutes, outcome.users
            );
            println!(
                "  tasks:    {}, milestones: {}",
                outcome.tasks, outcome.milestones
            );
            println!("  backup:   {}", outcome.backup_id);
            println!("  output:   {}", outcome.output_dir);
            print_warnings(&outcome.warnings);
            if let Some(report) = &outcome.validation {
                println!();
                print_validation(report, Format::Pretty)?;
            }
        }
    }
    Ok(())
}

pub fn print_rollback(outcome: &RollbackOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(outcome)?,
        Format::Pretty => {
            println!("restored backup {}", outcome.backup_id.bold());
            println!(
                "  {} files restored, {} removed, {} checksums verified",
                outcome.files_restored, outcome.files_removed, outcome.checksums_verified
            );
            if outcome.checkpoints_cleared > 0 {
                println!("  {} checkpoints cleared", outcome.checkpoints_cleared);
            }
        }
    }
    Ok(())
}

pub fn print_lock_removed(status: &LockStatus, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(status)?,
        Format::Pretty => {
            let owner = status
                .owner
                .as_ref()
                .map(|o| o.to_string())
                .unwrap_or_else(|| "unknown owner".into());
            println!("removed lock {} ({owner})", status.path);
            if status.held {
                println!(
                    "  {}  the owning process was still running",
                    severity_prefix(Severity::Warning)
                );
            }
        }
    }
    Ok(())
}
