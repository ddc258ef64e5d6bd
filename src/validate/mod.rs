//! Read-only integrity checks over migrated output.
//!
//! Each category produces one [`CheckResult`]; [`validate_all`] folds them
//! into a [`ValidationReport`]. Nothing here writes to disk.

pub mod billing;
pub mod isolation;
pub mod milestones;
pub mod sessions;
pub mod structure;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{Milestone, TimeSession};
use crate::parse::ParsedSources;
use crate::store::paths::ProjectPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Structure,
    Billing,
    Sessions,
    Isolation,
    Milestones,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Structure => "structure",
            Self::Billing => "billing",
            Self::Sessions => "sessions",
            Self::Isolation => "isolation",
            Self::Milestones => "milestones",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub category: Category,
    pub passed: bool,
    pub discrepancies: Vec<Discrepancy>,
    /// Category-specific figures (totals, counts, accuracy).
    pub details: Map<String, Value>,
}

impl CheckResult {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            passed: true,
            discrepancies: Vec::new(),
            details: Map::new(),
        }
    }

    pub fn report(&mut self, severity: Severity, subject: Option<String>, message: impl Into<String>) {
        self.push(Discrepancy {
            severity,
            message: message.into(),
            subject,
            line: None,
        });
    }

    pub fn push(&mut self, discrepancy: Discrepancy) {
        if discrepancy.severity >= Severity::Error {
            self.passed = false;
        }
        self.discrepancies.push(discrepancy);
    }

    pub fn detail(&mut self, key: &str, value: impl Into<Value>) {
        self.details.insert(key.to_string(), value.into());
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub passed: bool,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub errors: usize,
    pub warnings: usize,
    pub billing_accuracy: f64,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let errors = checks
            .iter()
            .map(|c| c.count(Severity::Critical) + c.count(Severity::Error))
            .sum();
        let warnings = checks.iter().map(|c| c.count(Severity::Warning)).sum();
        let billing_accuracy = checks
            .iter()
            .find(|c| c.category == Category::Billing)
            .and_then(|c| c.details.get("accuracy"))
            .and_then(Value::as_f64)
            .unwrap_or(100.0);
        Self {
            timestamp: Utc::now(),
            passed: checks.iter().all(|c| c.passed),
            checks_run: checks.len(),
            checks_passed: checks.iter().filter(|c| c.passed).count(),
            errors,
            warnings,
            billing_accuracy,
            checks,
        }
    }

    pub fn failed_checks(&self) -> usize {
        self.checks_run - self.checks_passed
    }

    pub fn has_critical(&self) -> bool {
        self.checks.iter().any(|c| c.count(Severity::Critical) > 0)
    }
}

/// What the output should contain, as derived from the parsed sources after
/// any transforms were applied.
pub struct Expected<'a> {
    pub sessions: &'a [TimeSession],
    pub milestones: &'a [Milestone],
}

impl Expected<'_> {
    pub fn total_minutes(&self) -> u64 {
        self.sessions.iter().map(|s| s.minutes).sum()
    }

    pub fn users(&self) -> std::collections::BTreeSet<&str> {
        self.sessions.iter().map(|s| s.user.as_str()).collect()
    }
}

/// Run every category against the output under `paths`.
pub fn validate_all(
    paths: &ProjectPaths,
    parsed: &ParsedSources,
    expected: &Expected<'_>,
    non_billable: &[String],
) -> ValidationReport {
    let checks = vec![
        structure::check(parsed),
        billing::check(paths, expected, non_billable),
        sessions::check(paths, expected),
        isolation::check(paths, expected),
        milestones::check(paths, expected),
    ];
    let report = ValidationReport::from_checks(checks);
    if report.passed {
        tracing::info!(checks = report.checks_run, warnings = report.warnings, "validation passed");
    } else {
        tracing::error!(
            failed = report.failed_checks(),
            errors = report.errors,
            accuracy = report.billing_accuracy,
            "validation failed"
        );
    }
    report
}
