use serde_json::Value;

use crate::store::canonical::{read_consolidated, user_dirs};
use crate::store::files::read_json;
use crate::store::paths::ProjectPaths;
use crate::validate::{Category, CheckResult, Expected, Severity};

/// `100 − |original − migrated| / original × 100`, floored at zero. With no
/// original time, any migrated time is a total loss of accuracy.
pub fn accuracy(original: u64, migrated: u64) -> f64 {
    if original == 0 {
        return if migrated == 0 { 100.0 } else { 0.0 };
    }
    let diff = original.abs_diff(migrated) as f64;
    (100.0 - diff / original as f64 * 100.0).max(0.0)
}

fn session_minutes(session: &Value) -> u64 {
    session.get("minutes").and_then(Value::as_u64).unwrap_or(0)
}

/// Any total mismatch here is critical: billing must survive to the minute.
pub fn check(paths: &ProjectPaths, expected: &Expected<'_>, non_billable: &[String]) -> CheckResult {
    let mut check = CheckResult::new(Category::Billing);
    let original = expected.total_minutes();

    let dirs = match user_dirs(paths) {
        Ok(dirs) => dirs,
        Err(err) => {
            check.report(Severity::Critical, None, format!("cannot list user files: {err}"));
            Vec::new()
        }
    };

    let mut migrated = 0u64;
    for (dir, file) in &dirs {
        let subject = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let value: Value = match read_json(file) {
            Ok(v) => v,
            Err(err) => {
                check.report(Severity::Critical, subject, format!("unreadable user file: {err}"));
                continue;
            }
        };
        let sessions = value
            .get("sessions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let sum: u64 = sessions.iter().map(session_minutes).sum();
        migrated += sum;

        let stored = value.get("total_minutes").and_then(Value::as_u64);
        if stored != Some(sum) {
            check.report(
                Severity::Critical,
                subject.clone(),
                format!("session sum {sum} does not match stored total {stored:?}"),
            );
        }

        let billable: u64 = sessions
            .iter()
            .filter(|s| {
                let status = s.get("status").and_then(Value::as_str).unwrap_or_default();
                !non_billable.iter().any(|n| n.eq_ignore_ascii_case(status))
            })
            .map(session_minutes)
            .sum();
        let stored_billing = value.get("billing_minutes").and_then(Value::as_u64);
        if stored_billing != Some(billable) {
            check.report(
                Severity::Critical,
                subject,
                format!("billable sum {billable} does not match stored billing total {stored_billing:?}"),
            );
        }
    }

    if migrated != original {
        check.report(
            Severity::Critical,
            None,
            format!("per-user total {migrated} minutes differs from parsed total {original}"),
        );
    }

    match read_consolidated(paths) {
        Ok(Some(all)) => {
            let sum: u64 = all.sessions.iter().map(|s| s.minutes).sum();
            if sum != original || all.summary.total_minutes != original {
                check.report(
                    Severity::Critical,
                    Some("time-tracking.json".into()),
                    format!(
                        "consolidated total {} (summary {}) differs from parsed total {original}",
                        sum, all.summary.total_minutes
                    ),
                );
            }
        }
        Ok(None) => check.report(
            Severity::Critical,
            Some("time-tracking.json".into()),
            "consolidated file is missing",
        ),
        Err(err) => check.report(
            Severity::Critical,
            Some("time-tracking.json".into()),
            format!("consolidated file is unreadable: {err}"),
        ),
    }

    check.detail("original_minutes", original);
    check.detail("migrated_minutes", migrated);
    check.detail("accuracy", accuracy(original, migrated));
    check
}
