use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::store::files::read_json_opt;
use crate::store::paths::ProjectPaths;
use crate::task_id::TaskId;
use crate::validate::{Category, CheckResult, Discrepancy, Expected, Severity};

/// Listing every missing id in a large run is noise; report the first few.
const MAX_LISTED: usize = 10;

/// Problems with a single stored session object.
fn structural_problems(session: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let Some(obj) = session.as_object() else {
        return vec!["session is not an object".into()];
    };
    for field in ["id", "user", "status", "provenance"] {
        match obj.get(field).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => {}
            _ => problems.push(format!("missing field '{field}'")),
        }
    }
    match obj.get("minutes") {
        Some(v) if v.as_u64().is_some() => {}
        Some(v) if v.as_i64().is_some_and(|m| m < 0) => problems.push("negative duration".into()),
        Some(_) => problems.push("non-integer duration".into()),
        None => problems.push("missing field 'minutes'".into()),
    }
    match obj.get("task_id").and_then(Value::as_u64) {
        Some(n) if TaskId::try_from(n).is_ok() => {}
        Some(n) => problems.push(format!("task reference {n} out of range")),
        None => problems.push("non-numeric task reference".into()),
    }
    problems
}

fn list(ids: &[&str]) -> String {
    let shown: Vec<&str> = ids.iter().take(MAX_LISTED).copied().collect();
    let more = ids.len().saturating_sub(MAX_LISTED);
    if more > 0 {
        format!("{} (+{more} more)", shown.join(", "))
    } else {
        shown.join(", ")
    }
}

pub fn check(paths: &ProjectPaths, expected: &Expected<'_>) -> CheckResult {
    let mut check = CheckResult::new(Category::Sessions);

    let stored: Vec<Value> = match read_json_opt::<Value>(&paths.consolidated_file()) {
        Ok(Some(value)) => value
            .get("sessions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Ok(None) => Vec::new(),
        Err(err) => {
            check.report(Severity::Error, None, format!("consolidated file is unreadable: {err}"));
            Vec::new()
        }
    };

    if stored.len() != expected.sessions.len() {
        check.report(
            Severity::Error,
            None,
            format!(
                "session count {} differs from parsed count {}",
                stored.len(),
                expected.sessions.len()
            ),
        );
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, session) in stored.iter().enumerate() {
        let id = session.get("id").and_then(Value::as_str);
        for problem in structural_problems(session) {
            check.push(Discrepancy {
                severity: Severity::Error,
                message: problem,
                subject: Some(id.map(String::from).unwrap_or_else(|| format!("#{index}"))),
                line: session.get("line").and_then(Value::as_u64).map(|l| l as usize),
            });
        }
        if let Some(id) = id {
            *seen.entry(id).or_default() += 1;
        }
    }

    let duplicates: Vec<&str> = seen.iter().filter(|(_, n)| **n > 1).map(|(id, _)| *id).collect();
    if !duplicates.is_empty() {
        check.report(Severity::Error, None, format!("duplicate session ids: {}", list(&duplicates)));
    }

    let expected_ids: BTreeSet<&str> = expected.sessions.iter().map(|s| s.id.as_str()).collect();
    let missing: Vec<&str> = expected_ids
        .iter()
        .filter(|id| !seen.contains_key(*id))
        .copied()
        .collect();
    if !missing.is_empty() {
        check.report(Severity::Error, None, format!("missing sessions: {}", list(&missing)));
    }
    let unexpected: Vec<&str> = seen
        .keys()
        .filter(|id| !expected_ids.contains(*id))
        .copied()
        .collect();
    if !unexpected.is_empty() {
        check.report(Severity::Error, None, format!("unexpected sessions: {}", list(&unexpected)));
    }

    check.detail("expected", expected.sessions.len());
    check.detail("found", stored.len());
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Grammar, TimeSession};
    use crate::store::canonical::CanonicalStore;
    use crate::store::files::write_json_atomic;
    use serde_json::json;
    use tempfile::tempdir;

    fn session(id: &str, minutes: u64) -> TimeSession {
        TimeSession {
            id: id.into(),
            task_id: TaskId::parse_ref("42").unwrap(),
            user: "alice".into(),
            minutes,
            description: String::new(),
            date: None,
            start: None,
            end: None,
            status: "completed".into(),
            provenance: Grammar::Structured,
            line: 1,
        }
    }

    #[test]
    fn matching_sessions_pass() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let sessions = vec![session("a", 10), session("b", 20)];
        CanonicalStore::new(&paths, &[]).write_sessions(&sessions).unwrap();

        let check = check(&paths, &Expected { sessions: &sessions, milestones: &[] });
        assert!(check.passed, "{:?}", check.discrepancies);
    }

    #[test]
    fn missing_and_malformed_sessions_are_reported() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        write_json_atomic(
            &paths.consolidated_file(),
            &json!({
                "schema_version": 2,
                "sessions": [
                    {"id": "a", "task_id": 42, "user": "alice", "minutes": -5,
                     "status": "completed", "provenance": "tabular", "line": 1},
                    {"id": "a", "task_id": "x", "user": "alice", "minutes": 5,
                     "status": "completed", "provenance": "tabular", "line": 2}
                ],
                "summary": {}
            }),
        )
        .unwrap();

        let expected = vec![session("a", 10), session("b", 20)];
        let check = check(&paths, &Expected { sessions: &expected, milestones: &[] });
        assert!(!check.passed);
        let messages: Vec<_> = check.discrepancies.iter().map(|d| d.message.as_str()).collect();
        assert!(messages.contains(&"negative duration"));
        assert!(messages.contains(&"non-numeric task reference"));
        assert!(messages.iter().any(|m| m.starts_with("duplicate session ids: a")));
        assert!(messages.iter().any(|m| m.starts_with("missing sessions: b")));
    }

    #[test]
    fn long_lists_are_truncated() {
        let ids: Vec<String> = (0..15).map(|i| format!("s{i:02}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        assert!(list(&refs).ends_with("(+5 more)"));
    }
}
