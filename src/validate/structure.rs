use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MigrateError, Result};
use crate::parse::ParsedSources;
use crate::parse::schedule::parse_timestamp;
use crate::validate::{Category, CheckResult, Discrepancy, Severity};

/// Pre-write checks over parsed records. Critical findings are corruption.
pub fn check(parsed: &ParsedSources) -> CheckResult {
    let mut check = CheckResult::new(Category::Structure);
    let schedule = &parsed.names.schedule;
    let task_list = &parsed.names.task_list;

    let mut milestone_lines: BTreeMap<&str, usize> = BTreeMap::new();
    for milestone in &parsed.milestones {
        if let Some(first) = milestone_lines.insert(&milestone.id, milestone.line) {
            check.push(Discrepancy {
                severity: Severity::Critical,
                message: format!(
                    "milestone id '{}' already defined on line {first}",
                    milestone.id
                ),
                subject: Some(schedule.clone()),
                line: Some(milestone.line),
            });
        }

        let (Some(start), Some(end)) = (&milestone.start, &milestone.end) else {
            continue;
        };
        if let (Some(s), Some(e)) = (parse_timestamp(start), parse_timestamp(end)) {
            if s >= e {
                check.push(Discrepancy {
                    severity: Severity::Critical,
                    message: format!(
                        "milestone '{}' starts ({start}) on or after it ends ({end})",
                        milestone.id
                    ),
                    subject: Some(schedule.clone()),
                    line: Some(milestone.line),
                });
            }
        }
    }

    for milestone in &parsed.milestones {
        for dep in &milestone.depends_on {
            if !milestone_lines.contains_key(dep.as_str()) {
                check.push(Discrepancy {
                    severity: Severity::Warning,
                    message: format!(
                        "milestone '{}' depends on unknown milestone '{dep}'",
                        milestone.id
                    ),
                    subject: Some(schedule.clone()),
                    line: Some(milestone.line),
                });
            }
        }
    }

    let mut task_lines: BTreeMap<u32, usize> = BTreeMap::new();
    for task in &parsed.tasks {
        if let Some(first) = task_lines.insert(task.id.as_u32(), task.line) {
            check.push(Discrepancy {
                severity: Severity::Critical,
                message: format!("task {} already defined on line {first}", task.id),
                subject: Some(task_list.clone()),
                line: Some(task.line),
            });
        }
    }

    if !parsed.tasks.is_empty() {
        let known: BTreeSet<u32> = task_lines.keys().copied().collect();
        for milestone in &parsed.milestones {
            for task in &milestone.tasks {
                if !known.contains(&task.as_u32()) {
                    check.push(Discrepancy {
                        severity: Severity::Warning,
                        message: format!(
                            "milestone '{}' lists task {task} absent from the task list",
                            milestone.id
                        ),
                        subject: Some(schedule.clone()),
                        line: Some(milestone.line),
                    });
                }
            }
        }
    }

    for warning in &parsed.warnings {
        check.push(Discrepancy {
            severity: Severity::Warning,
            message: warning.message.clone(),
            subject: Some(warning.source.clone()),
            line: Some(warning.line),
        });
    }

    check.detail("milestones", parsed.milestones.len());
    check.detail("tasks", parsed.tasks.len());
    check.detail("sessions", parsed.time_log.sessions.len());
    check
}

/// Run [`check`] and turn the first critical finding into a corruption error.
pub fn enforce(parsed: &ParsedSources) -> Result<CheckResult> {
    let check = check(parsed);
    if let Some(critical) = check
        .discrepancies
        .iter()
        .find(|d| d.severity == Severity::Critical)
    {
        return Err(MigrateError::corrupted(
            critical.subject.clone().unwrap_or_default(),
            critical.line,
            critical.message.clone(),
        ));
    }
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Milestone, MilestoneStatus, Task, TaskStatus};
    use crate::parse::{SourceNames, Warning};
    use crate::task_id::TaskId;

    fn names() -> SourceNames {
        SourceNames {
            time_log: "TIME.md".into(),
            task_list: "TASKS.md".into(),
            schedule: "SCHEDULE.md".into(),
        }
    }

    fn milestone(id: &str, start: Option<&str>, end: Option<&str>, line: usize) -> Milestone {
        Milestone {
            id: id.into(),
            title: id.into(),
            start: start.map(String::from),
            end: end.map(String::from),
            status: MilestoneStatus::Planned,
            depends_on: Vec::new(),
            tasks: Default::default(),
            line,
        }
    }

    fn task(id: u32, line: usize) -> Task {
        Task {
            id: TaskId::parse_ref(&id.to_string()).unwrap(),
            title: String::new(),
            status: TaskStatus::Pending,
            assignee: None,
            subtasks: Vec::new(),
            line,
        }
    }

    #[test]
    fn reversed_milestone_dates_are_corruption() {
        let parsed = ParsedSources {
            names: names(),
            milestones: vec![milestone("v1", Some("2024-02-01"), Some("2024-01-01"), 3)],
            ..ParsedSources::default()
        };
        let err = enforce(&parsed).unwrap_err();
        assert_eq!(err.code(), "corrupted_source");
        assert!(err.to_string().starts_with("corrupted source SCHEDULE.md (line 3)"));
    }

    #[test]
    fn equal_start_and_end_is_corruption() {
        let parsed = ParsedSources {
            names: names(),
            milestones: vec![milestone("v1", Some("2024-01-01 10:00"), Some("2024-01-01T10:00:00"), 1)],
            ..ParsedSources::default()
        };
        assert!(enforce(&parsed).is_err());
    }

    #[test]
    fn unparseable_dates_are_not_compared() {
        let parsed = ParsedSources {
            names: names(),
            milestones: vec![milestone("v1", Some("next week"), Some("2024-01-01"), 1)],
            ..ParsedSources::default()
        };
        assert!(enforce(&parsed).unwrap().passed);
    }

    #[test]
    fn duplicate_ids_are_corruption() {
        let parsed = ParsedSources {
            names: names(),
            tasks: vec![task(4, 1), task(4, 9)],
            ..ParsedSources::default()
        };
        let err = enforce(&parsed).unwrap_err();
        assert!(err.to_string().contains("TASKS.md (line 9)"));

        let parsed = ParsedSources {
            names: names(),
            milestones: vec![milestone("v1", None, None, 1), milestone("v1", None, None, 5)],
            ..ParsedSources::default()
        };
        assert!(enforce(&parsed).is_err());
    }

    #[test]
    fn dangling_references_and_parse_warnings_are_warnings() {
        let mut m = milestone("v1", None, None, 1);
        m.depends_on.push("v0".into());
        m.tasks.insert(TaskId::parse_ref("9").unwrap());
        let parsed = ParsedSources {
            names: names(),
            milestones: vec![m],
            tasks: vec![task(1, 1)],
            warnings: vec![Warning {
                source: "TIME.md".into(),
                line: 4,
                message: "unparseable hours 'x'".into(),
            }],
            ..ParsedSources::default()
        };
        let check = enforce(&parsed).unwrap();
        assert!(check.passed);
        assert_eq!(check.count(Severity::Warning), 3);
    }
}
