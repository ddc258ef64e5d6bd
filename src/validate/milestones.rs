use std::collections::BTreeMap;

use crate::store::canonical::MilestoneCollection;
use crate::store::files::read_json_opt;
use crate::store::paths::ProjectPaths;
use crate::validate::{Category, CheckResult, Expected, Severity};

pub fn check(paths: &ProjectPaths, expected: &Expected<'_>) -> CheckResult {
    let mut check = CheckResult::new(Category::Milestones);

    let stored = match read_json_opt::<MilestoneCollection>(&paths.milestones_file()) {
        Ok(Some(collection)) => collection.milestones,
        Ok(None) if expected.milestones.is_empty() => Vec::new(),
        Ok(None) => {
            check.report(Severity::Error, None, "milestones file is missing");
            Vec::new()
        }
        Err(err) => {
            check.report(Severity::Error, None, format!("milestones file is unreadable: {err}"));
            Vec::new()
        }
    };

    if stored.len() != expected.milestones.len() {
        check.report(
            Severity::Error,
            None,
            format!(
                "milestone count {} differs from parsed count {}",
                stored.len(),
                expected.milestones.len()
            ),
        );
    }

    let by_id: BTreeMap<&str, _> = stored.iter().map(|m| (m.id.as_str(), m)).collect();
    for milestone in expected.milestones {
        let subject = Some(milestone.id.clone());
        let Some(found) = by_id.get(milestone.id.as_str()) else {
            check.report(Severity::Error, subject, "milestone is missing");
            continue;
        };
        if found.tasks != milestone.tasks {
            let missing: Vec<String> = milestone
                .tasks
                .difference(&found.tasks)
                .map(ToString::to_string)
                .collect();
            let extra: Vec<String> = found
                .tasks
                .difference(&milestone.tasks)
                .map(ToString::to_string)
                .collect();
            check.report(
                Severity::Error,
                subject,
                format!(
                    "task set differs (missing: [{}], extra: [{}])",
                    missing.join(", "),
                    extra.join(", ")
                ),
            );
        }
    }

    check.detail("expected", expected.milestones.len());
    check.detail("found", stored.len());
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Milestone, MilestoneStatus};
    use crate::store::canonical::CanonicalStore;
    use crate::task_id::TaskId;
    use tempfile::tempdir;

    fn milestone(id: &str, tasks: &[u32]) -> Milestone {
        Milestone {
            id: id.into(),
            title: id.into(),
            start: None,
            end: None,
            status: MilestoneStatus::Planned,
            depends_on: Vec::new(),
            tasks: tasks
                .iter()
                .map(|t| TaskId::parse_ref(&t.to_string()).unwrap())
                .collect(),
            line: 1,
        }
    }

    #[test]
    fn equal_task_sets_pass_regardless_of_order() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let written = vec![milestone("v1", &[3, 1, 2])];
        CanonicalStore::new(&paths, &[]).write_milestones(&written).unwrap();

        let expected = vec![milestone("v1", &[1, 2, 3])];
        let check = check(&paths, &Expected { sessions: &[], milestones: &expected });
        assert!(check.passed, "{:?}", check.discrepancies);
    }

    #[test]
    fn differing_sets_and_counts_fail() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        CanonicalStore::new(&paths, &[])
            .write_milestones(&[milestone("v1", &[1, 4])])
            .unwrap();

        let expected = vec![milestone("v1", &[1, 2]), milestone("v2", &[])];
        let check = check(&paths, &Expected { sessions: &[], milestones: &expected });
        assert_eq!(check.count(Severity::Error), 3);
        assert!(check.discrepancies.iter().any(|d| d.message.contains("missing: [#2]")));
    }

    #[test]
    fn absent_file_is_fine_without_milestones() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let check = check(&paths, &Expected { sessions: &[], milestones: &[] });
        assert!(check.passed);
    }
}
