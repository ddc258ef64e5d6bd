use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::model::{Subtask, Task, TaskStatus};
use crate::parse::SourceDoc;

/// `## Task 42: Title` (colon required) or `## #42 Title`.
fn heading_regex() -> &'static Regex {
    static HEADING_RE: OnceLock<Regex> = OnceLock::new();
    HEADING_RE.get_or_init(|| {
        Regex::new(r"^#{2,}\s+(?:(?i:task)\s+#?([^\s:]+)\s*:\s*(.*)|#([^\s:]+):?\s*(.*))$").unwrap()
    })
}

/// `Status: ...`, `Assignee: ...` or `Owner: ...`, optionally bulleted or bold.
fn property_regex() -> &'static Regex {
    static PROPERTY_RE: OnceLock<Regex> = OnceLock::new();
    PROPERTY_RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*]\s+)?\**(?i:(status|assignee|owner))\**\s*:\s*\**(.*?)\**\s*$").unwrap()
    })
}

fn subtask_regex() -> &'static Regex {
    static SUBTASK_RE: OnceLock<Regex> = OnceLock::new();
    SUBTASK_RE.get_or_init(|| Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s*(.*)$").unwrap())
}

pub fn parse(doc: &SourceDoc<'_>) -> Result<Vec<Task>> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut in_task = false;

    for (line_no, line) in doc.lines() {
        if let Some(caps) = heading_regex().captures(line) {
            let (raw_id, title) = match (caps.get(1), caps.get(3)) {
                (Some(id), _) => (id.as_str(), caps.get(2)),
                (None, Some(id)) => (id.as_str(), caps.get(4)),
                (None, None) => continue,
            };
            let id = doc.task_ref(line_no, raw_id)?;
            tasks.push(Task {
                id,
                title: title.map(|t| t.as_str().trim().to_string()).unwrap_or_default(),
                status: TaskStatus::default(),
                assignee: None,
                subtasks: Vec::new(),
                line: line_no,
            });
            in_task = true;
            continue;
        }
        if line.starts_with('#') {
            // Any other heading closes the current task.
            in_task = false;
            continue;
        }
        let Some(task) = tasks.last_mut().filter(|_| in_task) else {
            continue;
        };
        if let Some(caps) = property_regex().captures(line) {
            let value = caps[2].trim();
            if caps[1].eq_ignore_ascii_case("status") {
                task.status = TaskStatus::parse_token(value).ok_or_else(|| {
                    doc.corrupted(line_no, format!("disallowed status token '{value}'"))
                })?;
            } else {
                let name = value.trim_start_matches('@').trim();
                task.assignee = (!name.is_empty()).then(|| name.to_string());
            }
        } else if let Some(caps) = subtask_regex().captures(line) {
            task.subtasks.push(Subtask {
                description: caps[2].trim().to_string(),
                done: !caps[1].trim().is_empty(),
            });
        }
    }
    Ok(tasks)
}
