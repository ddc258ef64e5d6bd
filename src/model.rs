use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::task_id::TaskId;

/// Version of the canonical output layout. Version 1 is the legacy text form.
pub const SCHEMA_VERSION: u32 = 2;

/// Legacy time-log layouts, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grammar {
    Tabular,
    Structured,
    Freeform,
}

impl Grammar {
    pub const PRIORITY: [Grammar; 3] = [Grammar::Tabular, Grammar::Structured, Grammar::Freeform];
}

impl std::fmt::Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tabular => write!(f, "tabular"),
            Self::Structured => write!(f, "structured"),
            Self::Freeform => write!(f, "freeform"),
        }
    }
}

/// One recorded unit of tracked work. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSession {
    pub id: String,
    pub task_id: TaskId,
    pub user: String,
    pub minutes: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    pub status: String,
    pub provenance: Grammar,
    /// 1-based line in the source document; fixes output ordering.
    pub line: usize,
}

pub const DEFAULT_SESSION_STATUS: &str = "completed";
pub const UNKNOWN_USER: &str = "unknown";

/// Session status tokens accepted in legacy time logs, after normalization.
pub const SESSION_STATUSES: &[&str] = &[
    "completed",
    "active",
    "paused",
    "pending",
    "in_progress",
    "billed",
    "non-billable",
    "nonbillable",
    "unbilled",
];

/// Normalize a session status, defaulting when blank. Returns `None` for a
/// token that is neither a known status nor in `extra` (configured
/// non-billable markers).
pub fn normalize_session_status(raw: Option<&str>, extra: &[String]) -> Option<String> {
    let token = match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
        _ => return Some(DEFAULT_SESSION_STATUS.to_string()),
    };
    let canonical = match token.as_str() {
        "done" | "complete" => DEFAULT_SESSION_STATUS.to_string(),
        "in progress" | "in-progress" => "in_progress".to_string(),
        _ => token,
    };
    if SESSION_STATUSES.contains(&canonical.as_str())
        || extra.iter().any(|e| e.eq_ignore_ascii_case(&canonical))
    {
        Some(canonical)
    } else {
        None
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    #[default]
    Planned,
    InProgress,
    Completed,
}

impl MilestoneStatus {
    /// Accepts the canonical tokens plus the spellings found in hand-edited
    /// schedules. Returns `None` for anything else.
    pub fn parse_token(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "planned" | "pending" | "todo" | "not_started" => Some(Self::Planned),
            "in_progress" | "active" | "started" => Some(Self::InProgress),
            "completed" | "complete" | "done" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    /// Kept verbatim from the source; never reformatted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    pub status: MilestoneStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tasks: BTreeSet<TaskId>,
    pub line: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    OnHold,
    Completed,
}

impl TaskStatus {
    pub fn parse_token(raw: &str) -> Option<Self> {
        match normalize_token(raw).as_str() {
            "pending" | "todo" | "open" => Some(Self::Pending),
            "in_progress" | "wip" => Some(Self::InProgress),
            "on_hold" | "blocked" | "paused" => Some(Self::OnHold),
            "completed" | "complete" | "done" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::OnHold => write!(f, "on_hold"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<Subtask>,
    pub line: usize,
}

/// Derived billing view over a set of sessions. Always recomputed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingSummary {
    pub total_minutes: u64,
    pub by_user: BTreeMap<String, u64>,
    pub by_task: BTreeMap<u32, u64>,
    pub session_count: usize,
    pub user_count: usize,
}

impl BillingSummary {
    pub fn from_sessions<'a, I>(sessions: I) -> Self
    where
        I: IntoIterator<Item = &'a TimeSession>,
    {
        let mut summary = Self::default();
        for session in sessions {
            summary.total_minutes += session.minutes;
            *summary.by_user.entry(session.user.clone()).or_default() += session.minutes;
            *summary
                .by_task
                .entry(session.task_id.as_u32())
                .or_default() += session.minutes;
            summary.session_count += 1;
        }
        summary.user_count = summary.by_user.len();
        summary
    }
}

/// `In Progress`, `in-progress` and `IN_PROGRESS` all become `in_progress`.
fn normalize_token(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}
