//! Legacy document parsing.
//!
//! Time logs come in three grammars, tried in [`Grammar::PRIORITY`] order.
//! Detection looks for each grammar's structural markers; when none match,
//! every parser is run and the first non-empty result wins. A malformed line
//! is skipped with a [`Warning`]; a bad task reference, a disallowed status
//! token, or binary content aborts the whole parse with
//! [`MigrateError::Corrupted`].

pub mod freeform;
pub mod schedule;
pub mod structured;
pub mod tabular;
pub mod tasks;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::model::{Grammar, Milestone, Task, TimeSession, normalize_session_status};
use crate::provider::{AuthorLookup, CachedLookup, FirstMatch, ProviderAttribution, TaskListProvider};
use crate::store::files::sha256_hex;
use crate::store::paths::ProjectPaths;
use crate::task_id::TaskId;

/// A decoded legacy document.
#[derive(Debug, Clone, Copy)]
pub struct SourceDoc<'a> {
    pub name: &'a str,
    pub text: &'a str,
}

impl<'a> SourceDoc<'a> {
    pub fn new(name: &'a str, text: &'a str) -> Self {
        Self { name, text }
    }

    /// 1-based line numbers paired with the raw line.
    pub fn lines(&self) -> impl Iterator<Item = (usize, &'a str)> {
        self.text.lines().enumerate().map(|(i, l)| (i + 1, l))
    }

    pub(crate) fn corrupted(&self, line: usize, reason: impl Into<String>) -> MigrateError {
        MigrateError::corrupted(self.name, Some(line), reason)
    }

    /// Resolve a task reference, treating anything malformed as corruption.
    pub(crate) fn task_ref(&self, line: usize, raw: &str) -> Result<TaskId> {
        TaskId::parse_ref(raw).map_err(|err| self.corrupted(line, err.to_string()))
    }
}

/// Collaborators and settings a parse call may consult.
pub struct ParseContext<'a> {
    pub lookup: &'a dyn AuthorLookup,
    /// Status tokens accepted beyond the built-in set.
    pub extra_statuses: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub source: String,
    pub line: usize,
    pub message: String,
}

/// Running totals for one parse, returned alongside the records.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total_minutes: u64,
    pub session_count: usize,
    pub users: BTreeSet<String>,
}

impl Totals {
    fn record(&mut self, session: &TimeSession) {
        self.total_minutes = self.total_minutes.saturating_add(session.minutes);
        self.session_count += 1;
        self.users.insert(session.user.clone());
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimeLog {
    /// `None` when the document held no sessions in any grammar.
    pub grammar: Option<Grammar>,
    pub sessions: Vec<TimeSession>,
    pub totals: Totals,
    pub warnings: Vec<Warning>,
}

impl TimeLog {
    pub(crate) fn new(grammar: Grammar) -> Self {
        Self {
            grammar: Some(grammar),
            ..Self::default()
        }
    }

    pub(crate) fn push(&mut self, session: TimeSession) {
        self.totals.record(&session);
        self.sessions.push(session);
    }

    pub(crate) fn warn(&mut self, doc: &SourceDoc<'_>, line: usize, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(source = doc.name, line, %message, "skipped line");
        self.warnings.push(Warning {
            source: doc.name.to_string(),
            line,
            message,
        });
    }
}

impl Grammar {
    pub fn detect(self, text: &str) -> bool {
        match self {
            Self::Tabular => tabular::detect(text),
            Self::Structured => structured::detect(text),
            Self::Freeform => freeform::detect(text),
        }
    }

    pub fn parse(self, doc: &SourceDoc<'_>, ctx: &ParseContext<'_>) -> Result<TimeLog> {
        match self {
            Self::Tabular => tabular::parse(doc, ctx),
            Self::Structured => structured::parse(doc, ctx),
            Self::Freeform => freeform::parse(doc, ctx),
        }
    }
}

/// First grammar whose markers appear in `text`.
pub fn detect(text: &str) -> Option<Grammar> {
    Grammar::PRIORITY.into_iter().find(|g| g.detect(text))
}

pub fn parse_time_log(doc: &SourceDoc<'_>, ctx: &ParseContext<'_>) -> Result<TimeLog> {
    if let Some(grammar) = detect(doc.text) {
        tracing::info!(source = doc.name, %grammar, "detected time log grammar");
        return grammar.parse(doc, ctx);
    }

    let mut warnings = Vec::new();
    for grammar in Grammar::PRIORITY {
        let mut log = grammar.parse(doc, ctx)?;
        if !log.sessions.is_empty() {
            tracing::info!(source = doc.name, %grammar, "time log parsed by fallback");
            return Ok(log);
        }
        warnings.append(&mut log.warnings);
    }
    tracing::info!(source = doc.name, "time log holds no sessions");
    Ok(TimeLog {
        warnings,
        ..TimeLog::default()
    })
}

/// Reject binary content; strip a UTF-8 byte-order mark.
pub fn decode(name: &str, bytes: Vec<u8>) -> Result<String> {
    if bytes.contains(&0) {
        return Err(MigrateError::corrupted(name, None, "contains null bytes"));
    }
    let text = String::from_utf8(bytes)
        .map_err(|e| MigrateError::corrupted(name, None, format!("not valid UTF-8 ({e})")))?;
    Ok(match text.strip_prefix('\u{feff}') {
        Some(rest) => rest.to_string(),
        None => text,
    })
}

/// Stable across runs: derived from where the session came from.
pub fn session_id(grammar: Grammar, line: usize, raw: &str) -> String {
    let digest = sha256_hex(format!("{grammar}|{line}|{raw}").as_bytes());
    digest[..16].to_string()
}

/// Fields collected for one session before it is validated and frozen.
#[derive(Debug, Default)]
pub(crate) struct SessionDraft {
    pub user: Option<String>,
    pub minutes: u64,
    pub description: String,
    pub date: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub status: Option<String>,
}

impl SessionDraft {
    /// `raw` is the source text the session id is derived from.
    pub fn finish(
        self,
        doc: &SourceDoc<'_>,
        ctx: &ParseContext<'_>,
        grammar: Grammar,
        line: usize,
        raw: &str,
        task_id: TaskId,
    ) -> Result<TimeSession> {
        let status = normalize_session_status(self.status.as_deref(), ctx.extra_statuses)
            .ok_or_else(|| {
                doc.corrupted(
                    line,
                    format!(
                        "disallowed status token '{}'",
                        self.status.as_deref().unwrap_or_default().trim()
                    ),
                )
            })?;
        let user = self
            .user
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| crate::model::UNKNOWN_USER.to_string());
        Ok(TimeSession {
            id: session_id(grammar, line, raw),
            task_id,
            user,
            minutes: self.minutes,
            description: self.description.trim().to_string(),
            date: non_empty(self.date),
            start: non_empty(self.start),
            end: non_empty(self.end),
            status,
            provenance: grammar,
            line,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Longest single session accepted, in minutes.
pub const MAX_SESSION_MINUTES: u64 = u32::MAX as u64;

/// Round a fractional minute count. Negative, non-finite and implausibly
/// large values are rejected.
pub fn whole_minutes(minutes: f64) -> Option<u64> {
    if !minutes.is_finite() || minutes < 0.0 {
        return None;
    }
    let rounded = minutes.round();
    if rounded > MAX_SESSION_MINUTES as f64 {
        return None;
    }
    Some(rounded as u64)
}

/// File names the sources were read from, for error messages.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SourceNames {
    pub time_log: String,
    pub task_list: String,
    pub schedule: String,
}

/// Everything parsed from one project's legacy documents.
#[derive(Debug, Default, Clone)]
pub struct ParsedSources {
    pub names: SourceNames,
    pub time_log: TimeLog,
    pub tasks: Vec<Task>,
    pub milestones: Vec<Milestone>,
    pub warnings: Vec<Warning>,
    /// Hash over all source contents; detects edits between runs.
    pub source_digest: String,
}

/// Read and parse the time log, task list and schedule. Absent documents are
/// treated as empty. Rows naming no user are attributed to the task's
/// assignee in the task list first, then to `lookup`.
pub fn parse_sources(
    paths: &ProjectPaths,
    config: &MigrationConfig,
    lookup: &dyn AuthorLookup,
) -> Result<ParsedSources> {
    let root = paths.root();
    let time_path = config.source_path(root, &config.time_log);
    let task_path = config.source_path(root, &config.task_list);
    let schedule_path = config.source_path(root, &config.schedule);

    let mut digest_input = String::new();
    let time_text = read_source(&time_path, &mut digest_input)?;
    let task_text = read_source(&task_path, &mut digest_input)?;
    let schedule_text = read_source(&schedule_path, &mut digest_input)?;

    let task_name = display_name(&task_path);
    let task_doc = tasks::parse(&SourceDoc::new(&task_name, &task_text))?;

    let assignees = ProviderAttribution::new(TaskListProvider::new(&task_doc));
    let chain = FirstMatch(vec![&assignees as &dyn AuthorLookup, lookup]);
    let cached = CachedLookup::new(&chain);
    let ctx = ParseContext {
        lookup: &cached,
        extra_statuses: &config.non_billable_statuses,
    };

    let time_name = display_name(&time_path);
    let time_log = parse_time_log(&SourceDoc::new(&time_name, &time_text), &ctx)?;

    let schedule_name = display_name(&schedule_path);
    let schedule_doc = schedule::parse(&SourceDoc::new(&schedule_name, &schedule_text))?;

    let mut warnings = time_log.warnings.clone();
    warnings.extend(schedule_doc.warnings);

    tracing::info!(
        sessions = time_log.totals.session_count,
        minutes = time_log.totals.total_minutes,
        tasks = task_doc.len(),
        milestones = schedule_doc.milestones.len(),
        "parsed legacy sources"
    );

    Ok(ParsedSources {
        names: SourceNames {
            time_log: time_name,
            task_list: task_name,
            schedule: schedule_name,
        },
        time_log,
        tasks: task_doc,
        milestones: schedule_doc.milestones,
        warnings,
        source_digest: sha256_hex(digest_input.as_bytes()),
    })
}

fn read_source(path: &Path, digest_input: &mut String) -> Result<String> {
    let name = display_name(path);
    if !path.exists() {
        digest_input.push_str(&format!("{name}\0absent\n"));
        return Ok(String::new());
    }
    let bytes = fs::read(path)?;
    digest_input.push_str(&format!("{name}\0{}\n", sha256_hex(&bytes)));
    decode(&name, bytes)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
