use crate::error::Result;
use crate::model::Grammar;
use crate::parse::structured::{Unit, parse_duration};
use crate::parse::{ParseContext, SessionDraft, SourceDoc, TimeLog};

/// Column positions resolved from a header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Columns {
    date: usize,
    issue: usize,
    hours: usize,
    user: Option<usize>,
    start: Option<usize>,
    end: Option<usize>,
    status: Option<usize>,
    description: Option<usize>,
}

impl Columns {
    fn from_header(cells: &[&str]) -> Option<Self> {
        let find = |names: &[&str]| {
            cells
                .iter()
                .position(|c| names.iter().any(|n| c.eq_ignore_ascii_case(n)))
        };
        Some(Self {
            date: find(&["date"])?,
            issue: find(&["issue", "task", "ticket"])?,
            hours: find(&["hours", "duration"])?,
            user: find(&["user", "author", "who"]),
            start: find(&["start"]),
            end: find(&["end"]),
            status: find(&["status"]),
            description: find(&["description", "notes"]),
        })
    }
}

fn cells(line: &str) -> Option<Vec<&str>> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    Some(inner.split('|').map(str::trim).collect())
}

fn is_separator(cells: &[&str]) -> bool {
    cells.iter().all(|c| {
        let c = c.trim_matches(':');
        !c.is_empty() && c.chars().all(|ch| ch == '-')
    })
}

pub fn detect(text: &str) -> bool {
    text.lines()
        .filter_map(cells)
        .any(|row| Columns::from_header(&row).is_some())
}

/// Hours cell value. `None` means unparseable.
enum Hours {
    Minutes(u64),
    Active,
}

fn parse_hours(cell: &str) -> Option<Hours> {
    let lowered = cell.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "active" => Some(Hours::Active),
        "" | "-" | "—" | "–" | "n/a" => Some(Hours::Minutes(0)),
        _ => parse_duration(&lowered, Unit::Hours).map(Hours::Minutes),
    }
}

pub fn parse(doc: &SourceDoc<'_>, ctx: &ParseContext<'_>) -> Result<TimeLog> {
    let mut log = TimeLog::new(Grammar::Tabular);
    let mut columns: Option<Columns> = None;

    for (line_no, line) in doc.lines() {
        let Some(row) = cells(line) else {
            continue;
        };
        if let Some(header) = Columns::from_header(&row) {
            columns = Some(header);
            continue;
        }
        let Some(cols) = &columns else {
            continue;
        };
        if is_separator(&row) {
            continue;
        }

        let cell = |idx: usize| row.get(idx).copied().unwrap_or_default();
        let opt = |idx: Option<usize>| idx.map(cell).map(String::from);

        let issue = cell(cols.issue);
        if issue.is_empty() {
            log.warn(doc, line_no, "row has no task reference");
            continue;
        }
        let task_id = doc.task_ref(line_no, issue)?;

        let (minutes, active) = match parse_hours(cell(cols.hours)) {
            Some(Hours::Minutes(m)) => (m, false),
            Some(Hours::Active) => (0, true),
            None => {
                log.warn(
                    doc,
                    line_no,
                    format!("unparseable hours '{}'", cell(cols.hours)),
                );
                continue;
            }
        };

        let mut status = opt(cols.status).filter(|s| !s.trim().is_empty());
        if active && status.is_none() {
            status = Some("active".into());
        }

        let user = match opt(cols.user).filter(|u| !u.trim().is_empty()) {
            Some(user) => Some(user),
            None => ctx.lookup.author_for(task_id),
        };

        let draft = SessionDraft {
            user,
            minutes,
            description: opt(cols.description).unwrap_or_default(),
            date: Some(cell(cols.date).to_string()),
            start: opt(cols.start),
            end: opt(cols.end),
            status,
        };
        let session = draft.finish(doc, ctx, Grammar::Tabular, line_no, line, task_id)?;
        log.push(session);
    }
    Ok(log)
}
