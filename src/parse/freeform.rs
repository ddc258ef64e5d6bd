use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::model::Grammar;
use crate::parse::structured::{Unit, parse_duration};
use crate::parse::{ParseContext, SessionDraft, SourceDoc, TimeLog};

fn date_header_regex() -> &'static Regex {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    DATE_RE.get_or_init(|| Regex::new(r"^(?:#+\s*)?(\d{4}-\d{2}-\d{2})\b").unwrap())
}

fn bullet_regex() -> &'static Regex {
    static BULLET_RE: OnceLock<Regex> = OnceLock::new();
    BULLET_RE.get_or_init(|| Regex::new(r"^\s*[-*+]\s+(.*)$").unwrap())
}

/// `#` followed by a digit starts a task reference; the rest of the word
/// belongs to it, so `#12a` is a malformed reference rather than `#12`.
fn task_regex() -> &'static Regex {
    static TASK_RE: OnceLock<Regex> = OnceLock::new();
    TASK_RE.get_or_init(|| Regex::new(r"#(\d\w*)").unwrap())
}

fn duration_regex() -> &'static Regex {
    static DURATION_RE: OnceLock<Regex> = OnceLock::new();
    DURATION_RE.get_or_init(|| Regex::new(r"\[(\d[^\]]*)\]").unwrap())
}

fn user_regex() -> &'static Regex {
    static USER_RE: OnceLock<Regex> = OnceLock::new();
    USER_RE.get_or_init(|| Regex::new(r"(?:^|\s)@([\w.-]+)").unwrap())
}

pub fn detect(text: &str) -> bool {
    let has_date_header = text
        .lines()
        .any(|l| date_header_regex().is_match(l.trim_start()));
    has_date_header
        && text.lines().any(|l| {
            bullet_regex().is_match(l) && task_regex().is_match(l) && duration_regex().is_match(l)
        })
}

pub fn parse(doc: &SourceDoc<'_>, ctx: &ParseContext<'_>) -> Result<TimeLog> {
    let mut log = TimeLog::new(Grammar::Freeform);
    let mut date: Option<String> = None;

    for (line_no, line) in doc.lines() {
        if let Some(caps) = date_header_regex().captures(line.trim_start()) {
            date = Some(caps[1].to_string());
            continue;
        }
        let Some(bullet) = bullet_regex().captures(line) else {
            continue;
        };
        let text = bullet.get(1).map(|m| m.as_str()).unwrap_or_default();

        let task = task_regex().captures(text);
        let duration = duration_regex().captures(text);
        let (task, duration) = match (task, duration) {
            (Some(t), Some(d)) => (t, d),
            (Some(_), None) => {
                log.warn(doc, line_no, "entry has no bracketed duration");
                continue;
            }
            (None, Some(_)) => {
                log.warn(doc, line_no, "entry has no task reference");
                continue;
            }
            (None, None) => continue,
        };

        let task_id = doc.task_ref(line_no, &task[1])?;
        let Some(minutes) = parse_duration(&duration[1], Unit::Minutes) else {
            log.warn(
                doc,
                line_no,
                format!("unparseable duration '[{}]'", &duration[1]),
            );
            continue;
        };
        let user = user_regex().captures(text).map(|c| c[1].to_string());

        let without_duration = duration_regex().replace_all(text, "");
        let stripped = user_regex().replace_all(&without_duration, "");
        let description = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

        let draft = SessionDraft {
            user,
            minutes,
            description,
            date: date.clone(),
            ..SessionDraft::default()
        };
        let session = draft.finish(doc, ctx, Grammar::Freeform, line_no, line, task_id)?;
        log.push(session);
    }
    Ok(log)
}
