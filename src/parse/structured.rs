use std::sync::OnceLock;

use regex::Regex;

use crate::error::Result;
use crate::model::Grammar;
use crate::parse::{ParseContext, SessionDraft, SourceDoc, TimeLog, whole_minutes};

fn header_regex() -> &'static Regex {
    static HEADER_RE: OnceLock<Regex> = OnceLock::new();
    HEADER_RE.get_or_init(|| Regex::new(r"(?i)^(?:#+\s*|\[)?session\b").unwrap())
}

fn property_regex() -> &'static Regex {
    static PROPERTY_RE: OnceLock<Regex> = OnceLock::new();
    PROPERTY_RE
        .get_or_init(|| Regex::new(r"^\s+(?:[-*]\s+)?([A-Za-z][A-Za-z _-]*?)\s*:\s*(.*)$").unwrap())
}

fn duration_part_regex() -> &'static Regex {
    static PART_RE: OnceLock<Regex> = OnceLock::new();
    PART_RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*([a-z]*)").unwrap())
}

/// Unit applied to a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Hours,
    Minutes,
}

/// Accepts `2.5h`, `90m`, `1h 30m`, `2 hours`, and bare numbers in
/// `default` units. Returns whole minutes, rounded.
pub fn parse_duration(text: &str, default: Unit) -> Option<u64> {
    let lowered = text.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let mut total = 0.0_f64;
    let mut cursor = 0;
    for caps in duration_part_regex().captures_iter(&lowered) {
        let whole = caps.get(0)?;
        if !lowered[cursor..whole.start()]
            .chars()
            .all(|c| c.is_whitespace() || c == ',')
        {
            return None;
        }
        cursor = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let unit = match &caps[2] {
            "" => default,
            "h" | "hr" | "hrs" | "hour" | "hours" => Unit::Hours,
            "m" | "min" | "mins" | "minute" | "minutes" => Unit::Minutes,
            _ => return None,
        };
        total += match unit {
            Unit::Hours => value * 60.0,
            Unit::Minutes => value,
        };
    }
    if cursor == 0 || !lowered[cursor..].trim().is_empty() {
        return None;
    }
    whole_minutes(total)
}

fn is_header(line: &str) -> bool {
    header_regex().is_match(line.trim_start())
}

fn property(line: &str) -> Option<(String, String)> {
    let caps = property_regex().captures(line)?;
    Some((
        caps[1].trim().to_ascii_lowercase(),
        caps[2].trim().to_string(),
    ))
}

pub fn detect(text: &str) -> bool {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty()).peekable();
    while let Some(line) = lines.next() {
        if is_header(line) && lines.peek().is_some_and(|next| property(next).is_some()) {
            return true;
        }
    }
    false
}

struct Block<'a> {
    line: usize,
    raw: Vec<&'a str>,
    props: Vec<(String, String)>,
}

impl Block<'_> {
    fn get(&self, keys: &[&str]) -> Option<(&str, &str)> {
        self.props
            .iter()
            .find(|(k, _)| keys.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub fn parse(doc: &SourceDoc<'_>, ctx: &ParseContext<'_>) -> Result<TimeLog> {
    let mut log = TimeLog::new(Grammar::Structured);
    let mut current: Option<Block<'_>> = None;

    for (line_no, line) in doc.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if is_header(line) {
            if let Some(block) = current.take() {
                finish(doc, ctx, block, &mut log)?;
            }
            current = Some(Block {
                line: line_no,
                raw: vec![line],
                props: Vec::new(),
            });
            continue;
        }
        match (&mut current, property(line)) {
            (Some(block), Some(prop)) => {
                block.raw.push(line);
                block.props.push(prop);
            }
            _ => {
                if let Some(block) = current.take() {
                    finish(doc, ctx, block, &mut log)?;
                }
            }
        }
    }
    if let Some(block) = current.take() {
        finish(doc, ctx, block, &mut log)?;
    }
    Ok(log)
}

fn finish(
    doc: &SourceDoc<'_>,
    ctx: &ParseContext<'_>,
    block: Block<'_>,
    log: &mut TimeLog,
) -> Result<()> {
    let Some((_, task)) = block.get(&["task", "issue"]) else {
        log.warn(doc, block.line, "session block has no task reference");
        return Ok(());
    };
    let task_id = doc.task_ref(block.line, task)?;

    let Some((key, value)) = block.get(&["duration", "hours", "minutes", "time"]) else {
        log.warn(doc, block.line, "session block has no duration");
        return Ok(());
    };
    let default = if key == "hours" { Unit::Hours } else { Unit::Minutes };
    let Some(minutes) = parse_duration(value, default) else {
        log.warn(doc, block.line, format!("unparseable duration '{value}'"));
        return Ok(());
    };

    let field = |keys: &[&str]| block.get(keys).map(|(_, v)| v.to_string());
    let draft = SessionDraft {
        user: field(&["user", "author"]),
        minutes,
        description: field(&["description", "notes"]).unwrap_or_default(),
        date: field(&["date"]),
        start: field(&["start"]),
        end: field(&["end"]),
        status: field(&["status"]),
    };
    let raw = block.raw.join("\n");
    let session = draft.finish(doc, ctx, Grammar::Structured, block.line, &raw, task_id)?;
    log.push(session);
    Ok(())
}
