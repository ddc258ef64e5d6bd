use std::collections::BTreeSet;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::error::Result;
use crate::model::{Milestone, MilestoneStatus};
use crate::parse::{SourceDoc, Warning};

fn heading_regex() -> &'static Regex {
    static HEADING_RE: OnceLock<Regex> = OnceLock::new();
    HEADING_RE.get_or_init(|| Regex::new(r"^##\s+(.+?)\s*$").unwrap())
}

fn version_regex() -> &'static Regex {
    static VERSION_RE: OnceLock<Regex> = OnceLock::new();
    VERSION_RE.get_or_init(|| Regex::new(r"\bv\d+(?:\.\d+)*(?:-[0-9A-Za-z.]+)?\b").unwrap())
}

fn property_regex() -> &'static Regex {
    static PROPERTY_RE: OnceLock<Regex> = OnceLock::new();
    PROPERTY_RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*]\s+)?\**([A-Za-z]+)\**\s*:\s*\**(.*?)\**\s*$").unwrap()
    })
}

#[derive(Debug, Default, Clone)]
pub struct Schedule {
    pub milestones: Vec<Milestone>,
    pub warnings: Vec<Warning>,
}

/// Parse a schedule timestamp in any of the layouts hand-edited schedules use.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for layout in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Lowercase ASCII words joined by hyphens.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn parse(doc: &SourceDoc<'_>) -> Result<Schedule> {
    let mut schedule = Schedule::default();
    let mut open = false;

    for (line_no, line) in doc.lines() {
        if let Some(caps) = heading_regex().captures(line) {
            let title = caps[1].trim().to_string();
            let id = match version_regex().find(&title) {
                Some(m) => m.as_str().to_string(),
                None => {
                    let slug = slugify(&title);
                    if slug.is_empty() {
                        format!("milestone-{line_no}")
                    } else {
                        slug
                    }
                }
            };
            schedule.milestones.push(Milestone {
                id,
                title,
                start: None,
                end: None,
                status: MilestoneStatus::default(),
                depends_on: Vec::new(),
                tasks: BTreeSet::new(),
                line: line_no,
            });
            open = true;
            continue;
        }
        if line.starts_with('#') && !line.starts_with("###") {
            // A top-level heading ends the milestone section.
            open = false;
            continue;
        }
        let Some(milestone) = schedule.milestones.last_mut().filter(|_| open) else {
            continue;
        };
        let Some(caps) = property_regex().captures(line) else {
            continue;
        };
        let value = caps[2].trim();
        match caps[1].to_ascii_lowercase().as_str() {
            "status" => {
                milestone.status = MilestoneStatus::parse_token(value).ok_or_else(|| {
                    doc.corrupted(line_no, format!("disallowed status token '{value}'"))
                })?;
            }
            "start" | "end" => {
                if !value.is_empty() && parse_timestamp(value).is_none() {
                    schedule.warnings.push(Warning {
                        source: doc.name.to_string(),
                        line: line_no,
                        message: format!("unrecognized date '{value}' kept verbatim"),
                    });
                }
                let slot = if caps[1].eq_ignore_ascii_case("start") {
                    &mut milestone.start
                } else {
                    &mut milestone.end
                };
                *slot = Some(value.to_string()).filter(|v| !v.is_empty());
            }
            "depends" | "dependencies" => {
                milestone
                    .depends_on
                    .extend(value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from));
            }
            "tasks" => {
                for token in list(value) {
                    milestone.tasks.insert(doc.task_ref(line_no, token)?);
                }
            }
            _ => {}
        }
    }
    Ok(schedule)
}
