use std::path::Path;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::output::{Format, print_json};
use crate::store::backup::{BackupStore, EntryKind};
use crate::store::paths::ProjectPaths;

#[derive(Debug, Serialize)]
struct BackupSummary {
    backup_id: String,
    created_at: DateTime<Utc>,
    sources: usize,
    outputs: usize,
    bytes: u64,
}

pub fn run(root: &Path, format: Format) -> Result<()> {
    let store = BackupStore::new(&ProjectPaths::new(root));
    let summaries: Vec<BackupSummary> = store
        .list()?
        .into_iter()
        .map(|m| BackupSummary {
            sources: m.files.iter().filter(|f| f.kind == EntryKind::Source).count(),
            outputs: m.files.iter().filter(|f| f.kind == EntryKind::Output).count(),
            bytes: m.files.iter().map(|f| f.size).sum(),
            backup_id: m.backup_id,
            created_at: m.created_at,
        })
        .collect();

    match format {
        Format::Json => print_json(&summaries)?,
        Format::Pretty => {
            if summaries.is_empty() {
                println!("no backups");
            }
            for s in &summaries {
                println!(
                    "{}  {}  {} sources, {} outputs, {} bytes",
                    s.backup_id.bold(),
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    s.sources,
                    s.outputs,
                    s.bytes
                );
            }
        }
    }
    Ok(())
}
