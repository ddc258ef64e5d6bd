use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::model::{BillingSummary, Grammar, Milestone, SCHEMA_VERSION, Task, TimeSession};
use crate::store::files::{ensure_dir, read_json, read_json_opt, write_atomic, write_json_atomic};
use crate::store::paths::ProjectPaths;

pub const ISOLATION_MARKER: &str = ".isolated";
pub const IGNORE_MARKER: &str = ".gitignore";
pub const USER_FILE: &str = "time.json";

/// Declares which fields of a per-user file are meant to be encrypted. The
/// cipher itself is supplied by whoever consumes the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMarker {
    pub encrypted_fields: Vec<String>,
    pub provider: String,
}

impl EncryptionMarker {
    pub fn sensitive_fields() -> Self {
        Self {
            encrypted_fields: vec!["user".into(), "description".into()],
            provider: "external".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTimeFile {
    pub schema_version: u32,
    pub user: String,
    pub sessions: Vec<TimeSession>,
    pub total_minutes: u64,
    pub billing_minutes: u64,
    pub session_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionMarker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedFile {
    pub schema_version: u32,
    pub sessions: Vec<TimeSession>,
    pub summary: BillingSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCollection {
    pub schema_version: u32,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneCollection {
    pub schema_version: u32,
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMetadata {
    pub schema_version: u32,
    pub format_detected: Option<Grammar>,
    pub migrated_at: DateTime<Utc>,
    pub run_id: String,
    pub backup_id: String,
    pub anonymized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionMarker>,
    pub session_count: usize,
    pub total_minutes: u64,
    pub source_digest: String,
}

/// What one batch write touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchWrite {
    pub users_touched: BTreeSet<String>,
    pub sessions_written: usize,
    pub minutes_written: u64,
}

/// Writer for everything under `.flowforge/` that holds migrated data.
pub struct CanonicalStore {
    paths: ProjectPaths,
    non_billable: Vec<String>,
    encryption: Option<EncryptionMarker>,
}

impl CanonicalStore {
    pub fn new(paths: &ProjectPaths, non_billable: &[String]) -> Self {
        Self {
            paths: paths.clone(),
            non_billable: non_billable.to_vec(),
            encryption: None,
        }
    }

    pub fn with_encryption(mut self, marker: Option<EncryptionMarker>) -> Self {
        self.encryption = marker;
        self
    }

    pub fn is_billable(&self, status: &str) -> bool {
        !self.non_billable.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    /// Drop session output and staged batches from an earlier run so a fresh
    /// run starts from nothing. The snapshot taken beforehand still holds the
    /// old files.
    pub fn reset_session_outputs(&self) -> Result<()> {
        let consolidated = self.paths.consolidated_file();
        if consolidated.exists() {
            fs::remove_file(&consolidated).map_err(|e| MigrateError::from_write(e, &consolidated))?;
        }
        let users = self.paths.users_dir();
        if users.exists() {
            fs::remove_dir_all(&users).map_err(|e| MigrateError::from_write(e, &users))?;
        }
        clear_staging(&self.paths)?;
        Ok(())
    }

    /// Park one processed batch under `staging/batch-NNNNNN.json`. Staging
    /// the same index again replaces it, so re-running a batch after an
    /// interruption is harmless.
    pub fn stage_batch(&self, index: usize, batch: &[TimeSession]) -> Result<BatchWrite> {
        let path = self.paths.staging_dir().join(format!("batch-{index:06}.json"));
        write_json_atomic(&path, &batch)?;
        Ok(BatchWrite {
            users_touched: batch.iter().map(|s| s.user.clone()).collect(),
            sessions_written: batch.len(),
            minutes_written: batch.iter().map(|s| s.minutes).sum(),
        })
    }

    /// Write every staged batch out as per-user and consolidated files in a
    /// single pass. Staged batches stay in place until [`clear_staging`].
    pub fn commit_staged(&self) -> Result<BatchWrite> {
        let mut sessions = Vec::new();
        for (_, path) in staged_batches(&self.paths.staging_dir())? {
            sessions.extend(read_json::<Vec<TimeSession>>(&path)?);
        }
        self.write_sessions(&sessions)
    }

    /// Replace the per-user files and the consolidated file with `sessions`.
    /// Sessions sharing an id are written once.
    pub fn write_sessions(&self, sessions: &[TimeSession]) -> Result<BatchWrite> {
        let merged = dedupe_sessions(sessions);

        let mut by_user: BTreeMap<&str, Vec<TimeSession>> = BTreeMap::new();
        for session in &merged {
            by_user
                .entry(session.user.as_str())
                .or_default()
                .push(session.clone());
        }

        let mut write = BatchWrite::default();
        for (user, user_sessions) in by_user {
            let dir = self.paths.user_dir(user);
            ensure_private_dir(&dir)?;
            write_json_atomic(&dir.join(USER_FILE), &self.user_file(user, user_sessions))?;
            write.users_touched.insert(user.to_string());
        }

        write.sessions_written = merged.len();
        write.minutes_written = merged.iter().map(|s| s.minutes).sum();
        write_json_atomic(&self.paths.consolidated_file(), &consolidated(merged))?;
        tracing::debug!(
            sessions = write.sessions_written,
            users = write.users_touched.len(),
            "session files written"
        );
        Ok(write)
    }

    fn user_file(&self, user: &str, sessions: Vec<TimeSession>) -> UserTimeFile {
        let total_minutes = sessions.iter().map(|s| s.minutes).sum();
        let billing_minutes = sessions
            .iter()
            .filter(|s| self.is_billable(&s.status))
            .map(|s| s.minutes)
            .sum();
        UserTimeFile {
            schema_version: SCHEMA_VERSION,
            user: user.to_string(),
            session_count: sessions.len(),
            sessions,
            total_minutes,
            billing_minutes,
            encryption: self.encryption.clone(),
        }
    }

    pub fn write_tasks(&self, tasks: &[Task]) -> Result<()> {
        write_json_atomic(
            &self.paths.tasks_file(),
            &TaskCollection {
                schema_version: SCHEMA_VERSION,
                tasks: tasks.to_vec(),
            },
        )
    }

    pub fn write_milestones(&self, milestones: &[Milestone]) -> Result<()> {
        write_json_atomic(
            &self.paths.milestones_file(),
            &MilestoneCollection {
                schema_version: SCHEMA_VERSION,
                milestones: milestones.to_vec(),
            },
        )
    }

    pub fn write_metadata(&self, metadata: &MigrationMetadata) -> Result<()> {
        write_json_atomic(&self.paths.metadata_file(), metadata)
    }
}

/// Remove staged batches. Returns how many there were.
pub fn clear_staging(paths: &ProjectPaths) -> Result<usize> {
    let dir = paths.staging_dir();
    if !dir.exists() {
        return Ok(0);
    }
    let staged = staged_batches(&dir)?.len();
    fs::remove_dir_all(&dir).map_err(|e| MigrateError::from_write(e, &dir))?;
    Ok(staged)
}

/// `batch-N.json` files under `dir`, in batch order.
fn staged_batches(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(index) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("batch-"))
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|digits| digits.parse::<usize>().ok())
        else {
            continue;
        };
        files.push((index, path));
    }
    files.sort_by_key(|(index, _)| *index);
    Ok(files)
}

pub fn read_metadata(paths: &ProjectPaths) -> Result<Option<MigrationMetadata>> {
    read_json_opt(&paths.metadata_file())
}

pub fn read_consolidated(paths: &ProjectPaths) -> Result<Option<ConsolidatedFile>> {
    read_json_opt(&paths.consolidated_file())
}

/// Every `users/<dir>/` directory, sorted, with the path of its time file.
pub fn user_dirs(paths: &ProjectPaths) -> Result<Vec<(PathBuf, PathBuf)>> {
    let root = paths.users_dir();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let dir = entry.path();
            let file = dir.join(USER_FILE);
            dirs.push((dir, file));
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn read_user_file(path: &Path) -> Result<UserTimeFile> {
    read_json(path)
}

fn consolidated(sessions: Vec<TimeSession>) -> ConsolidatedFile {
    let summary = BillingSummary::from_sessions(&sessions);
    ConsolidatedFile {
        schema_version: SCHEMA_VERSION,
        sessions,
        summary,
    }
}

/// Last occurrence of each id wins; output is in source line order.
fn dedupe_sessions(sessions: &[TimeSession]) -> Vec<TimeSession> {
    let mut by_id: BTreeMap<String, TimeSession> = BTreeMap::new();
    for session in sessions {
        by_id.insert(session.id.clone(), session.clone());
    }
    let mut merged: Vec<TimeSession> = by_id.into_values().collect();
    merged.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.id.cmp(&b.id)));
    merged
}

/// Create a user directory readable only by its owner, with the marker files
/// the isolation check looks for.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    ensure_dir(dir)?;
    set_private(dir)?;
    let marker = dir.join(ISOLATION_MARKER);
    if !marker.exists() {
        write_atomic(&marker, b"")?;
    }
    let ignore = dir.join(IGNORE_MARKER);
    if !ignore.exists() {
        write_atomic(&ignore, b"*\n")?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_private(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .map_err(|e| MigrateError::from_write(e, dir))
}

#[cfg(not(unix))]
fn set_private(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_SESSION_STATUS;
    use crate::task_id::TaskId;
    use tempfile::tempdir;

    fn session(id: &str, user: &str, minutes: u64, line: usize, status: &str) -> TimeSession {
        TimeSession {
            id: id.into(),
            task_id: TaskId::parse_ref("42").unwrap(),
            user: user.into(),
            minutes,
            description: String::new(),
            date: None,
            start: None,
            end: None,
            status: status.into(),
            provenance: Grammar::Freeform,
            line,
        }
    }

    fn store(paths: &ProjectPaths) -> CanonicalStore {
        CanonicalStore::new(paths, &["non-billable".to_string()])
    }

    #[test]
    fn staged_batches_commit_into_user_and_consolidated_files() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let store = store(&paths);

        store
            .stage_batch(
                0,
                &[
                    session("b", "alice", 30, 2, DEFAULT_SESSION_STATUS),
                    session("a", "bob", 60, 1, DEFAULT_SESSION_STATUS),
                ],
            )
            .unwrap();
        let staged = store
            .stage_batch(1, &[session("c", "alice", 45, 3, "non-billable")])
            .unwrap();
        assert_eq!(staged.minutes_written, 45);
        assert!(!paths.users_dir().exists());
        assert!(read_consolidated(&paths).unwrap().is_none());

        let write = store.commit_staged().unwrap();
        assert_eq!(write.sessions_written, 3);
        assert_eq!(write.users_touched.len(), 2);

        let alice = read_user_file(&paths.user_file("alice")).unwrap();
        assert_eq!(alice.session_count, 2);
        assert_eq!(alice.total_minutes, 75);
        assert_eq!(alice.billing_minutes, 30);

        let all = read_consolidated(&paths).unwrap().unwrap();
        let ids: Vec<_> = all.sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(all.summary.total_minutes, 135);
        assert_eq!(all.summary.user_count, 2);

        assert_eq!(clear_staging(&paths).unwrap(), 2);
        assert!(!paths.staging_dir().exists());
    }

    #[test]
    fn restaging_a_batch_does_not_duplicate_sessions() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let store = store(&paths);
        let batch = [session("a", "alice", 30, 1, DEFAULT_SESSION_STATUS)];

        store.stage_batch(0, &batch).unwrap();
        store.commit_staged().unwrap();
        let first = fs::read(paths.consolidated_file()).unwrap();
        store.stage_batch(0, &batch).unwrap();
        store.commit_staged().unwrap();
        let second = fs::read(paths.consolidated_file()).unwrap();

        assert_eq!(first, second);
        assert_eq!(read_user_file(&paths.user_file("alice")).unwrap().total_minutes, 30);
    }

    #[test]
    fn batches_commit_in_numeric_order() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let store = store(&paths);
        // Same id in two batches: the later batch wins.
        store
            .stage_batch(10, &[session("a", "alice", 90, 1, DEFAULT_SESSION_STATUS)])
            .unwrap();
        store
            .stage_batch(9, &[session("a", "alice", 30, 1, DEFAULT_SESSION_STATUS)])
            .unwrap();

        store.commit_staged().unwrap();
        assert_eq!(read_user_file(&paths.user_file("alice")).unwrap().total_minutes, 90);
    }

    #[test]
    fn user_dirs_carry_isolation_markers() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        store(&paths)
            .write_sessions(&[session("a", "alice", 30, 1, DEFAULT_SESSION_STATUS)])
            .unwrap();

        let user_dir = paths.user_dir("alice");
        assert!(user_dir.join(ISOLATION_MARKER).exists());
        assert_eq!(fs::read_to_string(user_dir.join(IGNORE_MARKER)).unwrap(), "*\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&user_dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn reset_and_empty_commit() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let store = store(&paths);
        store
            .stage_batch(0, &[session("a", "alice", 30, 1, DEFAULT_SESSION_STATUS)])
            .unwrap();
        store.commit_staged().unwrap();

        store.reset_session_outputs().unwrap();
        assert!(!paths.users_dir().exists());
        assert!(!paths.staging_dir().exists());
        assert!(read_consolidated(&paths).unwrap().is_none());

        store.commit_staged().unwrap();
        let empty = read_consolidated(&paths).unwrap().unwrap();
        assert!(empty.sessions.is_empty());
        assert_eq!(empty.summary.total_minutes, 0);
        assert!(!paths.users_dir().exists());
    }

    #[test]
    fn encryption_marker_is_recorded_per_user() {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        let store = store(&paths).with_encryption(Some(EncryptionMarker::sensitive_fields()));
        store
            .write_sessions(&[session("a", "alice", 30, 1, DEFAULT_SESSION_STATUS)])
            .unwrap();

        let file = read_user_file(&paths.user_file("alice")).unwrap();
        assert_eq!(file.encryption, Some(EncryptionMarker::sensitive_fields()));
    }
}
