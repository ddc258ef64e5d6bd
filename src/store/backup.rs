use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::model::SCHEMA_VERSION;
use crate::store::files::{ensure_dir, read_json, sha256_hex, write_atomic, write_json_atomic};
use crate::store::paths::ProjectPaths;

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Source,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Project-relative path with forward slashes.
    pub path: String,
    pub kind: EntryKind,
    pub sha256: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Snapshot of the sources and prior canonical output taken before a run
/// writes anything. The unit of rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    pub files: Vec<ManifestEntry>,
    #[serde(default)]
    pub dirs: Vec<DirEntry>,
}

impl BackupManifest {
    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|e| e.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub files_restored: usize,
    pub files_removed: usize,
    pub checksums_verified: usize,
}

/// Manages `.flowforge/migration/backups/<id>/`:
///   - `files/<relative path>`: byte copies of every snapshotted file
///   - `manifest.json`: per-file sha256, size, mode
pub struct BackupStore {
    paths: ProjectPaths,
}

impl BackupStore {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.paths.backups_dir().join(backup_id)
    }

    /// Copy every existing source plus all canonical output into a new backup.
    pub fn snapshot(&self, sources: &[PathBuf]) -> Result<BackupManifest> {
        let mut files: Vec<(PathBuf, EntryKind)> = Vec::new();
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut seen = BTreeSet::new();

        for source in sources {
            if source.is_file() && seen.insert(source.clone()) {
                files.push((source.clone(), EntryKind::Source));
            }
        }
        for output in self.paths.canonical_outputs() {
            if output.is_file() {
                if seen.insert(output.clone()) {
                    files.push((output, EntryKind::Output));
                }
            } else if output.is_dir() {
                collect_tree(&output, &mut files, &mut dirs)?;
            }
        }

        let files = files
            .into_iter()
            .map(|(path, kind)| match self.paths.relative(&path) {
                Some(rel) => Ok((path, rel, kind)),
                None => Err(MigrateError::InvalidConfig(format!(
                    "{} is outside the project root and cannot be backed up",
                    path.display()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let needed: u64 = files
            .iter()
            .filter_map(|(p, _, _)| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        check_free_space(self.paths.root(), needed)?;

        let backup_id = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let dir = self.backup_dir(&backup_id);
        let files_dir = dir.join(FILES_DIR);
        ensure_dir(&files_dir)?;

        let mut entries = Vec::with_capacity(files.len());
        for (path, rel, kind) in files {
            let bytes = fs::read(&path)?;
            let meta = fs::metadata(&path)?;
            let copy = files_dir.join(&rel);
            if let Some(parent) = copy.parent() {
                ensure_dir(parent)?;
            }
            fs::write(&copy, &bytes).map_err(|e| MigrateError::from_write(e, &copy))?;
            entries.push(ManifestEntry {
                path: rel,
                kind,
                sha256: sha256_hex(&bytes),
                size: bytes.len() as u64,
                mode: file_mode(&meta),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut dir_entries = Vec::new();
        for d in &dirs {
            if let Some(rel) = self.paths.relative(d) {
                dir_entries.push(DirEntry {
                    path: rel,
                    mode: fs::metadata(d).ok().as_ref().and_then(file_mode),
                });
            }
        }
        dir_entries.sort_by(|a, b| a.path.cmp(&b.path));

        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
            files: entries,
            dirs: dir_entries,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;

        tracing::info!(
            backup_id = %backup_id,
            files = manifest.files.len(),
            bytes = needed,
            "snapshot written"
        );
        Ok(manifest)
    }

    pub fn load(&self, backup_id: &str) -> Result<BackupManifest> {
        let path = self.backup_dir(backup_id).join(MANIFEST_FILE);
        if backup_id.contains('/') || backup_id.contains("..") || !path.exists() {
            return Err(MigrateError::BackupNotFound(backup_id.to_string()));
        }
        read_json(&path)
    }

    /// All backups, newest first. Directories without a readable manifest are
    /// skipped.
    pub fn list(&self) -> Result<Vec<BackupManifest>> {
        let dir = self.paths.backups_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let manifest_path = entry.path().join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            match read_json::<BackupManifest>(&manifest_path) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => tracing::warn!(
                    path = %manifest_path.display(),
                    error = %err,
                    "skipping unreadable backup manifest"
                ),
            }
        }
        manifests.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(manifests)
    }

    pub fn latest(&self) -> Result<BackupManifest> {
        self.list()?.into_iter().next().ok_or(MigrateError::NoBackups)
    }

    /// Put every snapshotted file back, remove canonical output the snapshot
    /// did not contain, and verify the result against the manifest.
    pub fn restore(&self, manifest: &BackupManifest) -> Result<RestoreReport> {
        let files_dir = self.backup_dir(&manifest.backup_id).join(FILES_DIR);

        // Verify every copy before touching the working tree.
        let mut payloads = Vec::with_capacity(manifest.files.len());
        for entry in &manifest.files {
            let copy = files_dir.join(&entry.path);
            let bytes = fs::read(&copy).map_err(|_| MigrateError::BackupDamaged {
                backup_id: manifest.backup_id.clone(),
                reason: format!("missing copy of {}", entry.path),
            })?;
            if sha256_hex(&bytes) != entry.sha256 {
                return Err(MigrateError::BackupDamaged {
                    backup_id: manifest.backup_id.clone(),
                    reason: format!("checksum mismatch for {}", entry.path),
                });
            }
            let Some(target) = self.paths.resolve_relative(&entry.path) else {
                return Err(MigrateError::BackupDamaged {
                    backup_id: manifest.backup_id.clone(),
                    reason: format!("invalid manifest path {}", entry.path),
                });
            };
            payloads.push((entry, target, bytes));
        }

        let keep: BTreeSet<PathBuf> = payloads.iter().map(|(_, t, _)| t.clone()).collect();
        let keep_dirs: BTreeSet<PathBuf> = manifest
            .dirs
            .iter()
            .filter_map(|d| self.paths.resolve_relative(&d.path))
            .collect();
        let files_removed = self.remove_unsnapshotted_outputs(&keep, &keep_dirs)?;

        for dir in &manifest.dirs {
            if let Some(path) = self.paths.resolve_relative(&dir.path) {
                ensure_dir(&path)?;
                if let Some(mode) = dir.mode {
                    set_mode(&path, mode)?;
                }
            }
        }

        let mut checksums_verified = 0;
        for (entry, target, bytes) in &payloads {
            write_atomic(target, bytes)?;
            if let Some(mode) = entry.mode {
                set_mode(target, mode)?;
            }
            if sha256_hex(&fs::read(target)?) == entry.sha256 {
                checksums_verified += 1;
            }
        }

        tracing::warn!(
            backup_id = %manifest.backup_id,
            restored = payloads.len(),
            removed = files_removed,
            "restored snapshot"
        );
        Ok(RestoreReport {
            backup_id: manifest.backup_id.clone(),
            files_restored: payloads.len(),
            files_removed,
            checksums_verified,
        })
    }

    fn remove_unsnapshotted_outputs(
        &self,
        keep: &BTreeSet<PathBuf>,
        keep_dirs: &BTreeSet<PathBuf>,
    ) -> Result<usize> {
        let mut removed = 0;
        for output in self.paths.canonical_outputs() {
            if output.is_file() {
                if !keep.contains(&output) {
                    fs::remove_file(&output).map_err(|e| MigrateError::from_write(e, &output))?;
                    removed += 1;
                }
            } else if output.is_dir() {
                let mut files = Vec::new();
                let mut dirs = Vec::new();
                collect_tree(&output, &mut files, &mut dirs)?;
                for (file, _) in files {
                    if !keep.contains(&file) {
                        fs::remove_file(&file).map_err(|e| MigrateError::from_write(e, &file))?;
                        removed += 1;
                    }
                }
                // Deepest first so parents are empty by the time we reach them.
                dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
                for dir in dirs {
                    let has_kept_files = keep.iter().any(|k| k.starts_with(&dir));
                    if !keep_dirs.contains(&dir) && !has_kept_files {
                        let _ = fs::remove_dir(&dir);
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// Recursively collect files (tagged as output) and directories under `dir`,
/// including `dir` itself.
fn collect_tree(
    dir: &Path,
    files: &mut Vec<(PathBuf, EntryKind)>,
    dirs: &mut Vec<PathBuf>,
) -> Result<()> {
    dirs.push(dir.to_path_buf());
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_tree(&path, files, dirs)?;
        } else if file_type.is_file() {
            files.push((path, EntryKind::Output));
        }
    }
    Ok(())
}

fn check_free_space(root: &Path, needed: u64) -> Result<()> {
    if needed == 0 {
        return Ok(());
    }
    match fs2::available_space(root) {
        Ok(available) => require_space(needed, available),
        Err(err) => {
            tracing::debug!(error = %err, "free space query failed; continuing");
            Ok(())
        }
    }
}

/// Backup copies plus the rewritten output: twice the snapshotted bytes.
fn require_space(needed: u64, available: u64) -> Result<()> {
    let required = needed.saturating_mul(2);
    if available < required {
        return Err(MigrateError::InsufficientSpace {
            needed: required,
            available,
        });
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| MigrateError::from_write(e, path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::files::file_sha256;
    use tempfile::tempdir;

    fn project() -> (tempfile::TempDir, ProjectPaths) {
        let dir = tempdir().unwrap();
        let paths = ProjectPaths::new(dir.path());
        (dir, paths)
    }

    #[test]
    fn snapshot_records_sources_and_outputs_with_checksums() {
        let (dir, paths) = project();
        let source = dir.path().join("TIME.md");
        fs::write(&source, "- Issue #42 [2.5h] @alice\n").unwrap();
        write_atomic(&paths.user_file("alice"), b"{}").unwrap();

        let store = BackupStore::new(&paths);
        let manifest = store.snapshot(&[source.clone(), dir.path().join("MISSING.md")]).unwrap();

        assert_eq!(manifest.schema_version, SCHEMA_VERSION);
        let src = manifest.entry("TIME.md").unwrap();
        assert_eq!(src.kind, EntryKind::Source);
        assert_eq!(src.sha256, file_sha256(&source).unwrap());
        let out = manifest.entry(".flowforge/users/alice/time.json").unwrap();
        assert_eq!(out.kind, EntryKind::Output);
        assert!(manifest.entry("MISSING.md").is_none());
        assert!(manifest.dirs.iter().any(|d| d.path == ".flowforge/users/alice"));
    }

    #[test]
    fn restore_reverts_changes_and_removes_new_outputs() {
        let (dir, paths) = project();
        let source = dir.path().join("TIME.md");
        fs::write(&source, "original").unwrap();
        write_atomic(&paths.tasks_file(), b"[]").unwrap();

        let store = BackupStore::new(&paths);
        let manifest = store.snapshot(&[source.clone()]).unwrap();

        fs::write(&source, "changed").unwrap();
        write_atomic(&paths.tasks_file(), b"[1]").unwrap();
        write_atomic(&paths.user_file("bob"), b"{}").unwrap();
        write_atomic(&paths.consolidated_file(), b"{}").unwrap();

        let report = store.restore(&manifest).unwrap();

        assert_eq!(fs::read_to_string(&source).unwrap(), "original");
        assert_eq!(fs::read_to_string(paths.tasks_file()).unwrap(), "[]");
        assert!(!paths.user_file("bob").exists());
        assert!(!paths.user_dir("bob").exists());
        assert!(!paths.consolidated_file().exists());
        assert_eq!(report.files_restored, 2);
        assert_eq!(report.checksums_verified, 2);
        assert_eq!(report.files_removed, 2);
    }

    #[test]
    fn restore_refuses_tampered_backup() {
        let (dir, paths) = project();
        let source = dir.path().join("TIME.md");
        fs::write(&source, "original").unwrap();
        let store = BackupStore::new(&paths);
        let manifest = store.snapshot(&[source.clone()]).unwrap();

        let copy = paths
            .backups_dir()
            .join(&manifest.backup_id)
            .join(FILES_DIR)
            .join("TIME.md");
        fs::write(copy, "tampered").unwrap();
        fs::write(&source, "changed").unwrap();

        let err = store.restore(&manifest).unwrap_err();
        assert_eq!(err.code(), "backup_damaged");
        assert_eq!(fs::read_to_string(&source).unwrap(), "changed");
    }

    #[test]
    fn latest_picks_newest_and_load_rejects_unknown_ids() {
        let (dir, paths) = project();
        let source = dir.path().join("TIME.md");
        fs::write(&source, "x").unwrap();
        let store = BackupStore::new(&paths);
        assert!(matches!(store.latest().unwrap_err(), MigrateError::NoBackups));

        let first = store.snapshot(&[source.clone()]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.snapshot(&[source.clone()]).unwrap();

        assert_eq!(store.latest().unwrap().backup_id, second.backup_id);
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.load(&first.backup_id).unwrap(), first);
        assert!(matches!(
            store.load("../nope").unwrap_err(),
            MigrateError::BackupNotFound(_)
        ));
    }

    #[test]
    fn snapshot_refuses_sources_outside_the_root() {
        let (_dir, paths) = project();
        let outside = tempdir().unwrap();
        let source = outside.path().join("TIME.md");
        fs::write(&source, "- Issue #42 [1h] @alice\n").unwrap();

        let err = BackupStore::new(&paths).snapshot(&[source]).unwrap_err();
        assert_eq!(err.code(), "invalid_config");
        assert!(err.to_string().contains("outside the project root"));
        assert!(!paths.backups_dir().exists());
    }

    #[test]
    fn free_space_must_cover_twice_the_snapshot() {
        require_space(100, 200).unwrap();
        let err = require_space(100, 199).unwrap_err();
        assert_eq!(err.code(), "insufficient_space");
        assert!(matches!(
            err,
            MigrateError::InsufficientSpace {
                needed: 200,
                available: 199
            }
        ));
        assert!(require_space(u64::MAX, u64::MAX - 1).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn restore_reapplies_private_directory_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, paths) = project();
        let user_dir = paths.user_dir("alice");
        write_atomic(&paths.user_file("alice"), b"{}").unwrap();
        fs::set_permissions(&user_dir, fs::Permissions::from_mode(0o700)).unwrap();

        let store = BackupStore::new(&paths);
        let manifest = store.snapshot(&[]).unwrap();
        fs::set_permissions(&user_dir, fs::Permissions::from_mode(0o755)).unwrap();

        store.restore(&manifest).unwrap();
        let mode = fs::metadata(&user_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
