use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};
use crate::store::files::ensure_dir;

/// Owner record written into the lock file for diagnosing abandoned locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub command: String,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} running `{}` since {}",
            self.pid,
            self.command,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Exclusive per-project migration lock.
///
/// The lock file's existence is the mutual-exclusion primitive (created with
/// `create_new`). While held, the file also carries an OS advisory lock, which
/// the kernel drops when the owner dies; `inspect` uses that to tell a live
/// owner from an abandoned file. The lock is released (file removed) on drop.
#[derive(Debug)]
pub struct MigrationLock {
    file: Option<File>,
    path: PathBuf,
}

impl MigrationLock {
    pub fn acquire(path: &Path, command: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = read_owner(path)
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "unknown owner".into());
                return Err(MigrateError::Locked(format!(
                    "{} ({owner}); if that process is gone run `timeport unlock`",
                    path.display()
                )));
            }
            Err(err) => return Err(MigrateError::from_write(err, path)),
        };

        if file.try_lock_exclusive().is_err() {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(MigrateError::Locked(path.display().to_string()));
        }

        let owner = LockOwner {
            pid: std::process::id(),
            command: command.to_string(),
            acquired_at: Utc::now(),
        };
        let write_owner = serde_json::to_vec_pretty(&owner)
            .map_err(MigrateError::from)
            .and_then(|json| {
                file.write_all(&json)?;
                file.sync_all()?;
                Ok(())
            });
        let lock = Self {
            file: Some(file),
            path: path.to_path_buf(),
        };
        write_owner?;

        tracing::debug!(path = %path.display(), pid = owner.pid, "migration lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly (normally handled by Drop).
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let removed = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&file);
        drop(file);
        match removed {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release migration lock");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub path: String,
    pub owner: Option<LockOwner>,
    /// True when a live process still holds the advisory lock.
    pub held: bool,
}

/// Describe the lock at `path`, or `None` when no lock file exists.
pub fn inspect(path: &Path) -> Result<Option<LockStatus>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let held = match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    };
    Ok(Some(LockStatus {
        path: path.display().to_string(),
        owner: read_owner(path),
        held,
    }))
}

/// Operator override for abandoned locks. There is no age-based expiry: a
/// lock is only removed here, and only when its owner no longer holds it
/// unless `force` is set.
pub fn remove_stale(path: &Path, force: bool) -> Result<LockStatus> {
    let Some(status) = inspect(path)? else {
        return Err(MigrateError::NotLocked);
    };
    if status.held && !force {
        return Err(MigrateError::LockStillHeld(path.display().to_string()));
    }
    fs::remove_file(path).map_err(|e| MigrateError::from_write(e, path))?;
    tracing::warn!(path = %path.display(), forced = force, "removed migration lock");
    Ok(status)
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("migration.lock");

        let lock = MigrationLock::acquire(&lock_path, "execute").unwrap();
        // Lock is held; trying to acquire again should fail
        let err = MigrationLock::acquire(&lock_path, "execute").unwrap_err();
        assert!(matches!(err, MigrateError::Locked(_)));
        assert!(err.to_string().contains("running `execute`"));
        // Release
        lock.release().unwrap();
        assert!(!lock_path.exists());
        // Can acquire again
        let _lock = MigrationLock::acquire(&lock_path, "resume").unwrap();
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("nested").join("migration.lock");
        {
            let _lock = MigrationLock::acquire(&lock_path, "execute").unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn inspect_reports_live_owner() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("migration.lock");
        let _lock = MigrationLock::acquire(&lock_path, "execute").unwrap();

        let status = inspect(&lock_path).unwrap().unwrap();
        assert!(status.held);
        assert_eq!(status.owner.unwrap().pid, std::process::id());

        let err = remove_stale(&lock_path, false).unwrap_err();
        assert!(matches!(err, MigrateError::LockStillHeld(_)));
        assert!(lock_path.exists());
    }

    #[test]
    fn abandoned_lock_file_blocks_until_removed() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("migration.lock");
        // A terminated run leaves its file behind with no advisory lock.
        fs::write(
            &lock_path,
            r#"{"pid": 999999, "command": "execute", "acquired_at": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let err = MigrationLock::acquire(&lock_path, "execute").unwrap_err();
        assert!(err.to_string().contains("pid 999999"));

        let status = remove_stale(&lock_path, false).unwrap();
        assert!(!status.held);
        assert!(!lock_path.exists());
        let _lock = MigrationLock::acquire(&lock_path, "execute").unwrap();
    }

    #[test]
    fn remove_stale_without_lock_is_an_error() {
        let dir = tempdir().unwrap();
        let err = remove_stale(&dir.path().join("migration.lock"), true).unwrap_err();
        assert!(matches!(err, MigrateError::NotLocked));
    }
}
