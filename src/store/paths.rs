use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

/// On-disk layout of one project: legacy inputs live at the root, everything
/// this crate writes lives under `.flowforge/`.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flowforge_dir(&self) -> PathBuf {
        self.root.join(".flowforge")
    }

    pub fn config_file(&self) -> PathBuf {
        self.flowforge_dir().join("migration.yaml")
    }

    pub fn billing_dir(&self) -> PathBuf {
        self.flowforge_dir().join("billing")
    }

    pub fn consolidated_file(&self) -> PathBuf {
        self.billing_dir().join("time-tracking.json")
    }

    pub fn users_dir(&self) -> PathBuf {
        self.flowforge_dir().join("users")
    }

    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.users_dir().join(user_dir_name(user))
    }

    pub fn user_file(&self, user: &str) -> PathBuf {
        self.user_dir(user).join("time.json")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.flowforge_dir().join("tasks.json")
    }

    pub fn milestones_file(&self) -> PathBuf {
        self.flowforge_dir().join("milestones.json")
    }

    pub fn migration_dir(&self) -> PathBuf {
        self.flowforge_dir().join("migration")
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.migration_dir().join("metadata.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.migration_dir().join("migration.lock")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.migration_dir().join("checkpoints")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.migration_dir().join("backups")
    }

    /// Processed batches waiting to be written out as canonical files.
    pub fn staging_dir(&self) -> PathBuf {
        self.migration_dir().join("staging")
    }

    /// Every canonical output location. Rollback treats anything here that is
    /// absent from a snapshot as created by the failed run.
    pub fn canonical_outputs(&self) -> Vec<PathBuf> {
        vec![
            self.consolidated_file(),
            self.users_dir(),
            self.tasks_file(),
            self.milestones_file(),
            self.metadata_file(),
        ]
    }

    /// Repo-relative form with forward slashes, used as manifest keys.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    /// Inverse of [`ProjectPaths::relative`]. Rejects keys that would escape
    /// the project root.
    pub fn resolve_relative(&self, key: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }
}

/// Directory name for a user id. Safe ids are used as-is; anything else is
/// sanitized and suffixed with a hash so two distinct ids never share a
/// directory.
pub fn user_dir_name(user: &str) -> String {
    let safe = !user.is_empty()
        && user != "."
        && user != ".."
        && user
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if safe {
        return user.to_string();
    }

    let sanitized: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(user.as_bytes());
    let suffix: String = format!("{digest:x}").chars().take(8).collect();
    format!("{sanitized}-{suffix}")
}
