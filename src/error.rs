use thiserror::Error;

/// Broad failure classes. Each class has a fixed propagation policy in the
/// orchestrator: corruption and operational errors abort before any canonical
/// write, discrepancies are reported after a write, transient errors either
/// degrade (lookups) or abort immediately (lock contention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Corruption,
    Discrepancy,
    Transient,
    Operational,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corruption => write!(f, "corruption"),
            Self::Discrepancy => write!(f, "discrepancy"),
            Self::Transient => write!(f, "transient"),
            Self::Operational => write!(f, "operational"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("corrupted source {source_name}{}: {reason}", line_suffix(.line))]
    Corrupted {
        source_name: String,
        line: Option<usize>,
        reason: String,
    },

    #[error("migration locked by another process: {0}")]
    Locked(String),

    #[error("lock at {0} is still held by a live process; pass --force to remove it anyway")]
    LockStillHeld(String),

    #[error("no migration lock present")]
    NotLocked,

    #[error(
        "insufficient disk space: snapshot needs {needed} bytes but only {available} are available (free space or move the project)"
    )]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("permission denied writing {0} (check ownership and write permission on the project directory)")]
    PermissionDenied(String),

    #[error("required file missing: {0}")]
    MissingFile(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backup '{0}' not found")]
    BackupNotFound(String),

    #[error("no backups available to roll back to")]
    NoBackups,

    #[error("backup '{backup_id}' is damaged: {reason}")]
    BackupDamaged { backup_id: String, reason: String },

    #[error(
        "an unfinished migration checkpoint exists (batch {completed}/{total}); run `migrate resume` or pass --restart"
    )]
    PendingCheckpoint { completed: usize, total: usize },

    #[error("source documents changed since checkpoint was written; run `migrate execute --restart`")]
    CheckpointMismatch,

    #[error("post-migration validation failed: {failed} of {total} checks failed")]
    ValidationFailed { failed: usize, total: usize },

    #[error("migration failed and was rolled back to backup '{backup_id}': {cause}")]
    RolledBack { backup_id: String, cause: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MigrateError {
    pub fn corrupted(
        source_name: impl Into<String>,
        line: Option<usize>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Corrupted {
            source_name: source_name.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Corrupted { .. } => "corrupted_source",
            Self::Locked(_) => "locked",
            Self::LockStillHeld(_) => "lock_still_held",
            Self::NotLocked => "not_locked",
            Self::InsufficientSpace { .. } => "insufficient_space",
            Self::PermissionDenied(_) => "permission_denied",
            Self::MissingFile(_) => "missing_file",
            Self::InvalidConfig(_) => "invalid_config",
            Self::BackupNotFound(_) => "backup_not_found",
            Self::NoBackups => "no_backups",
            Self::BackupDamaged { .. } => "backup_damaged",
            Self::PendingCheckpoint { .. } => "pending_checkpoint",
            Self::CheckpointMismatch => "checkpoint_mismatch",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::RolledBack { .. } => "rolled_back",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Corrupted { .. } => ErrorKind::Corruption,
            Self::ValidationFailed { .. } => ErrorKind::Discrepancy,
            Self::Locked(_) | Self::LockStillHeld(_) => ErrorKind::Transient,
            _ => ErrorKind::Operational,
        }
    }

    /// Process exit code for the CLI. Scripts can distinguish corruption,
    /// failed validation, and lock contention without parsing messages.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Corrupted { .. } => 2,
            Self::ValidationFailed { .. } => 3,
            Self::Locked(_) | Self::LockStillHeld(_) => 4,
            _ => 1,
        }
    }

    /// Map an io error raised while writing `path`, so permission problems
    /// carry the offending path instead of a bare errno.
    pub fn from_write(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path.display().to_string())
        } else {
            Self::Io(err)
        }
    }
}

fn line_suffix(line: &Option<usize>) -> String {
    line.map(|l| format!(" (line {l})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, MigrateError>;
