use std::fs;
use std::path::Path;

use crate::store::canonical::{IGNORE_MARKER, ISOLATION_MARKER, user_dirs};
use crate::store::paths::ProjectPaths;
use crate::validate::{Category, CheckResult, Expected, Severity};

/// Group/other permission bits, or `None` where permissions are not modeled.
#[cfg(unix)]
fn shared_bits(dir: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(dir)
        .ok()
        .map(|m| m.permissions().mode() & 0o077)
}

#[cfg(not(unix))]
fn shared_bits(_dir: &Path) -> Option<u32> {
    None
}

pub fn check(paths: &ProjectPaths, expected: &Expected<'_>) -> CheckResult {
    let mut check = CheckResult::new(Category::Isolation);

    let users = expected.users();
    for user in &users {
        let dir = paths.user_dir(user);
        let subject = Some((*user).to_string());
        if !dir.is_dir() {
            check.report(Severity::Error, subject, "user directory is missing");
            continue;
        }
        for marker in [ISOLATION_MARKER, IGNORE_MARKER] {
            if !dir.join(marker).is_file() {
                check.report(
                    Severity::Error,
                    subject.clone(),
                    format!("isolation marker '{marker}' is missing"),
                );
            }
        }
    }

    // All directories under users/, including ones no session maps to.
    let dirs = user_dirs(paths).unwrap_or_default();
    for (dir, _) in &dirs {
        if let Some(bits) = shared_bits(dir).filter(|b| *b != 0) {
            check.report(
                Severity::Error,
                dir.file_name().map(|n| n.to_string_lossy().into_owned()),
                format!("directory is accessible to group/other (mode bits {bits:03o})"),
            );
        }
    }

    check.detail("users", users.len());
    check.detail("directories", dirs.len());
    check
}
