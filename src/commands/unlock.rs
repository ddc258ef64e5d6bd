use std::path::Path;

use crate::error::Result;
use crate::output::{Format, print_lock_removed};
use crate::store::lock;
use crate::store::paths::ProjectPaths;

/// Remove an abandoned migration lock. Without `force`, a lock whose owner
/// still holds it is left alone.
pub fn run(root: &Path, force: bool, format: Format) -> Result<()> {
    let paths = ProjectPaths::new(root);
    let status = lock::remove_stale(&paths.lock_file(), force)?;
    print_lock_removed(&status, format)
}
