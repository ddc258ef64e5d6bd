use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use git2::{Repository, Sort};

use crate::provider::AuthorLookup;
use crate::task_id::TaskId;

/// Commits examined per lookup, newest first.
const MAX_COMMITS: usize = 5_000;

/// Author of the most recent commit whose message references the task
/// (`#42`, not `#420`). Read-only and bounded by `timeout`; any failure or
/// timeout yields `None`.
pub struct GitAuthorLookup {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitAuthorLookup {
    pub fn new(repo_root: &Path, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            timeout,
        }
    }
}

impl AuthorLookup for GitAuthorLookup {
    fn author_for(&self, task: TaskId) -> Option<String> {
        let (tx, rx) = mpsc::channel();
        let root = self.repo_root.clone();
        let spawned = thread::Builder::new()
            .name("blame-lookup".into())
            .spawn(move || {
                let _ = tx.send(most_recent_author(&root, task));
            });
        if spawned.is_err() {
            return None;
        }
        match rx.recv_timeout(self.timeout) {
            Ok(author) => author,
            Err(_) => {
                // The walker thread is left to finish on its own.
                tracing::warn!(task = %task, timeout_ms = self.timeout.as_millis() as u64, "blame lookup timed out");
                None
            }
        }
    }
}

/// Returns None if the root is not inside a git repository, HEAD is unborn,
/// or no commit in range mentions the task.
pub fn most_recent_author(repo_root: &Path, task: TaskId) -> Option<String> {
    let repo = Repository::discover(repo_root).ok()?;
    let mut revwalk = repo.revwalk().ok()?;
    revwalk.push_head().ok()?;
    revwalk.set_sorting(Sort::TIME).ok()?;

    let token = format!("#{}", task.as_u32());
    for oid in revwalk.take(MAX_COMMITS) {
        let Ok(oid) = oid else { continue };
        let Ok(commit) = repo.find_commit(oid) else {
            continue;
        };
        let Some(message) = commit.message() else {
            continue;
        };
        if mentions(message, &token) {
            let author = commit.author();
            return author
                .name()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from);
        }
    }
    None
}

/// True when `token` occurs in `text` and is not followed by another digit.
fn mentions(text: &str, token: &str) -> bool {
    text.match_indices(token).any(|(at, _)| {
        !text[at + token.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}
