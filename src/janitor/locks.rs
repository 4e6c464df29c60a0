//! Removal of lock files left behind by crashed git processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use super::{Outcome, Pass, StageError};
use crate::repos::{GC_LOCK_FILE, GitDir};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Fixed lock files and how long each may be held.
const LOCKS: &[(&str, Duration)] = &[
    ("config.lock", MINUTE),
    ("packed-refs.lock", HOUR),
    ("objects/info/commit-graph.lock", HOUR),
];

/// Ref locks anywhere under refs/.
const REF_LOCK_MAX_AGE: Duration = HOUR;

const GC_LOCK_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Removes `path` if its mtime is more than `max_age` ago.
/// Returns whether the file was removed; a missing file is not an error.
pub fn remove_file_older_than(path: &Path, max_age: Duration) -> io::Result<bool> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age <= max_age {
        return Ok(false);
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn lock_error(path: impl Into<PathBuf>, source: io::Error) -> StageError {
    StageError::Lock {
        path: path.into(),
        source,
    }
}

/// Checks every known lock independently and collects the failures.
pub fn remove_stale_locks(dir: &GitDir) -> Result<(), StageError> {
    let mut errors = Vec::new();

    for (rel, max_age) in LOCKS {
        match remove_file_older_than(&dir.path(rel), *max_age) {
            Ok(true) => log::debug!("locks: removed stale {} in {}", rel, dir),
            Ok(false) => {}
            Err(err) => errors.push(lock_error(rel, err)),
        }
    }

    let ref_locks = WalkDir::new(dir.path("refs"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "lock"));
    for entry in ref_locks {
        match remove_file_older_than(entry.path(), REF_LOCK_MAX_AGE) {
            Ok(true) => log::debug!("locks: removed stale {}", entry.path().display()),
            Ok(false) => {}
            Err(err) => {
                let rel = entry.path().strip_prefix(dir.as_path()).unwrap_or(entry.path());
                errors.push(lock_error(rel, err));
            }
        }
    }

    match remove_file_older_than(&dir.path(GC_LOCK_FILE), GC_LOCK_MAX_AGE) {
        Ok(true) => log::warn!(
            "locks: removed stale {} in {}, a gc process probably died",
            GC_LOCK_FILE,
            dir
        ),
        Ok(false) => {}
        Err(err) => errors.push(lock_error(GC_LOCK_FILE, err)),
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(StageError::Multiple(errors)),
    }
}

pub(super) fn remove_stale_locks_stage(_pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    Outcome::from_result(remove_stale_locks(dir))
}
