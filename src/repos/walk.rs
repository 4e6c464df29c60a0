//! Best-effort enumeration of repositories under the store root.

use std::convert::Infallible;
use std::path::Path;

use walkdir::WalkDir;

use super::paths::{GitDir, ReposDir};

/// What the walker should do after a visitor returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Stop,
}

/// Calls `visit` once per `.git` directory found under the store root.
///
/// Ignored top-level entries are skipped along with their subtrees, and the
/// walker never descends into a `.git` directory. Errors reading individual
/// entries are swallowed; only errors from `visit` are returned.
pub fn iterate_git_dirs<E>(
    repos: &ReposDir,
    mut visit: impl FnMut(&GitDir) -> Result<WalkControl, E>,
) -> Result<(), E> {
    let mut walker = WalkDir::new(repos.root())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("walk: skipping unreadable entry: {}", err);
                continue;
            }
        };

        if repos.ignore_path(entry.path()) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_dir() || entry.file_name() != ".git" {
            continue;
        }

        let dir = GitDir::new(entry.path());
        walker.skip_current_dir();
        if visit(&dir)? == WalkControl::Stop {
            break;
        }
    }

    Ok(())
}

/// Collects every repository under the store root.
pub fn find_git_dirs(repos: &ReposDir) -> Vec<GitDir> {
    let mut dirs = Vec::new();
    let result = iterate_git_dirs(repos, |dir| -> Result<WalkControl, Infallible> {
        dirs.push(dir.clone());
        Ok(WalkControl::Continue)
    });
    if let Err(never) = result {
        match never {}
    }
    dirs
}

/// Sum of regular file sizes below `path`. Symlinks are not followed and
/// unreadable entries count as zero.
pub fn dir_size(path: impl AsRef<Path>) -> u64 {
    WalkDir::new(path.as_ref())
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .fold(0u64, |total, meta| total.saturating_add(meta.len()))
}
