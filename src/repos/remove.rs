//! Atomic removal of repositories from the store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::paths::{GitDir, ReposDir};
use crate::metadata::{CloneStatus, RepoStore};

/// Errors returned while removing a repository.
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create scratch directory: {0}")]
    TempDir(#[source] io::Error),
    #[error("failed to move {path} out of the store: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Metadata update applied after a successful removal.
#[derive(Clone, Copy)]
pub struct StatusUpdate<'a> {
    pub store: &'a dyn RepoStore,
    pub shard_id: &'a str,
}

/// Removes the repository containing `dir` from the store.
///
/// The repository directory is first renamed into the scratch area so
/// readers never see a half-deleted repository; the scratch copy is then
/// deleted best-effort. Parents left empty are removed up to the root.
/// A directory that does not exist counts as already removed.
pub fn remove_repo_directory(
    repos: &ReposDir,
    dir: &GitDir,
    update: Option<StatusUpdate<'_>>,
) -> Result<(), RemoveError> {
    let repo_dir = dir.repo_dir();

    match fs::symlink_metadata(repo_dir) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(RemoveError::Stat {
                path: repo_dir.to_path_buf(),
                source,
            });
        }
    }

    let tmp = repos
        .temp_dir("delete-repo-")
        .map_err(RemoveError::TempDir)?;

    if let Err(source) = fs::rename(repo_dir, tmp.join("repo")) {
        let _ = fs::remove_dir(&tmp);
        // Lost a race with another remover.
        if source.kind() == io::ErrorKind::NotFound {
            return Ok(());
        }
        return Err(RemoveError::Rename {
            path: repo_dir.to_path_buf(),
            source,
        });
    }

    if let Some(update) = update {
        let name = repos.name_for(dir);
        if let Err(err) = update
            .store
            .set_clone_status(&name, CloneStatus::NotCloned, update.shard_id)
        {
            log::warn!("remove: failed to update clone status for {}: {}", name, err);
        }
    }

    remove_empty_parents(repos.root(), repo_dir);

    if let Err(err) = fs::remove_dir_all(&tmp) {
        log::warn!("remove: failed to clean up {}: {}", tmp.display(), err);
    }

    Ok(())
}

/// Walks up from `removed` deleting empty parents with a plain `rmdir`,
/// stopping at `root` or the first directory that is not empty.
fn remove_empty_parents(root: &Path, removed: &Path) {
    let mut current = removed.parent();
    while let Some(parent) = current {
        if parent == root || !parent.starts_with(root) {
            break;
        }
        if fs::remove_dir(parent).is_err() {
            break;
        }
        current = parent.parent();
    }
}
