//! Clone callback used to re-clone repositories.

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::metadata::{CloneStatus, RepoStore};
use crate::repos::{
    GitCli, GitDir, GitError, RECLONE_TIMESTAMP_KEY, RemoveError, ReposDir, config_get,
    config_set, remove_repo_directory,
};
use crate::types::RepoName;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneOptions {
    /// Wait for the clone to finish before returning.
    pub block: bool,
    /// Replace an existing repository.
    pub overwrite: bool,
}

/// Errors returned by a clone.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("repository {0} already exists")]
    AlreadyExists(RepoName),
    #[error("repository {0} has no remote.origin.url")]
    NoRemote(RepoName),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Remove(#[from] RemoveError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Clones a repository into the store, returning a progress summary.
pub trait Cloner: Send + Sync {
    fn clone_repo(&self, name: &RepoName, opts: CloneOptions) -> Result<String, CloneError>;
}

impl<F> Cloner for F
where
    F: Fn(&RepoName, CloneOptions) -> Result<String, CloneError> + Send + Sync,
{
    fn clone_repo(&self, name: &RepoName, opts: CloneOptions) -> Result<String, CloneError> {
        self(name, opts)
    }
}

/// Re-clones a repository from its own `remote.origin.url`.
///
/// The clone lands in scratch space first and only replaces the existing
/// repository once it has succeeded, so a failed clone leaves the old copy
/// in place. Always runs synchronously.
pub struct GitCloner {
    repos: ReposDir,
    git: GitCli,
    status: Option<(Arc<dyn RepoStore>, String)>,
}

impl GitCloner {
    pub fn new(repos: ReposDir) -> Self {
        Self {
            repos,
            git: GitCli::new(),
            status: None,
        }
    }

    /// Record clone progress in `store` under `shard_id`.
    pub fn with_status(mut self, store: Arc<dyn RepoStore>, shard_id: impl Into<String>) -> Self {
        self.status = Some((store, shard_id.into()));
        self
    }

    fn set_status(&self, name: &RepoName, status: CloneStatus) {
        if let Some((store, shard_id)) = &self.status {
            if let Err(err) = store.set_clone_status(name, status, shard_id) {
                log::warn!("clone: failed to set status {} for {}: {}", status, name, err);
            }
        }
    }
}

impl Cloner for GitCloner {
    fn clone_repo(&self, name: &RepoName, opts: CloneOptions) -> Result<String, CloneError> {
        let dir = self.repos.dir_for(name);
        if dir.as_path().exists() && !opts.overwrite {
            return Err(CloneError::AlreadyExists(name.clone()));
        }
        if !opts.block {
            log::debug!("clone: cloning {} synchronously", name);
        }

        let url = match config_get(&dir, "remote.origin.url") {
            Ok(Some(url)) => url,
            Ok(None) | Err(_) => return Err(CloneError::NoRemote(name.clone())),
        };

        self.set_status(name, CloneStatus::Cloning);

        let staging = self.repos.temp_dir("clone-")?;
        let staged = GitDir::new(staging.join(".git"));

        let result = self
            .git
            .clone_mirror(&url, staged.as_path())
            .map_err(CloneError::from)
            .and_then(|()| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                config_set(&staged, RECLONE_TIMESTAMP_KEY, &now.to_string())?;
                Ok(())
            });

        if let Err(err) = result {
            let _ = fs::remove_dir_all(&staging);
            self.set_status(name, CloneStatus::NotCloned);
            return Err(err);
        }

        remove_repo_directory(&self.repos, &dir, None)?;
        let repo_dir = dir.repo_dir();
        if let Some(parent) = repo_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, repo_dir)?;

        self.set_status(name, CloneStatus::Cloned);
        Ok(format!("cloned {} from {}", name, url))
    }
}
