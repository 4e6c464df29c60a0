//! Repository metadata store consumed by the janitor.

mod sqlite;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::types::RepoName;

pub use sqlite::{RepoRecord, SqliteRepoStore};

/// Errors returned by a metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode corruption log: {0}")]
    Json(#[from] serde_json::Error),
}

/// Clone state of a repository on a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    NotCloned,
    Cloning,
    Cloned,
}

impl CloneStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CloneStatus::NotCloned => "not_cloned",
            CloneStatus::Cloning => "cloning",
            CloneStatus::Cloned => "cloned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_cloned" => Some(CloneStatus::NotCloned),
            "cloning" => Some(CloneStatus::Cloning),
            "cloned" => Some(CloneStatus::Cloned),
            _ => None,
        }
    }
}

impl fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the janitor needs from the repository metadata store.
pub trait RepoStore: Send + Sync {
    /// Records that `name` was found corrupt on `shard_id`.
    fn log_corruption(&self, name: &RepoName, reason: &str, shard_id: &str)
    -> Result<(), MetadataError>;

    /// Returns whether the store knows about `name`.
    fn get_by_name(&self, name: &RepoName) -> Result<bool, MetadataError>;

    fn set_clone_status(
        &self,
        name: &RepoName,
        status: CloneStatus,
        shard_id: &str,
    ) -> Result<(), MetadataError>;

    /// Stores on-disk sizes for many repositories at once. Returns the
    /// number of rows updated.
    fn update_repo_sizes(
        &self,
        shard_id: &str,
        sizes: &BTreeMap<RepoName, u64>,
    ) -> Result<usize, MetadataError>;
}
