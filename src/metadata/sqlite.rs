//! SQLite-backed repository metadata.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::{CloneStatus, MetadataError, RepoStore};
use crate::types::RepoName;

/// How many corruption events are kept per repository.
const MAX_CORRUPTION_LOGS: usize = 10;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptionLogEntry {
    pub timestamp: i64,
    pub reason: String,
}

/// Row of the `repos` table.
#[derive(Debug, Clone, Serialize)]
pub struct RepoRecord {
    pub name: String,
    pub shard_id: String,
    pub clone_status: Option<CloneStatus>,
    pub corrupted_at: Option<i64>,
    pub corruption_log: Vec<CorruptionLogEntry>,
    pub repo_size_bytes: Option<u64>,
}

/// Metadata store in a single sqlite file.
pub struct SqliteRepoStore {
    conn: Mutex<Connection>,
}

impl SqliteRepoStore {
    /// Open or create the database at `path` and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent() {
            // Connection::open reports a missing parent as an opaque error.
            let _ = std::fs::create_dir_all(parent);
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, MetadataError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), MetadataError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS repos (
                name TEXT PRIMARY KEY,
                shard_id TEXT NOT NULL DEFAULT '',
                clone_status TEXT,
                corrupted_at INTEGER,
                corruption_log TEXT NOT NULL DEFAULT '[]',
                repo_size_bytes INTEGER,
                updated_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_repos_shard ON repos(shard_id);
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a repository so the janitor treats it as known.
    #[cfg(test)]
    pub fn insert_repo(&self, name: &RepoName, shard_id: &str) -> Result<(), MetadataError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO repos (name, shard_id, updated_at) VALUES (?1, ?2, ?3)",
            params![name.as_str(), shard_id, now_unix()],
        )?;
        Ok(())
    }

    pub fn get(&self, name: &RepoName) -> Result<Option<RepoRecord>, MetadataError> {
        let row = self
            .conn()
            .query_row(
                "SELECT name, shard_id, clone_status, corrupted_at, corruption_log, repo_size_bytes
                 FROM repos WHERE name = ?1",
                params![name.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((name, shard_id, status, corrupted_at, log, size)) = row else {
            return Ok(None);
        };

        Ok(Some(RepoRecord {
            name,
            shard_id,
            clone_status: status.as_deref().and_then(CloneStatus::parse),
            corrupted_at,
            corruption_log: serde_json::from_str(&log)?,
            repo_size_bytes: size.map(|v| v as u64),
        }))
    }
}

impl RepoStore for SqliteRepoStore {
    fn log_corruption(
        &self,
        name: &RepoName,
        reason: &str,
        shard_id: &str,
    ) -> Result<(), MetadataError> {
        let now = now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO repos (name, shard_id, updated_at) VALUES (?1, ?2, ?3)",
            params![name.as_str(), shard_id, now],
        )?;
        let raw: String = tx.query_row(
            "SELECT corruption_log FROM repos WHERE name = ?1",
            params![name.as_str()],
            |row| row.get(0),
        )?;

        let mut log: Vec<CorruptionLogEntry> = serde_json::from_str(&raw).unwrap_or_default();
        log.push(CorruptionLogEntry {
            timestamp: now,
            reason: reason.to_string(),
        });
        if log.len() > MAX_CORRUPTION_LOGS {
            log.drain(..log.len() - MAX_CORRUPTION_LOGS);
        }

        tx.execute(
            "UPDATE repos SET corrupted_at = ?2, corruption_log = ?3, shard_id = ?4, updated_at = ?2
             WHERE name = ?1",
            params![name.as_str(), now, serde_json::to_string(&log)?, shard_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_by_name(&self, name: &RepoName) -> Result<bool, MetadataError> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM repos WHERE name = ?1",
                params![name.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_clone_status(
        &self,
        name: &RepoName,
        status: CloneStatus,
        shard_id: &str,
    ) -> Result<(), MetadataError> {
        // A fresh clone clears earlier corruption.
        let clear_corruption = status == CloneStatus::Cloned;
        self.conn().execute(
            "INSERT INTO repos (name, shard_id, clone_status, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                shard_id = excluded.shard_id,
                clone_status = excluded.clone_status,
                corrupted_at = CASE WHEN ?5 THEN NULL ELSE corrupted_at END,
                updated_at = excluded.updated_at",
            params![
                name.as_str(),
                shard_id,
                status.as_str(),
                now_unix(),
                clear_corruption
            ],
        )?;
        Ok(())
    }

    fn update_repo_sizes(
        &self,
        shard_id: &str,
        sizes: &BTreeMap<RepoName, u64>,
    ) -> Result<usize, MetadataError> {
        let now = now_unix();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE repos SET repo_size_bytes = ?2, shard_id = ?3, updated_at = ?4
                 WHERE name = ?1",
            )?;
            for (name, size) in sizes {
                updated += stmt.execute(params![name.as_str(), *size as i64, shard_id, now])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }
}
