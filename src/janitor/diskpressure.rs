//! Least recently used eviction when the disk runs low.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use thiserror::Error;

use crate::metrics;
use crate::repos::{
    RemoveError, ReposDir, StatusUpdate, dir_size, find_git_dirs, remove_repo_directory,
};

/// Reports capacity of the filesystem holding a path.
pub trait DiskSizer: Send + Sync {
    fn bytes_free_on_disk(&self, path: &Path) -> io::Result<u64>;
    fn disk_size_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`DiskSizer`] backed by statvfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatDiskSizer;

impl DiskSizer for StatDiskSizer {
    fn bytes_free_on_disk(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    fn disk_size_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }
}

#[derive(Debug, Error)]
pub enum FreeSpaceError {
    #[error("failed to compute disk usage: {0}")]
    DiskSize(#[source] io::Error),
    #[error(transparent)]
    Remove(#[from] RemoveError),
    #[error("only freed {freed} bytes, wanted to free {wanted}")]
    Insufficient { freed: u64, wanted: u64 },
    #[error("cancelled after freeing {freed} bytes")]
    Cancelled { freed: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreedSpace {
    pub bytes_freed: u64,
    pub repos_removed: usize,
}

/// Bytes to delete to reach `desired_percent_free`; 0 when already there.
pub fn how_many_bytes_to_free(
    repos: &ReposDir,
    sizer: &dyn DiskSizer,
    desired_percent_free: u8,
) -> Result<u64, FreeSpaceError> {
    let root = repos.root();
    let free = sizer
        .bytes_free_on_disk(root)
        .map_err(FreeSpaceError::DiskSize)?;
    let size = sizer
        .disk_size_bytes(root)
        .map_err(FreeSpaceError::DiskSize)?;

    let desired = (f64::from(desired_percent_free) / 100.0 * size as f64) as u64;
    let to_free = desired.saturating_sub(free);
    log::debug!(
        "free-space: {} bytes free of {}, want {} free, need to free {}",
        free,
        size,
        desired,
        to_free
    );
    Ok(to_free)
}

/// Removes repositories, least recently used first, until `bytes_to_free`
/// bytes are gone. HEAD's mtime is the last-used time.
pub fn free_up_space(
    repos: &ReposDir,
    sizer: &dyn DiskSizer,
    update: StatusUpdate<'_>,
    bytes_to_free: u64,
    shutdown: &AtomicBool,
) -> Result<FreedSpace, FreeSpaceError> {
    let mut freed = FreedSpace::default();
    if bytes_to_free == 0 {
        return Ok(freed);
    }

    let mut dirs = find_git_dirs(repos)
        .into_iter()
        .map(|dir| {
            let used = fs::metadata(dir.path("HEAD"))
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (used, dir)
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    for (_, dir) in dirs {
        if freed.bytes_freed >= bytes_to_free {
            break;
        }
        if shutdown.load(Ordering::SeqCst) {
            return Err(FreeSpaceError::Cancelled {
                freed: freed.bytes_freed,
            });
        }

        let size = dir_size(dir.as_path());
        remove_repo_directory(repos, &dir, Some(update))?;
        freed.bytes_freed = freed.bytes_freed.saturating_add(size);
        freed.repos_removed += 1;
        metrics::REPOS_REMOVED_DISK_PRESSURE.inc();

        let free_now = sizer.bytes_free_on_disk(repos.root()).unwrap_or_default();
        log::info!(
            "free-space: removed least recently used {} ({} bytes), {} bytes free",
            dir,
            size,
            free_now
        );
    }

    if freed.bytes_freed < bytes_to_free {
        return Err(FreeSpaceError::Insufficient {
            freed: freed.bytes_freed,
            wanted: bytes_to_free,
        });
    }
    Ok(freed)
}
