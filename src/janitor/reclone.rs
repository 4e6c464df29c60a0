//! Re-clone scheduling.
//!
//! A repository is re-cloned when it was marked maybe corrupt, when it is
//! older than [`REPO_TTL`], when git gc keeps failing, or when maintenance
//! has failed more often than allowed. Ages are jittered per repository so
//! repositories cloned together are not all re-cloned together.

use std::fmt;
use std::fs;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::maintenance::{FAILURE_LOG_FILE, parse_failed_count};
use super::{Outcome, Pass};
use crate::clone::CloneOptions;
use crate::config::MaintenanceConfig;
use crate::metrics;
use crate::repos::{
    GitDir, GitError, MAYBE_CORRUPT_KEY, RECLONE_TIMESTAMP_KEY, REPO_TYPE_KEY, config_get,
    config_set, config_unset,
};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Age after which a repository is re-cloned.
pub const REPO_TTL: Duration = Duration::from_secs(45 * 24 * 60 * 60);

/// Age after which a repository with a failing git gc is re-cloned.
pub const REPO_TTL_GC: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Written by git when a detached auto gc fails.
const GC_LOG_FILE: &str = "gc.log";

/// Converted depots are expensive to rebuild.
const PERFORCE_TYPE: &str = "perforce";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic offset in `[0, d)` derived from `key` with 64-bit FNV-1.
pub fn jitter(key: &str, d: Duration) -> Duration {
    let d = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
    if d <= 0 {
        return Duration::ZERO;
    }

    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u64::from(byte);
    }

    let mut r = hash as i64;
    if r < 0 {
        r = -(r + 1);
    }
    Duration::from_nanos((r % d) as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecloneReason {
    MaybeCorrupt,
    Old,
    /// Contents of gc.log.
    GcFailure(String),
    /// Failure count and contents of the maintenance failure log.
    MaintenanceFailures(i64, String),
}

impl fmt::Display for RecloneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecloneReason::MaybeCorrupt => f.write_str("maybe corrupt"),
            RecloneReason::Old => f.write_str("old"),
            RecloneReason::GcFailure(log) => write!(f, "git gc failed: {}", log),
            RecloneReason::MaintenanceFailures(count, log) => {
                write!(f, "maintenance failed {} times: {}", count, log)
            }
        }
    }
}

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn to_unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn set_reclone_time(dir: &GitDir, time: SystemTime) -> Result<(), GitError> {
    config_set(dir, RECLONE_TIMESTAMP_KEY, &to_unix(time).to_string())
}

/// Last (re-)clone time of `dir`. A missing or unreadable value is reset to
/// `now`, so a repository is first aged from when the janitor first saw it.
pub fn reclone_time(dir: &GitDir, now: SystemTime) -> Result<SystemTime, GitError> {
    let value = config_get(dir, RECLONE_TIMESTAMP_KEY)?;
    match value.as_deref().map(str::trim).map(str::parse::<u64>) {
        Some(Ok(secs)) => Ok(from_unix(secs)),
        Some(Err(_)) => {
            log::warn!(
                "reclone: invalid {} in {}, resetting",
                RECLONE_TIMESTAMP_KEY,
                dir
            );
            set_reclone_time(dir, now)?;
            Ok(now)
        }
        None => {
            set_reclone_time(dir, now)?;
            Ok(now)
        }
    }
}

/// Trimmed contents of `path`, None if missing or blank.
fn read_nonempty(path: &std::path::Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(body) => {
            let body = body.trim();
            Ok((!body.is_empty()).then(|| body.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decides whether `dir` should be re-cloned. Later reasons take precedence.
/// Reading the maybe-corrupt marker clears it.
pub fn reclone_reason(
    dir: &GitDir,
    config: &MaintenanceConfig,
    recloned_at: SystemTime,
    now: SystemTime,
) -> Result<Option<RecloneReason>, GitError> {
    let mut reason = None;

    if config_get(dir, MAYBE_CORRUPT_KEY)?.is_some() {
        reason = Some(RecloneReason::MaybeCorrupt);
        // A fresh clone sets the marker again if it is still corrupt.
        if let Err(err) = config_unset(dir, MAYBE_CORRUPT_KEY) {
            log::warn!("reclone: failed to clear maybe corrupt marker in {}: {}", dir, err);
        }
    }

    let perforce = config_get(dir, REPO_TYPE_KEY)?.as_deref() == Some(PERFORCE_TYPE);
    let since = now.duration_since(recloned_at).unwrap_or(Duration::ZERO);
    let key = dir.to_string();

    if !perforce {
        if since > REPO_TTL + jitter(&key, REPO_TTL / 4) {
            reason = Some(RecloneReason::Old);
        }
        if since > REPO_TTL_GC + jitter(&key, REPO_TTL_GC / 4) {
            if let Some(gc_log) = read_nonempty(&dir.path(GC_LOG_FILE))? {
                reason = Some(RecloneReason::GcFailure(gc_log));
            }
        }
    }

    if config.maintenance_retries >= 0 {
        if let Some(log) = read_nonempty(&dir.path(FAILURE_LOG_FILE))? {
            let failed = parse_failed_count(&log);
            if failed > config.maintenance_retries {
                reason = Some(RecloneReason::MaintenanceFailures(failed, log));
            }
        }
    }

    Ok(reason)
}

/// Stage: re-clones the repository if [`reclone_reason`] says so.
pub(super) fn maybe_reclone(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    let now = SystemTime::now();
    let recloned_at = match reclone_time(dir, now) {
        Ok(t) => t,
        Err(err) => return Outcome::failed(err),
    };
    let reason = match reclone_reason(dir, pass.config(), recloned_at, now) {
        Ok(Some(reason)) => reason,
        Ok(None) => return Outcome::next(),
        Err(err) => return Outcome::failed(err),
    };

    let name = pass.name_for(dir);
    log::info!("reclone: re-cloning {} ({})", name, reason);

    // Move the clock halfway to now first, so a failing clone is retried
    // less and less often.
    let since = now.duration_since(recloned_at).unwrap_or(Duration::ZERO);
    if let Err(err) = set_reclone_time(dir, recloned_at + since / 2) {
        return Outcome::failed(err);
    }

    let opts = CloneOptions {
        block: true,
        overwrite: true,
    };
    match pass.janitor.cloner.clone_repo(&name, opts) {
        Ok(progress) => {
            log::debug!("reclone: {}: {}", name, progress);
            metrics::REPOS_RECLONED.inc();
            pass.report.recloned += 1;
            Outcome::handled()
        }
        Err(err) => Outcome::failed(err),
    }
}
