//! Garbage collection strategies and the maintenance failure log.
//!
//! With [`GcMode::Maintenance`] the janitor runs its own repack script under
//! `gc.pid` so it never overlaps with a `git gc` started elsewhere. Failed
//! runs are counted in `maintenance.log`; the re-clone stage escalates once
//! the count passes the configured retry limit.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use super::heuristics::{self, MaintenanceReason, SKIPPED};
use super::{Outcome, Pass};
use crate::config::{GcMode, MaintenanceConfig};
use crate::metrics;
use crate::repos::{GcLock, GitCli, GitDir, GitError, config_set, config_unset};

/// Failure log kept next to the repository config.
pub const FAILURE_LOG_FILE: &str = "maintenance.log";

const FAILURE_LOG_HEADER: &str = "DO NOT EDIT: generated by git-janitor.\n\
This file records the number of failed maintenance runs and the output of the last one.";

const FAILED_PREFIX: &str = "failed=";

/// Only the tail of the script output is kept in the log.
const MAX_LOGGED_OUTPUT: usize = 64 * 1024;

const MAINTENANCE_SCRIPT: &str = include_str!("maintenance.sh");

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to inspect repository: {0}")]
    Check(#[source] io::Error),
    #[error("failed to acquire gc lock: {0}")]
    Lock(#[source] io::Error),
    #[error(transparent)]
    Script(GitError),
    #[error(transparent)]
    Prune(GitError),
    #[error(transparent)]
    Gc(GitError),
    #[error("failed to update gc.auto: {0}")]
    AutoGcConfig(#[source] GitError),
}

impl MaintenanceError {
    /// The git failure behind this error, if it came from a git command.
    pub fn git_error(&self) -> Option<&GitError> {
        match self {
            MaintenanceError::Script(e)
            | MaintenanceError::Prune(e)
            | MaintenanceError::Gc(e)
            | MaintenanceError::AutoGcConfig(e) => Some(e),
            MaintenanceError::Check(_) | MaintenanceError::Lock(_) => None,
        }
    }
}

/// What a maintenance attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// A failure log younger than the expiry exists and nothing else
    /// called for a run.
    RecentFailure,
    /// Nothing needed doing.
    Skipped,
    /// Another process holds gc.pid.
    Locked,
    Ran(MaintenanceReason),
}

/// Reads the counter from a failure log body. The first `failed=` line
/// wins; a malformed value counts as 0.
pub fn parse_failed_count(body: &str) -> i64 {
    let Some(start) = body.find(FAILED_PREFIX) else {
        return 0;
    };
    let rest = &body[start + FAILED_PREFIX.len()..];
    let value = rest.split('\n').next().unwrap_or_default();
    value.trim().parse().unwrap_or(0)
}

/// Failure count recorded for `dir`, 0 when there is no log.
pub fn read_failed_count(dir: &GitDir) -> io::Result<i64> {
    match fs::read_to_string(dir.path(FAILURE_LOG_FILE)) {
        Ok(body) => Ok(parse_failed_count(&body)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Bumps the failure counter and stores the output of the failed run.
fn write_failure_log(dir: &GitDir, output: &str) -> io::Result<()> {
    let failed = read_failed_count(dir)? + 1;

    let mut start = output.len().saturating_sub(MAX_LOGGED_OUTPUT);
    while !output.is_char_boundary(start) {
        start += 1;
    }
    let body = format!(
        "{}\n\n{}{}\n\n{}\n",
        FAILURE_LOG_HEADER,
        FAILED_PREFIX,
        failed,
        &output[start..]
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dir.path(FAILURE_LOG_FILE))?;
    file.write_all(body.as_bytes())
}

fn remove_failure_log(dir: &GitDir) -> io::Result<()> {
    match fs::remove_file(dir.path(FAILURE_LOG_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether a failure log exists that is younger than `expiry`.
fn recent_failure(dir: &GitDir, expiry: Duration) -> io::Result<bool> {
    let modified = match fs::metadata(dir.path(FAILURE_LOG_FILE)) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age < expiry)
}

fn record_status(success: bool, reason: &str) {
    let success = if success { "true" } else { "false" };
    metrics::MAINTENANCE_STATUS
        .with_label_values(&[success, reason])
        .inc();
}

/// Runs the maintenance script if the repository needs it. A failure log
/// younger than the expiry only holds back runs that nothing else asks for.
pub fn run_maintenance(
    git: &GitCli,
    dir: &GitDir,
    config: &MaintenanceConfig,
) -> Result<MaintenanceOutcome, MaintenanceError> {
    let needed =
        match heuristics::needs_maintenance(dir, config.auto_pack_limit, config.loose_objects_limit)
        {
            Ok(needed) => needed,
            Err(err) => {
                record_status(false, "unknown");
                return Err(MaintenanceError::Check(err));
            }
        };

    let recent =
        recent_failure(dir, config.maintenance_log_expiry).map_err(MaintenanceError::Check)?;
    let reason = match needed {
        Some(reason) => {
            if recent {
                log::debug!(
                    "gc: {} failed recently but needs maintenance ({}), retrying",
                    dir,
                    reason.as_str()
                );
            }
            reason
        }
        None if recent => {
            log::debug!("gc: skipping maintenance for {}, it failed recently", dir);
            return Ok(MaintenanceOutcome::RecentFailure);
        }
        None => {
            record_status(true, SKIPPED);
            return Ok(MaintenanceOutcome::Skipped);
        }
    };

    let lock = match GcLock::try_acquire(dir) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            log::info!("gc: {} is locked by another gc process, skipping", dir);
            record_status(true, reason.as_str());
            return Ok(MaintenanceOutcome::Locked);
        }
        Err(err) => {
            record_status(false, reason.as_str());
            return Err(MaintenanceError::Lock(err));
        }
    };

    log::debug!(
        "gc: running maintenance for {} ({}), holding {}",
        dir,
        reason.as_str(),
        lock.path().display()
    );
    let result = git.run_script(dir, MAINTENANCE_SCRIPT);

    let outcome = match result {
        Ok(()) => {
            if let Err(err) = remove_failure_log(dir) {
                log::warn!("gc: failed to remove failure log in {}: {}", dir, err);
            }
            record_status(true, reason.as_str());
            Ok(MaintenanceOutcome::Ran(reason))
        }
        Err(err) => {
            let output = err.stderr().unwrap_or_default();
            if let Err(log_err) = write_failure_log(dir, output) {
                log::warn!("gc: failed to write failure log in {}: {}", dir, log_err);
            }
            record_status(false, reason.as_str());
            Err(MaintenanceError::Script(err))
        }
    };

    if let Err(err) = lock.release() {
        log::warn!("gc: failed to release gc lock in {}: {}", dir, err);
    }
    outcome
}

/// Prunes unreachable loose objects when the estimate is over the limit.
/// Returns whether prune ran.
pub fn prune_if_needed(
    git: &GitCli,
    dir: &GitDir,
    loose_limit: usize,
) -> Result<bool, MaintenanceError> {
    let needed =
        heuristics::too_many_loose_objects(dir, loose_limit).map_err(MaintenanceError::Check)?;
    if !needed {
        metrics::PRUNE_STATUS.with_label_values(&["true", "true"]).inc();
        return Ok(false);
    }

    let result = git.prune_now(dir);
    let success = if result.is_ok() { "true" } else { "false" };
    metrics::PRUNE_STATUS
        .with_label_values(&[success, "false"])
        .inc();
    result.map_err(MaintenanceError::Prune)?;
    Ok(true)
}

/// Sets `gc.auto` so git's own auto gc never runs alongside the janitor's
/// maintenance script.
pub fn set_auto_gc(dir: &GitDir, mode: GcMode) -> Result<(), MaintenanceError> {
    let result = match mode {
        GcMode::GitAutoGc | GcMode::JanitorAutoGc => config_unset(dir, "gc.auto"),
        GcMode::Maintenance => config_set(dir, "gc.auto", "0"),
    };
    result.map_err(MaintenanceError::AutoGcConfig)
}

fn failed(pass: &Pass<'_>, dir: &GitDir, err: MaintenanceError) -> Outcome {
    if let Some(git_err) = err.git_error() {
        pass.flag_corruption(dir, git_err);
    }
    Outcome::failed(err)
}

pub(super) fn auto_gc_config_stage(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    Outcome::from_result(set_auto_gc(dir, pass.config().gc_mode))
}

pub(super) fn garbage_collect_stage(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    match pass.janitor.git.gc_auto(dir) {
        Ok(()) => Outcome::next(),
        Err(err) => failed(pass, dir, MaintenanceError::Gc(err)),
    }
}

pub(super) fn maintenance_stage(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    match run_maintenance(&pass.janitor.git, dir, pass.config()) {
        Ok(_) => Outcome::next(),
        Err(err) => failed(pass, dir, err),
    }
}

pub(super) fn prune_stage(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    match prune_if_needed(&pass.janitor.git, dir, pass.config().loose_objects_limit) {
        Ok(_) => Outcome::next(),
        Err(err) => failed(pass, dir, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::{GC_LOCK_FILE, config_get};
    use crate::testutil::{backdate, commit_empty_tree, git_available, init_bare, write_file};
    use tempfile::tempdir;

    fn config(expiry: Duration) -> MaintenanceConfig {
        MaintenanceConfig {
            gc_mode: GcMode::Maintenance,
            maintenance_log_expiry: expiry,
            ..MaintenanceConfig::default()
        }
    }

    #[test]
    fn parses_failed_count() {
        assert_eq!(parse_failed_count(""), 0);
        assert_eq!(parse_failed_count("header\n\nfailed=3\n\noutput"), 3);
        assert_eq!(parse_failed_count("failed=abc\n"), 0);
        assert_eq!(parse_failed_count("failed=7"), 7);
        assert_eq!(parse_failed_count("failed=2\nfailed=9\n"), 2);
    }

    #[test]
    fn failure_log_counts_up() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");

        assert_eq!(read_failed_count(&dir).unwrap(), 0);
        write_failure_log(&dir, "first").unwrap();
        write_failure_log(&dir, "second").unwrap();

        let body = fs::read_to_string(dir.path(FAILURE_LOG_FILE)).unwrap();
        assert!(body.starts_with("DO NOT EDIT"));
        assert!(body.contains("\nfailed=2\n"));
        assert!(body.contains("second"));
        assert!(!body.contains("first"));
        assert_eq!(read_failed_count(&dir).unwrap(), 2);
    }

    #[test]
    fn recent_failure_skips_run_when_nothing_is_needed() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        write_file(dir.path("objects/pack/pack-a.bitmap"), "x");
        write_file(dir.path("objects/info/commit-graph"), "x");
        write_failure_log(&dir, "boom").unwrap();

        let outcome =
            run_maintenance(&GitCli::new(), &dir, &config(Duration::from_secs(3600))).unwrap();
        assert_eq!(outcome, MaintenanceOutcome::RecentFailure);
        assert_eq!(read_failed_count(&dir).unwrap(), 1);
    }

    #[test]
    fn recent_failure_does_not_block_needed_maintenance() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        commit_empty_tree(&dir);
        write_failure_log(&dir, "boom").unwrap();
        assert_eq!(
            heuristics::needs_maintenance(&dir, 50, 1024).unwrap(),
            Some(MaintenanceReason::Bitmap)
        );

        let outcome =
            run_maintenance(&GitCli::new(), &dir, &config(Duration::from_secs(3600))).unwrap();
        assert_eq!(outcome, MaintenanceOutcome::Ran(MaintenanceReason::Bitmap));
        assert!(!dir.path(FAILURE_LOG_FILE).exists());
    }

    #[test]
    fn held_lock_skips_run() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        write_file(dir.path(GC_LOCK_FILE), "1 elsewhere");

        let outcome =
            run_maintenance(&GitCli::new(), &dir, &config(Duration::from_secs(3600))).unwrap();
        assert_eq!(outcome, MaintenanceOutcome::Locked);
        assert_eq!(
            fs::read_to_string(dir.path(GC_LOCK_FILE)).unwrap(),
            "1 elsewhere"
        );
    }

    #[test]
    fn up_to_date_repo_is_skipped() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        write_file(dir.path("objects/pack/pack-a.bitmap"), "x");
        write_file(dir.path("objects/info/commit-graph"), "x");

        let outcome =
            run_maintenance(&GitCli::new(), &dir, &config(Duration::from_secs(3600))).unwrap();
        assert_eq!(outcome, MaintenanceOutcome::Skipped);
    }

    #[test]
    fn script_runs_and_clears_failure_log() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        commit_empty_tree(&dir);
        write_failure_log(&dir, "old failure").unwrap();
        backdate(dir.path(FAILURE_LOG_FILE), Duration::from_secs(7200));

        let outcome =
            run_maintenance(&GitCli::new(), &dir, &config(Duration::from_secs(3600))).unwrap();
        assert_eq!(outcome, MaintenanceOutcome::Ran(MaintenanceReason::Bitmap));
        assert!(!dir.path(FAILURE_LOG_FILE).exists());
        assert!(!dir.path(GC_LOCK_FILE).exists());
        assert!(dir.path("objects/info/commit-graph").exists());
    }

    #[test]
    fn failed_script_counts_and_releases_lock() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        commit_empty_tree(&dir);
        write_file(dir.path("objects/pack/pack-bad.pack"), "garbage");
        write_file(dir.path("objects/pack/pack-bad.idx"), "garbage");
        let config = config(Duration::from_secs(3600));

        for expected in 1..=2 {
            let err = run_maintenance(&GitCli::new(), &dir, &config).unwrap_err();
            assert!(matches!(err, MaintenanceError::Script(_)));
            assert!(!dir.path(GC_LOCK_FILE).exists());
            assert_eq!(read_failed_count(&dir).unwrap(), expected);
        }
    }

    #[test]
    fn script_error_names_the_script_once() {
        let err = MaintenanceError::Script(GitError::CommandFailed {
            command: "maintenance script".into(),
            status: "exit status: 1".into(),
            stderr: "boom".into(),
        });
        let text = err.to_string();
        assert_eq!(text.matches("maintenance script").count(), 1);
        assert!(text.contains("boom"));
    }

    #[test]
    fn auto_gc_follows_mode() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");

        set_auto_gc(&dir, GcMode::Maintenance).unwrap();
        assert_eq!(config_get(&dir, "gc.auto").unwrap().as_deref(), Some("0"));

        set_auto_gc(&dir, GcMode::JanitorAutoGc).unwrap();
        assert_eq!(config_get(&dir, "gc.auto").unwrap(), None);

        set_auto_gc(&dir, GcMode::GitAutoGc).unwrap();
        assert_eq!(config_get(&dir, "gc.auto").unwrap(), None);
    }

    #[test]
    fn prune_skipped_below_limit() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");

        assert!(!prune_if_needed(&GitCli::new(), &dir, 1024).unwrap());
    }

    #[test]
    fn prune_runs_above_limit() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        write_file(dir.path("objects/17/abcdef"), "not an object");

        assert!(prune_if_needed(&GitCli::new(), &dir, 0).unwrap());
    }
}
