//! Periodic maintenance of the repository store.
//!
//! A run walks every repository and feeds it through an ordered list of
//! stages. A stage either lets the next one run, or marks the repository
//! handled (removed, re-cloned) which ends the pipeline for that repository.
//! Stage errors are logged and counted; they never stop the walk.

mod attributes;
mod corruption;
mod diskpressure;
mod heuristics;
mod locks;
mod maintenance;
mod reclone;
mod scheduler;
mod shard;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::clone::{CloneError, Cloner};
use crate::config::{GcMode, MaintenanceConfig};
use crate::metadata::RepoStore;
use crate::metrics;
use crate::repos::{
    GitCli, GitDir, GitError, RemoveError, ReposDir, StatusUpdate, WalkControl, iterate_git_dirs,
    remove_repo_directory,
};
use crate::types::RepoName;

pub use corruption::check_repo_dir_corrupt;
pub use diskpressure::{DiskSizer, FreeSpaceError, FreedSpace, StatDiskSizer};
pub use heuristics::needs_maintenance;
pub use maintenance::{MaintenanceError, read_failed_count};
pub use scheduler::SchedulerHandle;
pub use shard::{AddressSource, FileAddresses, StaticAddresses, addr_for_repo, hostname_match};

/// Error from one stage for one repository.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Remove(#[from] RemoveError),
    #[error(transparent)]
    Clone(#[from] CloneError),
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A stale lock could not be checked or removed. `path` is relative
    /// to the git dir.
    #[error("failed to remove stale lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Several independent failures, e.g. one per stale lock.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<StageError>),
}

fn join_errors(errors: &[StageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of one stage for one repository.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Skip the remaining stages for this repository.
    pub handled: bool,
    pub error: Option<StageError>,
}

impl Outcome {
    pub fn next() -> Self {
        Self::default()
    }

    pub fn handled() -> Self {
        Self {
            handled: true,
            error: None,
        }
    }

    pub fn failed(err: impl Into<StageError>) -> Self {
        Self {
            handled: false,
            error: Some(err.into()),
        }
    }

    /// Continue to the next stage, reporting `result`'s error if any.
    pub fn from_result<E: Into<StageError>>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::next(),
            Err(err) => Self::failed(err),
        }
    }

    fn handled_with(err: impl Into<StageError>) -> Self {
        Self {
            handled: true,
            error: Some(err.into()),
        }
    }
}

type StageFn = fn(&mut Pass<'_>, &GitDir) -> Outcome;

/// A named step of the per-repository pipeline.
#[derive(Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    run: StageFn,
}

/// Summary of one janitor run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub repos_visited: usize,
    /// Repositories removed, by reason.
    pub removed: BTreeMap<String, usize>,
    pub recloned: usize,
    pub wrong_shard_repos: usize,
    pub wrong_shard_bytes: u64,
    pub wrong_shard_deleted: usize,
    pub stage_errors: usize,
    pub total_bytes: u64,
    /// Bytes freed by the disk pressure pass.
    pub freed_bytes: u64,
    pub cancelled: bool,
}

impl RunReport {
    fn count_removed(&mut self, reason: &str) {
        *self.removed.entry(reason.to_string()).or_default() += 1;
    }
}

/// State shared by the stages during one walk.
struct Pass<'a> {
    janitor: &'a Janitor,
    /// Shard addresses for this run, None if they could not be resolved.
    addresses: Option<Vec<String>>,
    /// Whether this shard appears in `addresses`.
    known_shard: bool,
    sizes: BTreeMap<RepoName, u64>,
    report: RunReport,
}

impl Pass<'_> {
    fn config(&self) -> &MaintenanceConfig {
        &self.janitor.config
    }

    fn name_for(&self, dir: &GitDir) -> RepoName {
        self.janitor.repos.name_for(dir)
    }

    fn remove(&self, dir: &GitDir, update_status: bool) -> Result<(), RemoveError> {
        let update = update_status.then(|| StatusUpdate {
            store: self.janitor.store.as_ref(),
            shard_id: &self.janitor.config.shard_id,
        });
        remove_repo_directory(&self.janitor.repos, dir, update)
    }

    /// Sets the maybe-corrupt marker when `err` carries a known corruption
    /// message, and records the corruption in the metadata store.
    fn flag_corruption(&self, dir: &GitDir, err: &GitError) {
        let Some(stderr) = err.stderr() else {
            return;
        };
        if !corruption::flag_if_corrupt(dir, stderr) {
            return;
        }
        let name = self.name_for(dir);
        let reason = format!("git reported corruption: {}", stderr);
        if let Err(e) =
            self.janitor
                .store
                .log_corruption(&name, &reason, &self.janitor.config.shard_id)
        {
            log::warn!("janitor: failed to log corruption for {}: {}", name, e);
        }
    }
}

/// Runs maintenance over every repository of one shard.
pub struct Janitor {
    config: MaintenanceConfig,
    repos: ReposDir,
    git: GitCli,
    store: Arc<dyn RepoStore>,
    cloner: Arc<dyn Cloner>,
    addresses: Arc<dyn AddressSource>,
    disk: Arc<dyn DiskSizer>,
}

impl Janitor {
    pub fn new(
        config: MaintenanceConfig,
        store: Arc<dyn RepoStore>,
        cloner: Arc<dyn Cloner>,
        addresses: Arc<dyn AddressSource>,
        disk: Arc<dyn DiskSizer>,
    ) -> Self {
        Self {
            repos: ReposDir::new(&config.repos_dir),
            config,
            git: GitCli::new(),
            store,
            cloner,
            addresses,
            disk,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// The per-repository pipeline for this configuration, in order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![
            Stage {
                name: "compute stats and delete wrong shard repos",
                run: shard::collect_size_and_maybe_delete,
            },
            Stage {
                name: "maybe remove corrupt",
                run: corruption::maybe_remove_corrupt,
            },
            Stage {
                name: "maybe remove non existing",
                run: maybe_remove_non_existing,
            },
            Stage {
                name: "remove stale locks",
                run: locks::remove_stale_locks_stage,
            },
            Stage {
                name: "ensure git attributes",
                run: attributes::ensure_git_attributes_stage,
            },
            Stage {
                name: "auto gc config",
                run: maintenance::auto_gc_config_stage,
            },
        ];

        match self.config.gc_mode {
            GcMode::GitAutoGc => {}
            GcMode::JanitorAutoGc => stages.push(Stage {
                name: "garbage collect",
                run: maintenance::garbage_collect_stage,
            }),
            GcMode::Maintenance => {
                stages.push(Stage {
                    name: "maintenance",
                    run: maintenance::maintenance_stage,
                });
                stages.push(Stage {
                    name: "git prune",
                    run: maintenance::prune_stage,
                });
            }
        }

        if !self.config.disable_auto_git_updates {
            stages.push(Stage {
                name: "maybe re-clone",
                run: reclone::maybe_reclone,
            });
        }

        stages
    }

    /// One complete janitor run. `shutdown` is checked between stages.
    pub fn run(&self, shutdown: &AtomicBool) -> RunReport {
        metrics::JANITOR_RUNNING.set(1);
        let start = Instant::now();
        let mut report = RunReport::default();

        if self.config.lazy_clone {
            match self.free_space(shutdown) {
                Ok(freed) => {
                    report.freed_bytes = freed.bytes_freed;
                    for _ in 0..freed.repos_removed {
                        report.count_removed("disk-pressure");
                    }
                }
                Err(err) => log::error!("free-space: {}", err),
            }
        }

        let report = self.cleanup_repos(shutdown, report);

        metrics::JANITOR_DURATION.observe(start.elapsed().as_secs_f64());
        metrics::JANITOR_RUNNING.set(0);
        log::info!(
            "janitor: run finished in {:?}: visited={} removed={:?} recloned={} errors={}",
            start.elapsed(),
            report.repos_visited,
            report.removed,
            report.recloned,
            report.stage_errors
        );
        report
    }

    /// Evicts least recently used repositories until the free space target is met.
    pub fn free_space(&self, shutdown: &AtomicBool) -> Result<FreedSpace, FreeSpaceError> {
        let to_free = diskpressure::how_many_bytes_to_free(
            &self.repos,
            self.disk.as_ref(),
            self.config.desired_percent_free,
        )?;
        diskpressure::free_up_space(
            &self.repos,
            self.disk.as_ref(),
            StatusUpdate {
                store: self.store.as_ref(),
                shard_id: &self.config.shard_id,
            },
            to_free,
            shutdown,
        )
    }

    fn cleanup_repos(&self, shutdown: &AtomicBool, report: RunReport) -> RunReport {
        let addresses = match self.addresses.addresses() {
            Ok(addrs) if addrs.is_empty() => {
                log::warn!("janitor: no shard addresses known, skipping shard enforcement");
                None
            }
            Ok(addrs) => Some(addrs),
            Err(err) => {
                log::error!(
                    "janitor: failed to resolve shard addresses, skipping shard enforcement: {}",
                    err
                );
                None
            }
        };
        let known_shard = addresses.as_ref().is_some_and(|addrs| {
            addrs
                .iter()
                .any(|addr| hostname_match(&self.config.shard_id, addr))
        });
        if addresses.is_some() && !known_shard {
            log::warn!(
                "janitor: shard {} is not in the shard address list, misplaced repositories will not be removed",
                self.config.shard_id
            );
        }

        let stages = self.stages();
        let mut pass = Pass {
            janitor: self,
            addresses,
            known_shard,
            sizes: BTreeMap::new(),
            report,
        };

        let result = iterate_git_dirs(&self.repos, |dir| -> Result<WalkControl, Infallible> {
            pass.report.repos_visited += 1;
            for stage in &stages {
                if shutdown.load(Ordering::SeqCst) {
                    log::warn!("janitor: aborting run, shutdown requested");
                    pass.report.cancelled = true;
                    return Ok(WalkControl::Stop);
                }

                let start = Instant::now();
                let outcome = (stage.run)(&mut pass, dir);
                let elapsed = start.elapsed();

                if let Some(err) = &outcome.error {
                    log::error!(
                        "janitor: {} failed for {} after {:?}: {}",
                        stage.name,
                        dir,
                        elapsed,
                        err
                    );
                    pass.report.stage_errors += 1;
                }
                let success = if outcome.error.is_none() { "true" } else { "false" };
                metrics::JOB_DURATION
                    .with_label_values(&[success, stage.name])
                    .observe(elapsed.as_secs_f64());

                if outcome.handled {
                    break;
                }
            }
            Ok(WalkControl::Continue)
        });
        if let Err(never) = result {
            match never {}
        }

        if pass.addresses.is_some() {
            metrics::WRONG_SHARD_REPOS.set(pass.report.wrong_shard_repos as i64);
            metrics::WRONG_SHARD_BYTES.set(pass.report.wrong_shard_bytes as i64);
        }
        if self.config.wrong_shard_delete_limit > 0 {
            metrics::WRONG_SHARD_DELETED.inc_by(pass.report.wrong_shard_deleted as u64);
        }

        if !pass.sizes.is_empty() {
            if let Err(err) = self
                .store
                .update_repo_sizes(&self.config.shard_id, &pass.sizes)
            {
                log::error!("janitor: failed to store repo sizes: {}", err);
            }
        }

        pass.report
    }
}

/// Removes repositories the metadata store no longer knows about.
fn maybe_remove_non_existing(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    if !pass.config().remove_non_existing_repos {
        return Outcome::next();
    }

    let name = pass.name_for(dir);
    match pass.janitor.store.get_by_name(&name) {
        Ok(true) => return Outcome::next(),
        Ok(false) => {}
        Err(err) => {
            log::warn!("janitor: failed to look up {}: {}", name, err);
            return Outcome::next();
        }
    }

    log::info!("janitor: removing {}, unknown to the metadata store", name);
    match pass.remove(dir, false) {
        Ok(()) => {
            metrics::NON_EXISTING_REPOS_REMOVED.inc();
            pass.report.count_removed("non-existing");
            Outcome::handled()
        }
        Err(err) => Outcome::handled_with(err),
    }
}

#[cfg(test)]
mod tests;
