//! Prometheus metrics for the janitor.
//!
//! The daemon writes the text exposition to `--metrics-file` after every
//! run so a node exporter textfile collector can pick it up.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{LazyLock, Once};

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static REPOS_REMOVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "janitor_repos_removed_total",
            "Repositories removed because they were corrupt, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static REPOS_RECLONED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "janitor_repos_recloned_total",
        "Repositories re-cloned by the janitor",
    )
    .expect("metric creation failed")
});

pub static REPOS_REMOVED_DISK_PRESSURE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "janitor_repos_removed_disk_pressure_total",
        "Repositories removed to free disk space",
    )
    .expect("metric creation failed")
});

pub static NON_EXISTING_REPOS_REMOVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "janitor_non_existing_repos_removed_total",
        "Repositories removed because the metadata store no longer knows them",
    )
    .expect("metric creation failed")
});

pub static JANITOR_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("janitor_running", "1 while a janitor run is in progress")
        .expect("metric creation failed")
});

pub static JANITOR_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("janitor_duration_seconds", "Duration of a janitor run").buckets(
            vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0],
        ),
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "janitor_job_duration_seconds",
            "Duration of one cleanup stage for one repository",
        ),
        &["success", "job_name"],
    )
    .expect("metric creation failed")
});

pub static MAINTENANCE_STATUS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "janitor_maintenance_status_total",
            "Maintenance script decisions and outcomes",
        ),
        &["success", "reason"],
    )
    .expect("metric creation failed")
});

pub static PRUNE_STATUS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("janitor_prune_status_total", "git prune outcomes"),
        &["success", "skipped"],
    )
    .expect("metric creation failed")
});

pub static WRONG_SHARD_REPOS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "janitor_repo_wrong_shard",
        "Repositories on disk that belong to another shard",
    )
    .expect("metric creation failed")
});

pub static WRONG_SHARD_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "janitor_repo_wrong_shard_bytes",
        "Bytes used by repositories that belong to another shard",
    )
    .expect("metric creation failed")
});

pub static WRONG_SHARD_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "janitor_repo_wrong_shard_deleted_total",
        "Repositories removed because they belong to another shard",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REPOS_REMOVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REPOS_RECLONED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REPOS_REMOVED_DISK_PRESSURE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(NON_EXISTING_REPOS_REMOVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JANITOR_RUNNING.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JANITOR_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MAINTENANCE_STATUS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PRUNE_STATUS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(WRONG_SHARD_REPOS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(WRONG_SHARD_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(WRONG_SHARD_DELETED.clone()))
            .expect("metric registration failed");
    });
}

/// Renders every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Writes the exposition to `path` through a sibling temp file and rename,
/// so collectors never read a partial file.
pub fn write_text_file(path: &Path) -> io::Result<()> {
    let body = render().map_err(|e| io::Error::other(e.to_string()))?;
    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}
