pub mod clone;
pub mod config;
pub mod janitor;
pub mod metadata;
pub mod metrics;
pub mod repos;
pub mod types;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::clone::GitCloner;
use crate::config::{JanitorArgs, MaintenanceConfig};
use crate::janitor::{
    AddressSource, DiskSizer, FileAddresses, Janitor, SchedulerHandle, StatDiskSizer,
    StaticAddresses, addr_for_repo, check_repo_dir_corrupt, needs_maintenance, read_failed_count,
};
use crate::metadata::{RepoRecord, RepoStore, SqliteRepoStore};
use crate::repos::{
    GitCli, MAYBE_CORRUPT_KEY, RECLONE_TIMESTAMP_KEY, REPO_TYPE_KEY, ReposDir, config_get,
    dir_size, find_git_dirs,
};
use crate::types::RepoName;

#[derive(Parser)]
#[command(
    name = "git-janitor",
    about = "Background maintenance for a store of bare git repositories"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the janitor periodically until interrupted
    Daemon {
        #[command(flatten)]
        args: JanitorArgs,
    },

    /// Run the janitor once
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        args: JanitorArgs,
    },

    /// Evict least recently used repositories until the free space target is met
    FreeSpace {
        #[command(flatten)]
        args: JanitorArgs,
    },

    /// Show what the janitor knows about one repository
    Inspect {
        /// Repository name, e.g. github.com/gorilla/mux
        repo: String,

        #[command(flatten)]
        args: JanitorArgs,
    },

    /// Check dependencies
    Doctor {
        #[command(flatten)]
        args: JanitorArgs,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { args } => cmd_daemon(&args),
        Commands::Run { json, args } => cmd_run(&args, json),
        Commands::FreeSpace { args } => cmd_free_space(&args),
        Commands::Inspect { repo, args } => cmd_inspect(&args, &repo),
        Commands::Doctor { args } => cmd_doctor(&args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn address_source(args: &JanitorArgs, config: &MaintenanceConfig) -> Arc<dyn AddressSource> {
    match &args.shard_addrs_file {
        Some(path) => Arc::new(FileAddresses::new(path)),
        None if args.shard_addrs.is_empty() => {
            Arc::new(StaticAddresses(vec![config.shard_id.clone()]))
        }
        None => Arc::new(StaticAddresses(args.shard_addrs.clone())),
    }
}

fn build_janitor(args: &JanitorArgs) -> Result<Janitor, Box<dyn std::error::Error>> {
    let config = MaintenanceConfig::from_args(args)?;
    std::fs::create_dir_all(&config.repos_dir)?;
    log::debug!("config: {}", serde_json::to_string(&config)?);

    let store: Arc<dyn RepoStore> = Arc::new(SqliteRepoStore::open(&args.metadata_db())?);
    let cloner = GitCloner::new(ReposDir::new(&config.repos_dir))
        .with_status(store.clone(), config.shard_id.clone());
    let addresses = address_source(args, &config);

    Ok(Janitor::new(
        config,
        store,
        Arc::new(cloner),
        addresses,
        Arc::new(StatDiskSizer),
    ))
}

/// Flag set by Ctrl-C; checked by the janitor between stages.
fn interrupt_flag() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupted, stopping after the current stage");
        handler_flag.store(true, Ordering::SeqCst);
    })?;
    Ok(flag)
}

fn cmd_daemon(args: &JanitorArgs) -> Result<(), Box<dyn std::error::Error>> {
    metrics::register_metrics();
    let janitor = Arc::new(build_janitor(args)?);
    log::info!(
        "janitor: starting for shard {} in {}",
        janitor.config().shard_id,
        janitor.config().repos_dir.display()
    );

    let handle = SchedulerHandle::spawn(janitor, args.interval, args.metrics_file.clone())?;
    let signal = handle.shutdown_signal();
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        signal.trigger();
    })?;

    handle.wait();
    Ok(())
}

fn cmd_run(args: &JanitorArgs, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    metrics::register_metrics();
    let janitor = build_janitor(args)?;
    let interrupted = interrupt_flag()?;

    let report = janitor.run(&interrupted);

    if let Some(path) = &args.metrics_file {
        metrics::write_text_file(path)?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Janitor run");
    println!("  Repos visited:  {}", report.repos_visited);
    println!("  Total size:     {} bytes", report.total_bytes);
    for (reason, count) in &report.removed {
        println!("  Removed ({}): {}", reason, count);
    }
    println!("  Re-cloned:      {}", report.recloned);
    println!(
        "  Wrong shard:    {} ({} bytes, {} removed)",
        report.wrong_shard_repos, report.wrong_shard_bytes, report.wrong_shard_deleted
    );
    println!("  Stage errors:   {}", report.stage_errors);
    if report.cancelled {
        println!("  Run was interrupted");
    }

    Ok(())
}

fn cmd_free_space(args: &JanitorArgs) -> Result<(), Box<dyn std::error::Error>> {
    metrics::register_metrics();
    let janitor = build_janitor(args)?;
    let interrupted = interrupt_flag()?;

    let freed = janitor.free_space(&interrupted)?;
    println!(
        "Freed {} bytes by removing {} repositories",
        freed.bytes_freed, freed.repos_removed
    );
    Ok(())
}

#[derive(Serialize)]
struct RepoInspection {
    name: RepoName,
    git_dir: PathBuf,
    exists: bool,
    size_bytes: u64,
    corrupt: Option<&'static str>,
    recloned_at: Option<String>,
    maybe_corrupt: bool,
    repo_type: Option<String>,
    failed_maintenance_runs: i64,
    needs_maintenance: Option<&'static str>,
    assigned_shard: Option<String>,
    metadata: Option<RepoRecord>,
}

fn cmd_inspect(args: &JanitorArgs, repo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let name: RepoName = repo
        .parse()
        .map_err(|e| format!("Invalid repo name: {}", e))?;
    let config = MaintenanceConfig::from_args(args)?;
    let repos = ReposDir::new(&config.repos_dir);
    let dir = repos.dir_for(&name);
    let exists = dir.as_path().is_dir();

    let mut inspection = RepoInspection {
        name: name.clone(),
        git_dir: dir.as_path().to_path_buf(),
        exists,
        size_bytes: 0,
        corrupt: None,
        recloned_at: None,
        maybe_corrupt: false,
        repo_type: None,
        failed_maintenance_runs: 0,
        needs_maintenance: None,
        assigned_shard: None,
        metadata: None,
    };

    if exists {
        inspection.size_bytes = dir_size(dir.as_path());
        inspection.corrupt = check_repo_dir_corrupt(&GitCli::new(), &dir)?.map(|r| r.as_str());
        inspection.recloned_at = config_get(&dir, RECLONE_TIMESTAMP_KEY)?;
        inspection.maybe_corrupt = config_get(&dir, MAYBE_CORRUPT_KEY)?.is_some();
        inspection.repo_type = config_get(&dir, REPO_TYPE_KEY)?;
        inspection.failed_maintenance_runs = read_failed_count(&dir)?;
        inspection.needs_maintenance =
            needs_maintenance(&dir, config.auto_pack_limit, config.loose_objects_limit)?
                .map(|r| r.as_str());
    }

    let addrs = address_source(args, &config)
        .addresses()
        .unwrap_or_else(|e| {
            log::warn!("inspect: failed to read shard addresses: {}", e);
            Vec::new()
        });
    inspection.assigned_shard = addr_for_repo(&name, &addrs).map(str::to_string);

    let db = args.metadata_db();
    if db.exists() {
        inspection.metadata = SqliteRepoStore::open(&db)?.get(&name)?;
    }

    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}

fn cmd_doctor(args: &JanitorArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("git-janitor System Check\n");

    let git = GitCli::new().version();
    println!(
        "[{}] git: {}",
        if git.is_ok() { "OK" } else { "FAIL" },
        git.as_deref().unwrap_or("not found")
    );

    let config = MaintenanceConfig::from_args(args);
    let config_ok = config.is_ok();
    println!(
        "[{}] Config: {}",
        if config_ok { "OK" } else { "FAIL" },
        match &config {
            Ok(config) => format!("shard {}, gc mode {:?}", config.shard_id, config.gc_mode),
            Err(e) => e.to_string(),
        }
    );

    let repos_dir = args.repos_dir();
    let repos_ok = repos_dir.is_dir();
    let repo_count = if repos_ok {
        find_git_dirs(&ReposDir::new(&repos_dir)).len()
    } else {
        0
    };
    println!(
        "[{}] Repos dir: {} ({} repositories)",
        if repos_ok { "OK" } else { "INFO" },
        repos_dir.display(),
        repo_count
    );

    if repos_ok {
        let sizer = StatDiskSizer;
        match (
            sizer.bytes_free_on_disk(&repos_dir),
            sizer.disk_size_bytes(&repos_dir),
        ) {
            (Ok(free), Ok(total)) if total > 0 => println!(
                "[OK] Disk: {} of {} bytes free ({}%)",
                free,
                total,
                free * 100 / total
            ),
            _ => println!("[INFO] Disk: unknown"),
        }
    }

    let db = args.metadata_db();
    let db_ok = SqliteRepoStore::open(&db).is_ok();
    println!(
        "[{}] Metadata db: {}",
        if db_ok { "OK" } else { "FAIL" },
        db.display()
    );

    if git.is_err() || !config_ok || !db_ok {
        std::process::exit(1);
    }

    Ok(())
}
