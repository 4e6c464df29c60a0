//! Process-wide janitor configuration.
//!
//! Every tunable is a flag with an environment fallback. Arguments are parsed
//! once and turned into an immutable [`MaintenanceConfig`] that is passed to
//! every component.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use thiserror::Error;

use crate::repos::hostname;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("desired percent free must be between 0 and 100, got {0}")]
    PercentOutOfRange(u32),
    #[error("repos dir must be an absolute path: {0}")]
    RelativeReposDir(PathBuf),
}

/// Garbage collection strategy. Exactly one is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Leave gc to git's own `gc.auto` heuristics.
    GitAutoGc,
    /// The janitor runs `git gc --auto` itself.
    JanitorAutoGc,
    /// The janitor runs the maintenance script and disables `gc.auto`.
    Maintenance,
}

impl GcMode {
    /// Picks a mode from the two strategy flags. Both set is contradictory
    /// and falls back to git's own auto gc.
    pub fn from_flags(enable_gc_auto: bool, enable_maintenance: bool) -> Self {
        match (enable_gc_auto, enable_maintenance) {
            (true, false) => GcMode::JanitorAutoGc,
            (false, true) => GcMode::Maintenance,
            (true, true) => {
                log::warn!(
                    "config: gc auto and maintenance must not both be enabled, falling back to git auto gc"
                );
                GcMode::GitAutoGc
            }
            (false, false) => GcMode::GitAutoGc,
        }
    }
}

/// Command line arguments shared by every janitor command.
#[derive(Debug, Clone, Args)]
pub struct JanitorArgs {
    /// Root of the repository store
    #[arg(long, env = "JANITOR_REPOS_DIR")]
    pub repos_dir: Option<PathBuf>,

    /// Identity of this shard; defaults to the host name
    #[arg(long, env = "JANITOR_SHARD_ID")]
    pub shard_id: Option<String>,

    /// File listing every shard address, one per line, re-read each run
    #[arg(long, env = "JANITOR_SHARD_ADDRS_FILE")]
    pub shard_addrs_file: Option<PathBuf>,

    /// Comma separated shard addresses, used when no file is given
    #[arg(long, env = "JANITOR_SHARD_ADDRS", value_delimiter = ',')]
    pub shard_addrs: Vec<String>,

    /// Pause between janitor runs
    #[arg(long, env = "JANITOR_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Run `git gc --auto` during janitor runs
    #[arg(long, env = "JANITOR_ENABLE_GC_AUTO", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_gc_auto: bool,

    /// Run the maintenance script during janitor runs
    #[arg(long, env = "JANITOR_ENABLE_MAINTENANCE", default_value_t = false, action = clap::ArgAction::Set)]
    pub enable_maintenance: bool,

    /// Pack files allowed before maintenance repacks
    #[arg(long, env = "JANITOR_AUTO_PACK_LIMIT", default_value_t = 50)]
    pub auto_pack_limit: usize,

    /// Estimated loose objects allowed before maintenance runs
    #[arg(long, env = "JANITOR_LOOSE_OBJECTS_LIMIT", default_value_t = 1024)]
    pub loose_objects_limit: usize,

    /// Minimum age of a maintenance failure log before maintenance retries
    #[arg(long, env = "JANITOR_LOG_FILE_EXPIRY", default_value = "24h", value_parser = humantime::parse_duration)]
    pub maintenance_log_expiry: Duration,

    /// Failed maintenance runs tolerated before re-cloning; -1 disables
    #[arg(long, env = "JANITOR_MAINTENANCE_RETRIES", default_value_t = 3, allow_negative_numbers = true)]
    pub maintenance_retries: i64,

    /// Misplaced repositories removed per run; 0 or less disables removal
    #[arg(long, env = "JANITOR_WRONG_SHARD_DELETE_LIMIT", default_value_t = 10, allow_negative_numbers = true)]
    pub wrong_shard_delete_limit: i64,

    /// Remove repositories the metadata store does not know about
    #[arg(long = "remove-non-existing", env = "JANITOR_REMOVE_NON_EXISTING_REPOS", default_value_t = false, action = clap::ArgAction::Set)]
    pub remove_non_existing_repos: bool,

    /// Percentage of the disk to keep free when evicting repositories
    #[arg(long, env = "JANITOR_DESIRED_PERCENT_FREE", default_value_t = 10)]
    pub desired_percent_free: u32,

    /// Evict least recently used repositories under disk pressure
    #[arg(long, env = "JANITOR_LAZY_CLONE", default_value_t = false, action = clap::ArgAction::Set)]
    pub lazy_clone: bool,

    /// Never re-clone repositories
    #[arg(long = "disable-auto-updates", env = "JANITOR_DISABLE_AUTO_GIT_UPDATES", default_value_t = false, action = clap::ArgAction::Set)]
    pub disable_auto_git_updates: bool,

    /// SQLite metadata database
    #[arg(long, env = "JANITOR_METADATA_DB")]
    pub metadata_db: Option<PathBuf>,

    /// Write Prometheus metrics to this file after each run
    #[arg(long, env = "JANITOR_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,
}

impl JanitorArgs {
    /// Store root, defaulting to the user cache directory.
    pub fn repos_dir(&self) -> PathBuf {
        self.repos_dir.clone().unwrap_or_else(|| {
            let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
            cache_dir.join("git-janitor").join("repos")
        })
    }

    /// Metadata database, defaulting to a sibling of the store root.
    pub fn metadata_db(&self) -> PathBuf {
        self.metadata_db.clone().unwrap_or_else(|| {
            let repos_dir = self.repos_dir();
            repos_dir
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or(repos_dir)
                .join("janitor.db")
        })
    }

    pub fn shard_id(&self) -> String {
        self.shard_id.clone().unwrap_or_else(hostname)
    }
}

/// Immutable janitor configuration.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceConfig {
    pub repos_dir: PathBuf,
    pub shard_id: String,
    pub gc_mode: GcMode,
    pub auto_pack_limit: usize,
    pub loose_objects_limit: usize,
    #[serde(with = "humantime_serde")]
    pub maintenance_log_expiry: Duration,
    /// Negative disables re-cloning on maintenance failures.
    pub maintenance_retries: i64,
    pub wrong_shard_delete_limit: i64,
    pub remove_non_existing_repos: bool,
    pub desired_percent_free: u8,
    pub lazy_clone: bool,
    pub disable_auto_git_updates: bool,
}

impl MaintenanceConfig {
    pub fn from_args(args: &JanitorArgs) -> Result<Self, ConfigError> {
        let repos_dir = args.repos_dir();
        if !repos_dir.is_absolute() {
            return Err(ConfigError::RelativeReposDir(repos_dir));
        }
        let desired_percent_free = u8::try_from(args.desired_percent_free)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(ConfigError::PercentOutOfRange(args.desired_percent_free))?;

        Ok(Self {
            repos_dir,
            shard_id: args.shard_id(),
            gc_mode: GcMode::from_flags(args.enable_gc_auto, args.enable_maintenance),
            auto_pack_limit: args.auto_pack_limit,
            loose_objects_limit: args.loose_objects_limit,
            maintenance_log_expiry: args.maintenance_log_expiry,
            maintenance_retries: args.maintenance_retries,
            wrong_shard_delete_limit: args.wrong_shard_delete_limit,
            remove_non_existing_repos: args.remove_non_existing_repos,
            desired_percent_free,
            lazy_clone: args.lazy_clone,
            disable_auto_git_updates: args.disable_auto_git_updates,
        })
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            repos_dir: PathBuf::from("/var/lib/git-janitor/repos"),
            shard_id: "localhost".to_string(),
            gc_mode: GcMode::JanitorAutoGc,
            auto_pack_limit: 50,
            loose_objects_limit: 1024,
            maintenance_log_expiry: Duration::from_secs(24 * 60 * 60),
            maintenance_retries: 3,
            wrong_shard_delete_limit: 10,
            remove_non_existing_repos: false,
            desired_percent_free: 10,
            lazy_clone: false,
            disable_auto_git_updates: false,
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: JanitorArgs,
    }

    fn parse(argv: &[&str]) -> JanitorArgs {
        let mut full = vec!["git-janitor", "--repos-dir", "/data/repos"];
        full.extend_from_slice(argv);
        TestCli::try_parse_from(full).unwrap().args
    }

    #[test]
    fn gc_mode_from_flags() {
        assert_eq!(GcMode::from_flags(true, false), GcMode::JanitorAutoGc);
        assert_eq!(GcMode::from_flags(false, true), GcMode::Maintenance);
        assert_eq!(GcMode::from_flags(false, false), GcMode::GitAutoGc);
        assert_eq!(GcMode::from_flags(true, true), GcMode::GitAutoGc);
    }

    #[test]
    fn defaults() {
        let config = MaintenanceConfig::from_args(&parse(&["--shard-id", "gitserver-0"])).unwrap();

        assert_eq!(config.repos_dir, PathBuf::from("/data/repos"));
        assert_eq!(config.shard_id, "gitserver-0");
        assert_eq!(config.gc_mode, GcMode::JanitorAutoGc);
        assert_eq!(config.auto_pack_limit, 50);
        assert_eq!(config.loose_objects_limit, 1024);
        assert_eq!(config.maintenance_log_expiry, Duration::from_secs(24 * 3600));
        assert_eq!(config.maintenance_retries, 3);
        assert_eq!(config.wrong_shard_delete_limit, 10);
        assert_eq!(config.desired_percent_free, 10);
        assert!(!config.remove_non_existing_repos);
        assert!(!config.lazy_clone);
    }

    #[test]
    fn parses_durations_and_flags() {
        let args = parse(&[
            "--interval",
            "90s",
            "--maintenance-log-expiry",
            "2h 30m",
            "--enable-gc-auto",
            "false",
            "--enable-maintenance",
            "true",
            "--maintenance-retries",
            "-1",
            "--shard-addrs",
            "a:1,b:2",
        ]);

        assert_eq!(args.interval, Duration::from_secs(90));
        assert_eq!(args.shard_addrs, vec!["a:1", "b:2"]);

        let config = MaintenanceConfig::from_args(&args).unwrap();
        assert_eq!(config.gc_mode, GcMode::Maintenance);
        assert_eq!(config.maintenance_retries, -1);
        assert_eq!(config.maintenance_log_expiry, Duration::from_secs(9000));
    }

    #[test]
    fn rejects_percent_out_of_range() {
        let args = parse(&["--desired-percent-free", "101"]);
        assert_eq!(
            MaintenanceConfig::from_args(&args).unwrap_err(),
            ConfigError::PercentOutOfRange(101)
        );
    }

    #[test]
    fn rejects_relative_repos_dir() {
        let mut args = parse(&[]);
        args.repos_dir = Some(PathBuf::from("relative/repos"));
        assert!(matches!(
            MaintenanceConfig::from_args(&args),
            Err(ConfigError::RelativeReposDir(_))
        ));
    }

    #[test]
    fn metadata_db_defaults_next_to_store() {
        let args = parse(&[]);
        assert_eq!(args.metadata_db(), PathBuf::from("/data/janitor.db"));
    }
}
