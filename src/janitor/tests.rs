use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::{TempDir, tempdir};

use super::*;
use crate::clone::{CloneError, CloneOptions};
use crate::metadata::{CloneStatus, SqliteRepoStore};
use crate::repos::{
    MAYBE_CORRUPT_KEY, RECLONE_TIMESTAMP_KEY, REPO_TYPE_KEY, config_get, config_set, dir_size,
};
use crate::testutil::{backdate, days, git_available, init_bare, write_file};

struct FakeDisk {
    free: u64,
    size: u64,
}

impl DiskSizer for FakeDisk {
    fn bytes_free_on_disk(&self, _: &Path) -> io::Result<u64> {
        Ok(self.free)
    }

    fn disk_size_bytes(&self, _: &Path) -> io::Result<u64> {
        Ok(self.size)
    }
}

struct Fixture {
    root: TempDir,
    store: Arc<SqliteRepoStore>,
    cloned: Arc<Mutex<Vec<RepoName>>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            root: tempdir().unwrap(),
            store: Arc::new(SqliteRepoStore::open_in_memory().unwrap()),
            cloned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn repos_dir(&self) -> &Path {
        self.root.path()
    }

    fn config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            repos_dir: self.repos_dir().to_path_buf(),
            shard_id: "shard-a".into(),
            gc_mode: GcMode::GitAutoGc,
            ..MaintenanceConfig::default()
        }
    }

    fn janitor(&self, config: MaintenanceConfig) -> Janitor {
        self.janitor_with(config, vec!["shard-a".into()], FakeDisk { free: 1, size: 1 })
    }

    fn janitor_with(
        &self,
        config: MaintenanceConfig,
        addrs: Vec<String>,
        disk: FakeDisk,
    ) -> Janitor {
        let cloned = self.cloned.clone();
        let cloner = move |name: &RepoName, opts: CloneOptions| -> Result<String, CloneError> {
            assert!(opts.block && opts.overwrite);
            cloned.lock().unwrap().push(name.clone());
            Ok(format!("cloned {}", name))
        };
        Janitor::new(
            config,
            self.store.clone(),
            Arc::new(cloner),
            Arc::new(StaticAddresses(addrs)),
            Arc::new(disk),
        )
    }

    fn repo(&self, name: &str) -> GitDir {
        init_bare(self.repos_dir(), name)
    }

    fn cloned(&self) -> Vec<RepoName> {
        self.cloned.lock().unwrap().clone()
    }
}

fn name(s: &str) -> RepoName {
    s.parse().unwrap()
}

fn unix(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn set_cloned_ago(dir: &GitDir, age: Duration) {
    let when = unix(SystemTime::now() - age);
    config_set(dir, RECLONE_TIMESTAMP_KEY, &when.to_string()).unwrap();
}

fn run(janitor: &Janitor) -> RunReport {
    janitor.run(&AtomicBool::new(false))
}

#[test]
fn stages_follow_gc_mode() {
    let fixture = Fixture::new();
    let names = |config: MaintenanceConfig| -> Vec<&'static str> {
        fixture
            .janitor(config)
            .stages()
            .iter()
            .map(|s| s.name)
            .collect()
    };

    let common = [
        "compute stats and delete wrong shard repos",
        "maybe remove corrupt",
        "maybe remove non existing",
        "remove stale locks",
        "ensure git attributes",
        "auto gc config",
    ];

    let mut expected = common.to_vec();
    expected.push("maybe re-clone");
    assert_eq!(names(fixture.config()), expected);

    let mut expected = common.to_vec();
    expected.extend(["garbage collect", "maybe re-clone"]);
    assert_eq!(
        names(MaintenanceConfig {
            gc_mode: GcMode::JanitorAutoGc,
            ..fixture.config()
        }),
        expected
    );

    let mut expected = common.to_vec();
    expected.extend(["maintenance", "git prune"]);
    assert_eq!(
        names(MaintenanceConfig {
            gc_mode: GcMode::Maintenance,
            disable_auto_git_updates: true,
            ..fixture.config()
        }),
        expected
    );
}

#[test]
fn old_repos_are_recloned() {
    let fixture = Fixture::new();
    let old = fixture.repo("example.org/old");
    let young = fixture.repo("example.org/young");
    set_cloned_ago(&old, 2 * reclone::REPO_TTL);
    set_cloned_ago(&young, days(10));

    let report = run(&fixture.janitor(fixture.config()));

    assert_eq!(report.repos_visited, 2);
    assert_eq!(report.recloned, 1);
    assert_eq!(fixture.cloned(), vec![name("example.org/old")]);
}

#[test]
fn reclone_is_disabled_by_config() {
    let fixture = Fixture::new();
    let old = fixture.repo("example.org/old");
    set_cloned_ago(&old, 2 * reclone::REPO_TTL);

    let report = run(&fixture.janitor(MaintenanceConfig {
        disable_auto_git_updates: true,
        ..fixture.config()
    }));

    assert_eq!(report.recloned, 0);
    assert!(fixture.cloned().is_empty());
}

#[test]
fn failing_gc_log_triggers_reclone() {
    let fixture = Fixture::new();
    let dir = fixture.repo("example.org/gc-failing");
    set_cloned_ago(&dir, 2 * reclone::REPO_TTL_GC);
    write_file(
        dir.path("gc.log"),
        "warning: There are too many unreachable loose objects; run 'git prune' to remove them.\n",
    );

    let report = run(&fixture.janitor(fixture.config()));

    assert_eq!(report.recloned, 1);
    assert_eq!(fixture.cloned(), vec![name("example.org/gc-failing")]);
}

#[test]
fn failed_reclone_backs_off() {
    let fixture = Fixture::new();
    let dir = fixture.repo("example.org/old");
    set_cloned_ago(&dir, 2 * reclone::REPO_TTL);
    let before = unix(SystemTime::now() - 2 * reclone::REPO_TTL);

    let cloner = |_: &RepoName, _: CloneOptions| -> Result<String, CloneError> {
        Err(CloneError::Other("remote unavailable".into()))
    };
    let janitor = Janitor::new(
        fixture.config(),
        fixture.store.clone(),
        Arc::new(cloner),
        Arc::new(StaticAddresses(vec!["shard-a".into()])),
        Arc::new(FakeDisk { free: 1, size: 1 }),
    );
    let report = run(&janitor);

    assert_eq!(report.recloned, 0);
    assert_eq!(report.stage_errors, 1);

    let after: u64 = config_get(&dir, RECLONE_TIMESTAMP_KEY)
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    let half = reclone::REPO_TTL.as_secs();
    assert!(after >= before + half - 5 && after <= before + half + 5);
}

#[test]
fn non_bare_repo_is_removed() {
    if !git_available() {
        eprintln!("skipping: git not available");
        return;
    }
    let fixture = Fixture::new();
    let worktree = fixture.repos_dir().join("example.org/worktree");
    git2::Repository::init(&worktree).unwrap();

    let report = run(&fixture.janitor(fixture.config()));

    assert_eq!(report.removed.get("non-bare"), Some(&1));
    assert!(!worktree.exists());
    assert!(fixture.cloned().is_empty());
}

#[test]
fn repo_without_head_is_removed_and_logged() {
    let fixture = Fixture::new();
    let dir = fixture.repo("example.org/broken");
    fs_remove(&dir.path("HEAD"));

    let report = run(&fixture.janitor(fixture.config()));

    assert_eq!(report.removed.get("missing-head"), Some(&1));
    assert!(!dir.repo_dir().exists());
    assert!(!fixture.repos_dir().join("example.org").exists());

    let record = fixture.store.get(&name("example.org/broken")).unwrap().unwrap();
    assert_eq!(record.corruption_log.len(), 1);
    assert!(record.corruption_log[0].reason.contains("missing-head"));
    assert_eq!(record.clone_status, Some(CloneStatus::NotCloned));
}

fn fs_remove(path: &Path) {
    std::fs::remove_file(path).unwrap();
}

#[test]
fn perforce_repos_only_reclone_when_maybe_corrupt() {
    let fixture = Fixture::new();
    let dir = fixture.repo("perforce/depot");
    config_set(&dir, REPO_TYPE_KEY, "perforce").unwrap();
    set_cloned_ago(&dir, 2 * reclone::REPO_TTL);
    let janitor = fixture.janitor(fixture.config());

    assert_eq!(run(&janitor).recloned, 0);

    config_set(&dir, MAYBE_CORRUPT_KEY, "1").unwrap();
    assert_eq!(run(&janitor).recloned, 1);
    assert_eq!(config_get(&dir, MAYBE_CORRUPT_KEY).unwrap(), None);
}

/// Names assigned to each of the two shards.
fn names_by_shard(addrs: &[String]) -> (Vec<String>, Vec<String>) {
    let mut a = Vec::new();
    let mut b = Vec::new();
    for i in 0..1000 {
        let n = format!("example.org/repo-{}", i);
        match addr_for_repo(&name(&n), addrs) {
            Some("shard-a") if a.is_empty() => a.push(n),
            Some("shard-b") if b.len() < 2 => b.push(n),
            _ => {}
        }
        if a.len() == 1 && b.len() == 2 {
            break;
        }
    }
    (a, b)
}

#[test]
fn wrong_shard_repos_are_removed_up_to_limit() {
    let fixture = Fixture::new();
    let addrs = vec!["shard-a".to_string(), "shard-b".to_string()];
    let (ours, theirs) = names_by_shard(&addrs);
    for n in ours.iter().chain(&theirs) {
        fixture.repo(n);
    }

    let janitor = fixture.janitor_with(
        MaintenanceConfig {
            wrong_shard_delete_limit: 1,
            ..fixture.config()
        },
        addrs,
        FakeDisk { free: 1, size: 1 },
    );
    let report = run(&janitor);

    assert_eq!(report.wrong_shard_repos, 2);
    assert_eq!(report.wrong_shard_deleted, 1);
    assert_eq!(report.removed.get("wrong-shard"), Some(&1));
    assert!(report.wrong_shard_bytes > 0);

    let remaining = theirs
        .iter()
        .filter(|n| fixture.repos_dir().join(n).exists())
        .count();
    assert_eq!(remaining, 1);
    assert!(fixture.repos_dir().join(&ours[0]).exists());
}

#[test]
fn unknown_shard_never_deletes() {
    let fixture = Fixture::new();
    let addrs = vec!["shard-a".to_string(), "shard-b".to_string()];
    let (ours, theirs) = names_by_shard(&addrs);
    for n in ours.iter().chain(&theirs) {
        fixture.repo(n);
    }

    let janitor = fixture.janitor_with(
        MaintenanceConfig {
            shard_id: "shard-z".into(),
            ..fixture.config()
        },
        addrs,
        FakeDisk { free: 1, size: 1 },
    );
    let report = run(&janitor);

    assert_eq!(report.wrong_shard_repos, 3);
    assert_eq!(report.wrong_shard_deleted, 0);
    for n in ours.iter().chain(&theirs) {
        assert!(fixture.repos_dir().join(n).exists());
    }
}

#[test]
fn empty_address_list_treats_everything_as_owned() {
    let fixture = Fixture::new();
    fixture.repo("example.org/repo");

    let janitor = fixture.janitor_with(fixture.config(), Vec::new(), FakeDisk { free: 1, size: 1 });
    let report = run(&janitor);

    assert_eq!(report.wrong_shard_repos, 0);
    assert!(report.total_bytes > 0);
    assert!(fixture.repos_dir().join("example.org/repo").exists());
}

#[test]
fn non_existing_repos_are_removed_when_enabled() {
    let fixture = Fixture::new();
    fixture.repo("example.org/known");
    fixture.repo("example.org/unknown");
    fixture
        .store
        .insert_repo(&name("example.org/known"), "shard-a")
        .unwrap();

    let report = run(&fixture.janitor(fixture.config()));
    assert!(report.removed.is_empty());

    let report = run(&fixture.janitor(MaintenanceConfig {
        remove_non_existing_repos: true,
        ..fixture.config()
    }));
    assert_eq!(report.removed.get("non-existing"), Some(&1));
    assert!(fixture.repos_dir().join("example.org/known").exists());
    assert!(!fixture.repos_dir().join("example.org/unknown").exists());
}

#[test]
fn repo_sizes_are_stored() {
    let fixture = Fixture::new();
    fixture.repo("example.org/repo");
    fixture
        .store
        .insert_repo(&name("example.org/repo"), "shard-a")
        .unwrap();

    let report = run(&fixture.janitor(fixture.config()));

    let record = fixture.store.get(&name("example.org/repo")).unwrap().unwrap();
    assert_eq!(record.repo_size_bytes, Some(report.total_bytes));
    assert!(report.total_bytes > 0);
}

#[test]
fn stages_prepare_repo_config() {
    let fixture = Fixture::new();
    let dir = fixture.repo("example.org/repo");
    config_set(&dir, "gc.auto", "0").unwrap();

    run(&fixture.janitor(fixture.config()));

    assert_eq!(config_get(&dir, "gc.auto").unwrap(), None);
    assert!(config_get(&dir, RECLONE_TIMESTAMP_KEY).unwrap().is_some());
    assert!(dir.path("info/attributes").exists());
}

#[test]
fn shutdown_cancels_run() {
    let fixture = Fixture::new();
    let dir = fixture.repo("example.org/old");
    set_cloned_ago(&dir, 2 * reclone::REPO_TTL);

    let report = fixture
        .janitor(fixture.config())
        .run(&AtomicBool::new(true));

    assert!(report.cancelled);
    assert!(fixture.cloned().is_empty());
    assert!(!dir.path("info/attributes").exists());
}

#[test]
fn disk_pressure_evicts_least_recently_used() {
    let fixture = Fixture::new();
    let older = fixture.repo("example.org/older");
    let newer = fixture.repo("example.org/newer");
    for dir in [&older, &newer] {
        write_file(dir.path("space_eater"), vec![b'x'; 1000]);
    }
    backdate(older.path("HEAD"), days(5));
    backdate(newer.path("HEAD"), days(1));
    let size = dir_size(older.as_path());

    let janitor = fixture.janitor_with(
        MaintenanceConfig {
            lazy_clone: true,
            desired_percent_free: 10,
            disable_auto_git_updates: true,
            ..fixture.config()
        },
        vec!["shard-a".into()],
        FakeDisk {
            free: 0,
            size: size * 10,
        },
    );
    let report = run(&janitor);

    assert_eq!(report.removed.get("disk-pressure"), Some(&1));
    assert!(report.freed_bytes >= size.saturating_sub(1));
    assert!(!older.repo_dir().exists());
    assert!(newer.path("HEAD").exists());
    assert_eq!(report.repos_visited, 1);
}

#[test]
fn report_serializes() {
    let mut report = RunReport::default();
    report.count_removed("non-bare");
    report.count_removed("non-bare");

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["removed"]["non-bare"], 2);
    assert_eq!(json["cancelled"], false);
}
