//! Corruption detection and quarantine.

use std::fmt;
use std::io;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use super::{Outcome, Pass};
use crate::metrics;
use crate::repos::{GitCli, GitDir, MAYBE_CORRUPT_KEY, config_set};

/// git output that means objects or indexes on disk are unreadable.
static CORRUPTION_PATTERNS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?m)^error: (Could not read|packfile) ").expect("valid regex"),
        Regex::new(r"(?m)^fatal: commit-graph requires overflow generation data but has none")
            .expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionReason {
    /// HEAD is absent, usually an interrupted clone.
    MissingHead,
    /// The repository has a working tree.
    NonBare,
}

impl CorruptionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptionReason::MissingHead => "missing-head",
            CorruptionReason::NonBare => "non-bare",
        }
    }
}

impl fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks the on-disk shape of a repository.
pub fn check_repo_dir_corrupt(
    git: &GitCli,
    dir: &GitDir,
) -> io::Result<Option<CorruptionReason>> {
    match std::fs::metadata(dir.path("HEAD")) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Some(CorruptionReason::MissingHead));
        }
        Err(e) => return Err(e),
    }

    if git.is_non_bare_best_effort(dir) {
        return Ok(Some(CorruptionReason::NonBare));
    }
    Ok(None)
}

pub fn stderr_indicates_corruption(stderr: &str) -> bool {
    CORRUPTION_PATTERNS.iter().any(|re| re.is_match(stderr))
}

/// Sets the maybe-corrupt marker if `stderr` matches a corruption pattern.
/// The next janitor run re-clones marked repositories. Returns whether the
/// marker was set.
pub(super) fn flag_if_corrupt(dir: &GitDir, stderr: &str) -> bool {
    if !stderr_indicates_corruption(stderr) {
        return false;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if let Err(err) = config_set(dir, MAYBE_CORRUPT_KEY, &now.to_string()) {
        log::warn!("janitor: failed to mark {} as maybe corrupt: {}", dir, err);
        return false;
    }
    log::warn!("janitor: marked {} as maybe corrupt", dir);
    true
}

/// Stage: removes repositories that are missing HEAD or are not bare.
pub(super) fn maybe_remove_corrupt(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    let reason = match check_repo_dir_corrupt(&pass.janitor.git, dir) {
        Ok(Some(reason)) => reason,
        Ok(None) => return Outcome::next(),
        Err(err) => return Outcome::failed(err),
    };

    let name = pass.name_for(dir);
    log::info!("janitor: removing corrupt repository {} ({})", name, reason);

    if let Err(err) = pass.janitor.store.log_corruption(
        &name,
        &format!("janitor detected corrupt repository: {}", reason),
        &pass.config().shard_id,
    ) {
        log::warn!("janitor: failed to log corruption for {}: {}", name, err);
    }

    match pass.remove(dir, true) {
        Ok(()) => {
            metrics::REPOS_REMOVED
                .with_label_values(&[reason.as_str()])
                .inc();
            pass.report.count_removed(reason.as_str());
            Outcome::handled()
        }
        Err(err) => Outcome::handled_with(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::config_get;
    use crate::testutil::init_bare;
    use tempfile::tempdir;

    #[test]
    fn missing_head_is_corrupt() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");
        std::fs::remove_file(dir.path("HEAD")).unwrap();

        assert_eq!(
            check_repo_dir_corrupt(&GitCli::new(), &dir).unwrap(),
            Some(CorruptionReason::MissingHead)
        );
    }

    #[test]
    fn healthy_bare_repo_is_not_corrupt() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");

        assert_eq!(check_repo_dir_corrupt(&GitCli::new(), &dir).unwrap(), None);
    }

    #[test]
    fn corruption_patterns() {
        assert!(stderr_indicates_corruption(
            "error: packfile .git/objects/pack/pack-a.pack does not match index"
        ));
        assert!(stderr_indicates_corruption(
            "warning: something\nerror: Could not read 4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        ));
        assert!(stderr_indicates_corruption(
            "fatal: commit-graph requires overflow generation data but has none\n"
        ));

        assert!(!stderr_indicates_corruption("fatal: not a git repository"));
        assert!(!stderr_indicates_corruption(
            "  error: packfile indented does not count"
        ));
    }

    #[test]
    fn flag_sets_marker_only_on_match() {
        let root = tempdir().unwrap();
        let dir = init_bare(root.path(), "example.org/repo");

        assert!(!flag_if_corrupt(&dir, "fatal: remote hung up"));
        assert_eq!(config_get(&dir, MAYBE_CORRUPT_KEY).unwrap(), None);

        assert!(flag_if_corrupt(&dir, "error: Could not read abc"));
        assert!(config_get(&dir, MAYBE_CORRUPT_KEY).unwrap().is_some());
    }
}
