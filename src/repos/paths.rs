//! Repository store path management
//!
//! Layout of the store root:
//!
//! ```text
//! <repos_dir>/
//! ├── github.com/
//! │   └── <owner>/
//! │       └── <repo>/
//! │           └── .git/             # Bare repo
//! ├── .tmp/                         # Scratch space, ignored by the walker
//! │   └── delete-repo-XXXXXX/       # Repo dirs mid-removal
//! └── .p4home/                      # Perforce helper state, ignored
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::RepoName;

/// Direct children of the root whose names start with these prefixes are
/// never treated as repositories.
const IGNORED_PREFIXES: &[&str] = &[".tmp", ".p4home"];

/// Scratch directory under the root for staging and removals.
const TEMP_DIR_NAME: &str = ".tmp";

/// Absolute path of a bare repository's `.git` directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitDir(PathBuf);

impl GitDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Joins path components below the git directory.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.0.join(rel)
    }

    /// Directory holding the `.git` directory; this is what gets removed.
    pub fn repo_dir(&self) -> &Path {
        self.0.parent().unwrap_or(&self.0)
    }
}

impl fmt::Display for GitDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for GitDir {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Manages filesystem paths under the repository store root
#[derive(Debug, Clone)]
pub struct ReposDir {
    root: PathBuf,
}

impl ReposDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the scratch directory: `{root}/.tmp`
    pub fn temp_root(&self) -> PathBuf {
        self.root.join(TEMP_DIR_NAME)
    }

    /// Creates a fresh, uniquely named directory `{root}/.tmp/{prefix}NNN`.
    ///
    /// Lives on the same filesystem as the repositories so renames into it
    /// are atomic.
    pub fn temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let base = self.temp_root();
        fs::create_dir_all(&base)?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        loop {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let path = base.join(format!("{prefix}{}-{nanos}-{n}", std::process::id()));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the git directory for a repository: `{root}/{name}/.git`
    pub fn dir_for(&self, name: &RepoName) -> GitDir {
        let mut path = self.root.clone();
        for segment in name.segments() {
            path.push(segment);
        }
        path.push(".git");
        GitDir(path)
    }

    /// Inverse of [`ReposDir::dir_for`]. Paths outside the root come back
    /// normalized from whatever components they have.
    pub fn name_for(&self, dir: &GitDir) -> RepoName {
        let rel = dir.as_path().strip_prefix(&self.root).unwrap_or(dir.as_path());

        let mut segments = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>();
        if segments.last().is_some_and(|s| s == ".git") {
            segments.pop();
        }

        RepoName::normalized(&segments.join("/"))
    }

    /// Returns true if `path` must never be treated as a repository.
    ///
    /// Only direct children of the root are checked, with trailing
    /// whitespace trimmed from the name.
    pub fn ignore_path(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        let mut components = rel.components();
        let Some(Component::Normal(first)) = components.next() else {
            return false;
        };
        let first = first.to_string_lossy();
        let first = first.trim_end();
        IGNORED_PREFIXES.iter().any(|prefix| first.starts_with(prefix))
    }
}
