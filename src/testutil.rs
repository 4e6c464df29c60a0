//! Helpers shared by unit tests.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use filetime::FileTime;

use crate::repos::GitDir;

/// Whether a usable `git` binary is on PATH.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Creates a bare repository at `{root}/{name}/.git`.
pub fn init_bare(root: &Path, name: &str) -> GitDir {
    let path = root.join(name).join(".git");
    git2::Repository::init_bare(&path).unwrap();
    GitDir::new(path)
}

/// Sets both atime and mtime of `path` to `age` in the past.
pub fn backdate(path: impl AsRef<Path>, age: Duration) {
    let when = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_times(path.as_ref(), when, when).unwrap();
}

/// Writes `contents` to `path`, creating parent directories.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}

/// Points HEAD of the bare repository at a new commit with an empty tree.
pub fn commit_empty_tree(dir: &GitDir) {
    let repo = git2::Repository::open_bare(dir.as_path()).unwrap();
    let sig = git2::Signature::now("janitor", "janitor@example.org").unwrap();
    let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}
