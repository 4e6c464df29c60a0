//! On-disk repository store

mod git;
mod lock;
mod paths;
mod remove;
mod walk;

pub use git::{
    GitCli, GitError, MAYBE_CORRUPT_KEY, RECLONE_TIMESTAMP_KEY, REPO_TYPE_KEY, config_get,
    config_set, config_unset,
};
pub use lock::{GC_LOCK_FILE, GcLock, hostname};
pub use paths::{GitDir, ReposDir};
pub use remove::{RemoveError, StatusUpdate, remove_repo_directory};
pub use walk::{WalkControl, dir_size, find_git_dirs, iterate_git_dirs};
