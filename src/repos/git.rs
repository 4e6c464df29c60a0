//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for anything that rewrites the object store:**
//! - `gc_auto` - `git gc --auto` with aggressive thresholds
//! - `prune_now` - drops unreachable loose objects
//! - `run_script` - the maintenance script, fed to `sh` with `GIT_DIR` set
//! - `clone_mirror` - fresh mirror clones for re-cloning
//!
//! **libgit2 for repository-local config:**
//! - `config_get`, `config_set`, `config_unset` on `$GIT_DIR/config`

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use git2::{Config, ErrorCode};
use thiserror::Error;

use super::paths::GitDir;

/// Repository-local config key holding the last (re-)clone time in unix seconds.
pub const RECLONE_TIMESTAMP_KEY: &str = "janitor.recloneTimestamp";

/// Repository-local config key set when git output suggested corruption.
pub const MAYBE_CORRUPT_KEY: &str = "janitor.maybeCorruptRepo";

/// Repository-local config key naming where the repository came from
/// (`perforce` for converted depots).
pub const REPO_TYPE_KEY: &str = "janitor.type";

/// How long the bare-repository probe may run before it is abandoned.
const BARE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git config operation failed: {0}")]
    Git(#[from] git2::Error),
    /// A git subprocess exited unsuccessfully.
    #[error("{command} failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GitError {
    /// Captured stderr of a failed subprocess, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Hardened command running against `dir`.
    fn command_in(&self, dir: &GitDir) -> Command {
        let mut cmd = self.command();
        cmd.env("GIT_DIR", dir.as_path());
        cmd.current_dir(dir.as_path());
        cmd
    }

    /// Runs `git --version`.
    pub fn version(&self) -> Result<String, GitError> {
        let output = self.command().arg("--version").output()?;
        if !output.status.success() {
            return Err(failed("git --version", &output.status, &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Returns true only when git positively reports a non-bare repository.
    ///
    /// Any failure, including a timeout, counts as "not known to be non-bare".
    pub fn is_non_bare_best_effort(&self, dir: &GitDir) -> bool {
        let mut cmd = self.command_in(dir);
        cmd.args(["rev-parse", "--is-bare-repository"]);

        match output_with_timeout(cmd, BARE_CHECK_TIMEOUT) {
            Ok(Some(stdout)) => stdout.trim() == "false",
            Ok(None) => {
                log::warn!("git: bare check timed out for {}", dir);
                false
            }
            Err(err) => {
                log::debug!("git: bare check failed for {}: {}", dir, err);
                false
            }
        }
    }

    /// Runs `git gc --auto` synchronously with aggressive thresholds.
    pub fn gc_auto(&self, dir: &GitDir) -> Result<(), GitError> {
        let output = self
            .command_in(dir)
            .args(["-c", "gc.auto=1", "-c", "gc.autoDetach=false", "gc", "--auto"])
            .output()?;

        if !output.status.success() {
            return Err(failed("git gc", &output.status, &output.stderr));
        }
        Ok(())
    }

    /// Removes every unreachable loose object.
    pub fn prune_now(&self, dir: &GitDir) -> Result<(), GitError> {
        let output = self
            .command_in(dir)
            .args(["prune", "--expire", "now"])
            .output()?;

        if !output.status.success() {
            return Err(failed("git prune", &output.status, &output.stderr));
        }
        Ok(())
    }

    /// Feeds `script` to `sh` on stdin inside `dir`.
    ///
    /// On failure the error carries stdout and stderr combined, since the
    /// script traces its commands to stderr.
    pub fn run_script(&self, dir: &GitDir, script: &str) -> Result<(), GitError> {
        let mut child = Command::new("sh")
            .env("GIT_DIR", dir.as_path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .current_dir(dir.as_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(failed("maintenance script", &output.status, &combined));
        }
        Ok(())
    }

    /// Clones `url` as a mirror into `dest`, which must not exist yet.
    pub fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), GitError> {
        if url.is_empty() {
            return Err(GitError::InvalidInput("remote url cannot be empty".into()));
        }
        if url.starts_with('-') {
            return Err(GitError::InvalidInput(
                "remote url cannot start with '-'".into(),
            ));
        }

        let output = self
            .command()
            .args(["clone", "--mirror", "--"])
            .arg(url)
            .arg(dest)
            .output()?;

        if !output.status.success() {
            return Err(failed("git clone", &output.status, &output.stderr));
        }
        Ok(())
    }
}

fn failed(command: &str, status: &std::process::ExitStatus, stderr: &[u8]) -> GitError {
    GitError::CommandFailed {
        command: command.to_string(),
        status: status.to_string(),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

/// Runs `cmd` and returns its stdout, or None if it is still running after
/// `timeout` (in which case it is killed).
fn output_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<Option<String>> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;

    let start = Instant::now();
    let mut sleep_duration = Duration::from_millis(5);
    let max_sleep = Duration::from_millis(200);

    loop {
        match child.try_wait()? {
            Some(_) => break,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            None => {
                std::thread::sleep(sleep_duration);
                sleep_duration = (sleep_duration * 2).min(max_sleep);
            }
        }
    }

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        out.read_to_string(&mut stdout)?;
    }
    Ok(Some(stdout))
}

fn open_config(dir: &GitDir) -> Result<Config, GitError> {
    Ok(Config::open(&dir.path("config"))?)
}

/// Reads a key from the repository-local config. Missing keys are `None`.
pub fn config_get(dir: &GitDir, key: &str) -> Result<Option<String>, GitError> {
    let config = open_config(dir)?;
    match config.get_string(key) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn config_set(dir: &GitDir, key: &str, value: &str) -> Result<(), GitError> {
    let mut config = open_config(dir)?;
    config.set_str(key, value)?;
    Ok(())
}

/// Removes a key from the repository-local config. A missing key is not an error.
pub fn config_unset(dir: &GitDir, key: &str) -> Result<(), GitError> {
    let mut config = open_config(dir)?;
    match config.remove(key) {
        Err(e) if e.code() != ErrorCode::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
