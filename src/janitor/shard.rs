//! Shard ownership.
//!
//! Every repository is assigned to one shard address by hashing its name.
//! Repositories found on the wrong shard are counted and a bounded number
//! are removed per run.

use std::fs;
use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::{Outcome, Pass};
use crate::metrics;
use crate::repos::{GitDir, dir_size};
use crate::types::RepoName;

/// Supplies the current list of shard addresses. Called once per run.
pub trait AddressSource: Send + Sync {
    fn addresses(&self) -> io::Result<Vec<String>>;
}

/// A fixed address list.
#[derive(Debug, Clone)]
pub struct StaticAddresses(pub Vec<String>);

impl AddressSource for StaticAddresses {
    fn addresses(&self) -> io::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Addresses read from a file on every call, one per line.
/// Blank lines and lines starting with `#` are skipped.
#[derive(Debug, Clone)]
pub struct FileAddresses {
    path: PathBuf,
}

impl FileAddresses {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AddressSource for FileAddresses {
    fn addresses(&self) -> io::Result<Vec<String>> {
        let body = fs::read_to_string(&self.path)?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// The address `name` is assigned to, None for an empty list.
pub fn addr_for_repo<'a>(name: &RepoName, addrs: &'a [String]) -> Option<&'a str> {
    if addrs.is_empty() {
        return None;
    }
    let digest = Sha256::digest(name.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let index = u64::from_be_bytes(prefix) % addrs.len() as u64;
    Some(addrs[index as usize].as_str())
}

/// Whether `addr` names the shard `shard_id`: an exact match, or `shard_id`
/// followed by a domain (`.`) or port (`:`).
pub fn hostname_match(shard_id: &str, addr: &str) -> bool {
    match addr.strip_prefix(shard_id) {
        Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with(':'),
        None => false,
    }
}

/// Stage: records the repository size and removes it if it belongs to
/// another shard and the per-run limit allows.
pub(super) fn collect_size_and_maybe_delete(pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    let name = pass.name_for(dir);
    let size = dir_size(dir.as_path());
    pass.report.total_bytes = pass.report.total_bytes.saturating_add(size);
    pass.sizes.insert(name.clone(), size);

    let Some(addrs) = pass.addresses.as_deref() else {
        return Outcome::next();
    };
    let Some(addr) = addr_for_repo(&name, addrs) else {
        return Outcome::next();
    };
    if hostname_match(&pass.config().shard_id, addr) {
        return Outcome::next();
    }

    pass.report.wrong_shard_repos += 1;
    pass.report.wrong_shard_bytes = pass.report.wrong_shard_bytes.saturating_add(size);

    // Without our own address in the list it may be misconfigured; never
    // delete on its word.
    let limit = pass.config().wrong_shard_delete_limit;
    if !pass.known_shard || limit <= 0 || pass.report.wrong_shard_deleted as i64 >= limit {
        return Outcome::next();
    }

    log::info!(
        "janitor: removing {} ({} bytes), it belongs to {}",
        name,
        size,
        addr
    );
    match pass.remove(dir, false) {
        Ok(()) => {
            pass.report.wrong_shard_deleted += 1;
            pass.report.count_removed("wrong-shard");
            metrics::REPOS_REMOVED.with_label_values(&["wrong-shard"]).inc();
            pass.sizes.remove(&name);
            Outcome::handled()
        }
        Err(err) => Outcome::failed(err),
    }
}
