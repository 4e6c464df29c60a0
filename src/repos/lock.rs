use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use super::paths::GitDir;

/// File git gc and the janitor both use to claim a repository.
pub const GC_LOCK_FILE: &str = "gc.pid";

/// git truncates the host name in gc.pid to this many bytes.
const HOST_NAME_MAX: usize = 256;

/// Exclusive claim on a repository for garbage collection.
///
/// Held by creating `gc.pid` with `O_EXCL`, the same protocol `git gc`
/// uses, so the janitor and a concurrent `git gc` never run together.
/// The file is removed on [`GcLock::release`] or drop.
#[derive(Debug)]
pub struct GcLock {
    path: PathBuf,
    released: bool,
}

impl GcLock {
    /// Try to claim the repository without blocking.
    /// Returns None if another process holds gc.pid.
    pub fn try_acquire(dir: &GitDir) -> io::Result<Option<Self>> {
        let path = dir.path(GC_LOCK_FILE);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some((pid, host)) = read_holder(&path) {
                    log::debug!(
                        "lock: process {} on {} is already running gc in {}",
                        pid,
                        host,
                        dir
                    );
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let lock = Self {
            path,
            released: false,
        };
        let contents = format!("{} {}", std::process::id(), truncated_hostname());
        // Drop removes the file if the write fails.
        file.write_all(contents.as_bytes())?;
        Ok(Some(lock))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes gc.pid. Safe to skip; dropping the guard does the same.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_if_exists(&self.path)
    }
}

impl Drop for GcLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = remove_if_exists(&self.path);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Reads `<pid> <host>` from an existing gc.pid.
fn read_holder(path: &Path) -> Option<(String, String)> {
    let content = fs::read_to_string(path).ok()?;
    let mut parts = content.splitn(2, ' ');
    let pid = parts.next()?.trim().to_string();
    let host = parts.next()?.trim().to_string();
    Some((pid, host))
}

/// Host name of this machine, cut to git's limit.
pub fn truncated_hostname() -> String {
    let mut name = hostname();
    if name.len() > HOST_NAME_MAX {
        let mut end = HOST_NAME_MAX;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Host name via gethostname(2), or "unknown".
pub fn hostname() -> String {
    let mut buf = [0u8; 512];
    // SAFETY: buf is valid for buf.len() bytes and gethostname NUL-terminates
    // on success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
