use std::fs;
use std::io;

use super::{Outcome, Pass};
use crate::repos::GitDir;

/// Disables attributes that make `git archive` output differ from the tree.
const MANAGED_ATTRIBUTES: &str = "# Managed by git-janitor.\n* -export-subst -export-ignore\n";

/// Writes `info/attributes` unless it already has the managed contents.
/// Returns whether the file was written.
pub fn ensure_git_attributes(dir: &GitDir) -> io::Result<bool> {
    let path = dir.path("info/attributes");
    match fs::read(&path) {
        Ok(existing) if existing == MANAGED_ATTRIBUTES.as_bytes() => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    fs::create_dir_all(dir.path("info"))?;
    fs::write(&path, MANAGED_ATTRIBUTES)?;
    Ok(true)
}

pub(super) fn ensure_git_attributes_stage(_pass: &mut Pass<'_>, dir: &GitDir) -> Outcome {
    Outcome::from_result(ensure_git_attributes(dir).map(|_| ()))
}
