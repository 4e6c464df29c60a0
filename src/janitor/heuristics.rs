//! Cheap on-disk checks deciding whether a repository needs repacking.

use std::fs;
use std::io;
use std::sync::LazyLock;

use regex::Regex;

use crate::repos::GitDir;

/// Loose objects are sampled from this fan-out directory, as git does.
const SENTINEL_DIR: &str = "17";

static HEX_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[0-9a-f]+$").expect("valid regex"));

/// Why a repository needs maintenance; used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceReason {
    Bitmap,
    CommitGraph,
    Packfiles,
    LooseObjects,
}

impl MaintenanceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceReason::Bitmap => "bitmap",
            MaintenanceReason::CommitGraph => "commit_graph",
            MaintenanceReason::Packfiles => "packfiles",
            MaintenanceReason::LooseObjects => "loose_objects",
        }
    }
}

/// Label used when no maintenance is needed.
pub const SKIPPED: &str = "skipped";

/// Returns the first reason maintenance is needed, cheapest check first.
pub fn needs_maintenance(
    dir: &GitDir,
    pack_limit: usize,
    loose_limit: usize,
) -> io::Result<Option<MaintenanceReason>> {
    if !has_bitmap(dir)? {
        return Ok(Some(MaintenanceReason::Bitmap));
    }
    if !has_commit_graph(dir)? {
        return Ok(Some(MaintenanceReason::CommitGraph));
    }
    if too_many_packfiles(dir, pack_limit)? {
        return Ok(Some(MaintenanceReason::Packfiles));
    }
    if too_many_loose_objects(dir, loose_limit)? {
        return Ok(Some(MaintenanceReason::LooseObjects));
    }
    Ok(None)
}

/// Estimates loose objects from one fan-out directory, assuming objects
/// spread evenly over all 256 of them. Only hex-named files count.
pub fn too_many_loose_objects(dir: &GitDir, limit: usize) -> io::Result<bool> {
    let entries = match fs::read_dir(dir.path("objects").join(SENTINEL_DIR)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut count = 0usize;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if HEX_NAME.is_match(&entry.file_name().to_string_lossy()) {
            count += 1;
        }
    }
    Ok(count * 256 > limit)
}

/// Counts `objects/pack/*.pack`, ignoring packs with a `.keep` sibling.
pub fn too_many_packfiles(dir: &GitDir, limit: usize) -> io::Result<bool> {
    let pack_dir = dir.path("objects").join("pack");
    let entries = match fs::read_dir(&pack_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut count = 0usize;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "pack") {
            continue;
        }
        if path.with_extension("keep").exists() {
            continue;
        }
        count += 1;
    }
    Ok(count > limit)
}

pub fn has_bitmap(dir: &GitDir) -> io::Result<bool> {
    let entries = match fs::read_dir(dir.path("objects").join("pack")) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        if entry?.path().extension().is_some_and(|ext| ext == "bitmap") {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn has_commit_graph(dir: &GitDir) -> io::Result<bool> {
    match fs::metadata(dir.path("objects").join("info").join("commit-graph")) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
