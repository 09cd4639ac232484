//! Lock markers
//!
//! An empty file whose existence means "this unit of archival work has been
//! claimed". Claiming is a single `create_new`, so two ticks or two processes
//! racing for the same unit see exactly one winner. The marker says nothing
//! about success; together with the archive's existence it does.

use crate::paths::{FileStore, StoredFile};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Atomically create the marker. `Ok(false)` if someone else holds it.
pub fn claim(path: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove a marker; a missing one counts as removed
pub fn release(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Time since the marker was created, zero if the clock went backwards
pub fn age(path: &Path, now: SystemTime) -> io::Result<Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockEntry {
    pub file: StoredFile,
    pub path: PathBuf,
    pub age: Duration,
    /// For collection locks: whether the finished archive is present
    pub archive_exists: bool,
}

impl LockEntry {
    /// A collection lock without its archive that has been around longer than `after`
    pub fn is_orphaned(&self, after: Duration) -> bool {
        matches!(self.file, StoredFile::CollectionLock(_)) && !self.archive_exists && self.age >= after
    }
}

/// All lock markers in the generated-files directory, sorted by path
pub fn scan(store: &FileStore, now: SystemTime) -> io::Result<Vec<LockEntry>> {
    let mut entries = Vec::new();
    let dir = match std::fs::read_dir(store.generated_dir()) {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e),
    };

    for entry in dir {
        let entry = entry?;
        let name = entry.file_name();
        let Some(file) = name.to_str().and_then(StoredFile::parse_lock_name) else {
            continue;
        };
        let path = entry.path();
        let archive_exists = match file {
            StoredFile::CollectionLock(key) => store.exists(&StoredFile::Collection(key)),
            _ => false,
        };
        // the marker may vanish between read_dir and stat
        let age = match age(&path, now) {
            Ok(age) => age,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        entries.push(LockEntry {
            file,
            path,
            age,
            archive_exists,
        });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
