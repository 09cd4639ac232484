//! Collection archive builder
//!
//! Writes to `<archive>.partial` and renames into place once the zip is
//! finished, so an existing archive is always a complete one.

use gradeflow_common::paths::partial_path;
use gradeflow_common::{FileStore, StoredFile};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::catalog::CollectedSubmission;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("zip encoding failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive task aborted: {0}")]
    Aborted(String),
}

/// One member of a collection archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub source: PathBuf,
}

fn surname_stem(last_name: &str) -> String {
    let stem: String = last_name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    if stem.is_empty() {
        "student".to_string()
    } else {
        stem
    }
}

/// Decide which uploads go into the archive and under which name.
///
/// Students without an uploaded file are left out. The first holder of a
/// surname gets `<surname>.zip`, later ones `<surname>-<submission_id>.zip`.
pub fn plan_entries(store: &FileStore, submissions: &[CollectedSubmission]) -> Vec<Entry> {
    let mut taken = HashSet::new();
    let mut entries = Vec::new();

    for submission in submissions {
        let source = store.path(&StoredFile::Submission(submission.submission_id));
        if !source.exists() {
            continue;
        }

        let stem = surname_stem(&submission.last_name);
        let mut name = format!("{}.zip", stem);
        if !taken.insert(name.clone()) {
            name = format!("{}-{}.zip", stem, submission.submission_id);
            taken.insert(name.clone());
        }
        entries.push(Entry { name, source });
    }
    entries
}

fn write_zip(target: &Path, entries: &[Entry]) -> Result<(), ArchiveError> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(target)?);

    for entry in entries {
        let mut source = BufReader::new(File::open(&entry.source)?);
        zip.start_file(entry.name.as_str(), options.clone())?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish()?.sync_all()?;
    Ok(())
}

/// Build `target` from `entries`. On error nothing is left behind.
pub fn build_archive_sync(target: &Path, entries: &[Entry]) -> Result<usize, ArchiveError> {
    let partial = partial_path(target);
    let result = write_zip(&partial, entries).and_then(|()| {
        std::fs::rename(&partial, target)?;
        Ok(())
    });

    match result {
        Ok(()) => Ok(entries.len()),
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial archive");
                }
            }
            Err(e)
        }
    }
}

/// Async wrapper around [`build_archive_sync`] (runs in a blocking thread)
pub async fn build_archive(target: PathBuf, entries: Vec<Entry>) -> Result<usize, ArchiveError> {
    tokio::task::spawn_blocking(move || build_archive_sync(&target, &entries))
        .await
        .map_err(|e| ArchiveError::Aborted(e.to_string()))?
}
