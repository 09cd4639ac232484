//! Path resolution for every file the pipeline shares.
//!
//! Uploads, test frameworks, generated collections and lock markers are all
//! keyed by numeric ids. Building those paths anywhere but here is how the
//! worker, the file-serving API and the archival job drift apart.

use crate::types::Visibility;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

/// Identity of one generated collection (and of its lock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub course_id: i64,
    pub sheet_id: i64,
    pub task_id: i64,
    pub group_id: i64,
}

impl CollectionKey {
    fn stem(&self) -> String {
        format!(
            "collection-course{}-sheet{}-task{}-group{}",
            self.course_id, self.sheet_id, self.task_id, self.group_id
        )
    }

    /// Inverse of the collection lock file name
    pub fn from_lock_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("collection-course")?.strip_suffix(".lock")?;
        let (course, rest) = rest.split_once("-sheet")?;
        let (sheet, rest) = rest.split_once("-task")?;
        let (task, group) = rest.split_once("-group")?;
        Some(Self {
            course_id: course.parse().ok()?,
            sheet_id: sheet.parse().ok()?,
            task_id: task.parse().ok()?,
            group_id: group.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoredFile {
    /// `uploads/submissions/<id>.zip`
    Submission(i64),
    /// `uploads/tasks/<id>-public.zip` or `-private.zip`
    Framework { task_id: i64, visibility: Visibility },
    /// `generated_files/collection-course<c>-sheet<s>-task<t>-group<g>.zip`
    Collection(CollectionKey),
    /// `generated_files/infomark-sheet<id>.lock`
    SheetLock(i64),
    /// `generated_files/collection-course<c>-sheet<s>-task<t>-group<g>.lock`
    CollectionLock(CollectionKey),
}

impl StoredFile {
    /// Recognise a lock marker by its file name
    pub fn parse_lock_name(name: &str) -> Option<StoredFile> {
        if let Some(id) = name
            .strip_prefix("infomark-sheet")
            .and_then(|rest| rest.strip_suffix(".lock"))
        {
            return id.parse().ok().map(StoredFile::SheetLock);
        }
        CollectionKey::from_lock_name(name).map(StoredFile::CollectionLock)
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    uploads: PathBuf,
    generated: PathBuf,
}

impl FileStore {
    pub fn new(uploads: impl Into<PathBuf>, generated: impl Into<PathBuf>) -> Self {
        Self {
            uploads: uploads.into(),
            generated: generated.into(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn generated_dir(&self) -> &Path {
        &self.generated
    }

    pub fn path(&self, file: &StoredFile) -> PathBuf {
        match file {
            StoredFile::Submission(id) => self.uploads.join("submissions").join(format!("{}.zip", id)),
            StoredFile::Framework { task_id, visibility } => self
                .uploads
                .join("tasks")
                .join(format!("{}-{}.zip", task_id, visibility)),
            StoredFile::Collection(key) => self.generated.join(format!("{}.zip", key.stem())),
            StoredFile::SheetLock(id) => self.generated.join(format!("infomark-sheet{}.lock", id)),
            StoredFile::CollectionLock(key) => self.generated.join(format!("{}.lock", key.stem())),
        }
    }

    pub fn exists(&self, file: &StoredFile) -> bool {
        self.path(file).exists()
    }

    pub fn sha256(&self, file: &StoredFile) -> io::Result<String> {
        sha256_file(&self.path(file))
    }

    /// Create the upload and generated-file roots
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.uploads.join("submissions"))?;
        std::fs::create_dir_all(self.uploads.join("tasks"))?;
        std::fs::create_dir_all(&self.generated)
    }
}

/// Name a file is written under before it is renamed into place
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
