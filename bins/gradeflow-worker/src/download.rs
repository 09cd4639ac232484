//! Artifact download and integrity check

use futures_util::StreamExt;
use gradeflow_common::paths::sha256_file;
use reqwest::{Client, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("cannot write download: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    #[error("cannot hash file: {0}")]
    Io(#[from] io::Error),
}

/// Fetches artifacts from the grading API with the job's bearer token
#[derive(Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Stream `url` into `dest`, returning the number of bytes written
    pub async fn fetch(&self, url: &str, token: &str, dest: &Path) -> Result<u64, DownloadError> {
        let transport = |source| DownloadError::Transport {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(transport)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(url, bytes = written, path = %dest.display(), "Downloaded artifact");
        Ok(written)
    }
}

/// Compare the SHA-256 of `path` with the hex digest from the job message
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<(), IntegrityError> {
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Per-job scratch files, removed when dropped.
///
/// Names are unique per job so concurrent pool members never collide.
#[derive(Debug)]
pub struct ScratchFiles {
    pub submission: PathBuf,
    pub framework: PathBuf,
}

impl ScratchFiles {
    pub fn new(workdir: &Path) -> Self {
        let id = Uuid::new_v4();
        Self {
            submission: workdir.join(format!("{}-submission.zip", id)),
            framework: workdir.join(format!("{}-framework.zip", id)),
        }
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [&self.submission, &self.framework] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
            }
        }
    }
}
