// CLI commands for operating Gradeflow
use anyhow::{bail, Context, Result};
use gradeflow_common::config::BrokerConfig;
use gradeflow_common::paths::sha256_file;
use gradeflow_common::queue::{RedisPublisher, VoidPublisher};
use gradeflow_common::{
    locks, CollectionKey, FileStore, JobMessage, JobPublisher, StoredFile, SubmissionTarget,
    Visibility,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Build one message per visibility and hand each to `publisher`
pub async fn publish_jobs(
    publisher: &dyn JobPublisher,
    target: &SubmissionTarget,
    visibilities: &[Visibility],
    token: &str,
    image: &str,
    sha256: &str,
) -> Result<Vec<JobMessage>> {
    let mut published = Vec::with_capacity(visibilities.len());
    for visibility in visibilities {
        let message = JobMessage::for_submission(target, *visibility, token, image, sha256);
        message.validate().context("Refusing to publish an invalid job message")?;
        publisher
            .publish(&message)
            .await
            .with_context(|| format!("Failed to publish {} job", visibility))?;
        published.push(message);
    }
    Ok(published)
}

/// Re-trigger grading of an uploaded submission
pub async fn enqueue(
    broker: &BrokerConfig,
    store: &FileStore,
    target: &SubmissionTarget,
    visibilities: &[Visibility],
    token: &str,
    image: &str,
    dry_run: bool,
) -> Result<()> {
    let upload = store.path(&StoredFile::Submission(target.submission_id));
    if !upload.exists() {
        bail!("Submission {} has no uploaded file at {}", target.submission_id, upload.display());
    }
    let sha256 = sha256_file(&upload)
        .with_context(|| format!("Failed to hash {}", upload.display()))?;

    println!("🚀 Enqueueing submission {} (sha256 {})", target.submission_id, sha256);

    let messages = if dry_run {
        publish_jobs(&VoidPublisher, target, visibilities, token, image, &sha256).await?
    } else {
        let publisher = RedisPublisher::connect(&broker.redis_url, broker.topology.clone())
            .await
            .context("Failed to connect to broker")?;
        publish_jobs(&publisher, target, visibilities, token, image, &sha256).await?
    };

    for message in &messages {
        if dry_run {
            println!("{}", message.to_json()?);
        } else {
            println!("  ✓ {} job → {}", message.visibility(), broker.topology.ready_key());
        }
    }

    println!("\n✅ {} job(s) {}", messages.len(), if dry_run { "rendered" } else { "published" });
    Ok(())
}

pub fn checksum(path: &Path) -> Result<()> {
    let digest = sha256_file(path).with_context(|| format!("Failed to read {}", path.display()))?;
    println!("{}  {}", digest, path.display());
    Ok(())
}

fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60),
        _ => format!("{}d{:02}h", secs / 86_400, (secs % 86_400) / 3600),
    }
}

pub fn list_locks(store: &FileStore) -> Result<()> {
    let entries = locks::scan(store, SystemTime::now())
        .with_context(|| format!("Failed to scan {}", store.generated_dir().display()))?;

    if entries.is_empty() {
        println!("No lock markers in {}", store.generated_dir().display());
        return Ok(());
    }

    println!("📋 Lock markers in {}:", store.generated_dir().display());
    println!();
    println!("{:<55} {:>9} {:>8}", "LOCK", "AGE", "ARCHIVE");
    println!("{}", "─".repeat(74));

    for entry in &entries {
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let archive = match entry.file {
            StoredFile::CollectionLock(_) if entry.archive_exists => "yes",
            StoredFile::CollectionLock(_) => "MISSING",
            _ => "-",
        };
        println!("{:<55} {:>9} {:>8}", name, format_age(entry.age), archive);
    }

    println!();
    println!("Total: {} marker(s)", entries.len());
    Ok(())
}

/// Remove the sheet lock and, for a collection, its lock too.
/// Returns the markers that were present.
pub fn unlock(store: &FileStore, sheet: i64, collection: Option<(i64, i64, i64)>) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    if let Some((course_id, task_id, group_id)) = collection {
        let key = CollectionKey {
            course_id,
            sheet_id: sheet,
            task_id,
            group_id,
        };
        if store.exists(&StoredFile::Collection(key)) {
            println!("⚠️  Archive for this collection already exists; the next tick will skip it");
        }
        targets.push(store.path(&StoredFile::CollectionLock(key)));
    }
    targets.push(store.path(&StoredFile::SheetLock(sheet)));

    let mut removed = Vec::new();
    for path in targets {
        if path.exists() {
            locks::release(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
            println!("✓ Removed {}", path.display());
            removed.push(path);
        } else {
            println!("  Not present: {}", path.display());
        }
    }
    Ok(removed)
}
