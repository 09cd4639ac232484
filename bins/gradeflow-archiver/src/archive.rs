//! Submission Archival Job
//!
//! One tick is a sequential pass over all sheets whose deadline has passed.
//! For every (task, group) of such a sheet it builds one collection archive
//! and notifies the group's tutor.
//!
//! **Lock protocol:**
//! - Sheet lock: claimed once per sheet, only saves re-scanning finished sheets
//! - Collection lock + archive existence: the real completion boundary
//! - Claiming is `create_new`, so concurrent ticks and processes see one winner
//! - A failed build removes the partial file, the collection lock and the
//!   sheet lock, and abandons the sheet until the next tick
//! - Collection locks left without an archive for longer than the stale
//!   threshold are removed at the start of a tick
//! - A sheet lock older than the threshold is released when some unit of the
//!   sheet has neither an archive nor a collection lock

use chrono::{DateTime, Utc};
use gradeflow_common::paths::partial_path;
use gradeflow_common::{locks, CollectionKey, FileStore, StoredFile};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::catalog::{Catalog, CatalogError, CatalogSource, Group, Sheet};
use crate::metrics::ArchiveMetrics;
use crate::notify::{TutorNotice, TutorNotifier};
use crate::zipper::{build_archive, plan_entries, ArchiveError};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sheets_processed: usize,
    pub archives_built: usize,
    pub failures: usize,
    pub stale_locks_removed: usize,
}

enum SheetPass {
    Done,
    Aborted,
}

pub struct ArchivalJob {
    store: FileStore,
    catalog: Arc<dyn CatalogSource>,
    notifier: Arc<dyn TutorNotifier>,
    stale_lock_after: Duration,
    metrics: ArchiveMetrics,
}

impl ArchivalJob {
    pub fn new(
        store: FileStore,
        catalog: Arc<dyn CatalogSource>,
        notifier: Arc<dyn TutorNotifier>,
        stale_lock_after: Duration,
        metrics: ArchiveMetrics,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            stale_lock_after,
            metrics,
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, CatalogError> {
        let mut report = TickReport::default();

        if !self.stale_lock_after.is_zero() {
            report.stale_locks_removed = self.remove_stale_locks(SystemTime::from(now));
        }

        let catalog = self.catalog.load().await?;

        for sheet in &catalog.sheets {
            if now <= sheet.due_at {
                continue;
            }

            let sheet_lock = self.store.path(&StoredFile::SheetLock(sheet.id));
            if !self.stale_lock_after.is_zero() && self.release_stale_sheet_lock(&catalog, sheet, &sheet_lock, now) {
                report.stale_locks_removed += 1;
            }
            match locks::claim(&sheet_lock) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(sheet_id = sheet.id, "Sheet already processed");
                    continue;
                }
                Err(e) => {
                    tracing::error!(sheet_id = sheet.id, error = %e, "Cannot claim sheet lock");
                    report.failures += 1;
                    continue;
                }
            }

            tracing::info!(sheet_id = sheet.id, sheet = %sheet.name, "Collecting submissions");
            report.sheets_processed += 1;
            if let SheetPass::Aborted = self.process_sheet(&catalog, sheet, &sheet_lock, &mut report).await {
                tracing::warn!(sheet_id = sheet.id, "Sheet pass aborted, retrying on a later tick");
            }
        }

        Ok(report)
    }

    async fn process_sheet(
        &self,
        catalog: &Catalog,
        sheet: &Sheet,
        sheet_lock: &Path,
        report: &mut TickReport,
    ) -> SheetPass {
        for task in catalog.tasks_of_sheet(sheet.id) {
            for group in catalog.groups_of_course(sheet.course_id) {
                let key = CollectionKey {
                    course_id: sheet.course_id,
                    sheet_id: sheet.id,
                    task_id: task.id,
                    group_id: group.id,
                };

                match self.collect(catalog, sheet, group, key).await {
                    Ok(true) => report.archives_built += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            sheet_id = sheet.id,
                            task_id = task.id,
                            group_id = group.id,
                            error = %e,
                            "Failed to build collection archive"
                        );
                        self.metrics.archive_failures.inc();
                        report.failures += 1;
                        self.release(&self.store.path(&StoredFile::CollectionLock(key)));
                        self.release(sheet_lock);
                        return SheetPass::Aborted;
                    }
                }
            }
        }
        SheetPass::Done
    }

    /// Build one collection unless it is done or claimed elsewhere.
    /// `Ok(true)` when a new archive was written.
    async fn collect(
        &self,
        catalog: &Catalog,
        sheet: &Sheet,
        group: &Group,
        key: CollectionKey,
    ) -> Result<bool, ArchiveError> {
        let archive = self.store.path(&StoredFile::Collection(key));
        if archive.exists() {
            return Ok(false);
        }
        if !locks::claim(&self.store.path(&StoredFile::CollectionLock(key)))? {
            return Ok(false);
        }

        let submissions = catalog.collected_submissions(group.id, key.task_id);
        let entries = plan_entries(&self.store, &submissions);
        let written = build_archive(archive.clone(), entries).await?;

        self.metrics.archives_built.inc();
        tracing::info!(
            sheet_id = key.sheet_id,
            task_id = key.task_id,
            group_id = key.group_id,
            entries = written,
            path = %archive.display(),
            "Collection archive written"
        );

        self.notify_tutor(catalog, sheet, group, &archive).await;
        Ok(true)
    }

    async fn notify_tutor(&self, catalog: &Catalog, sheet: &Sheet, group: &Group, archive: &Path) {
        let Some(tutor) = group.tutor_id.and_then(|id| catalog.user(id)) else {
            tracing::warn!(group_id = group.id, "Group has no tutor to notify");
            return;
        };

        let notice = TutorNotice {
            tutor_name: tutor.full_name(),
            tutor_email: tutor.email.clone(),
            sheet_name: sheet.name.clone(),
            archive_name: archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        if let Err(e) = self.notifier.notify(&notice).await {
            self.metrics.notifications_failed.inc();
            tracing::error!(group_id = group.id, tutor_id = tutor.id, error = %e, "Failed to notify tutor");
        }
    }

    fn units(catalog: &Catalog, sheet: &Sheet) -> Vec<CollectionKey> {
        let mut keys = Vec::new();
        for task in catalog.tasks_of_sheet(sheet.id) {
            for group in catalog.groups_of_course(sheet.course_id) {
                keys.push(CollectionKey {
                    course_id: sheet.course_id,
                    sheet_id: sheet.id,
                    task_id: task.id,
                    group_id: group.id,
                });
            }
        }
        keys
    }

    /// Release a sheet lock left by a pass that died between units.
    /// `true` when the lock was removed.
    fn release_stale_sheet_lock(&self, catalog: &Catalog, sheet: &Sheet, sheet_lock: &Path, now: DateTime<Utc>) -> bool {
        let age = match locks::age(sheet_lock, SystemTime::from(now)) {
            Ok(age) => age,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::error!(sheet_id = sheet.id, error = %e, "Cannot stat sheet lock");
                return false;
            }
        };
        if age < self.stale_lock_after {
            return false;
        }

        let unclaimed = Self::units(catalog, sheet).into_iter().any(|key| {
            !self.store.exists(&StoredFile::Collection(key)) && !self.store.exists(&StoredFile::CollectionLock(key))
        });
        if !unclaimed {
            return false;
        }

        match locks::release(sheet_lock) {
            Ok(()) => {
                self.metrics.stale_locks_removed.inc();
                tracing::warn!(sheet_id = sheet.id, age_secs = age.as_secs(), "Removed abandoned sheet lock");
                true
            }
            Err(e) => {
                tracing::error!(sheet_id = sheet.id, error = %e, "Cannot remove abandoned sheet lock");
                false
            }
        }
    }

    fn release(&self, path: &Path) {
        if let Err(e) = locks::release(path) {
            tracing::error!(path = %path.display(), error = %e, "Failed to remove lock marker");
        }
    }

    fn remove_stale_locks(&self, now: SystemTime) -> usize {
        let entries = match locks::scan(&self.store, now) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Cannot scan lock markers");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.iter().filter(|e| e.is_orphaned(self.stale_lock_after)) {
            let StoredFile::CollectionLock(key) = entry.file else {
                continue;
            };
            let partial = partial_path(&self.store.path(&StoredFile::Collection(key)));
            let result = remove_if_present(&partial)
                .and_then(|()| locks::release(&entry.path))
                .and_then(|()| locks::release(&self.store.path(&StoredFile::SheetLock(key.sheet_id))));

            match result {
                Ok(()) => {
                    removed += 1;
                    self.metrics.stale_locks_removed.inc();
                    tracing::warn!(
                        sheet_id = key.sheet_id,
                        task_id = key.task_id,
                        group_id = key.group_id,
                        age_secs = entry.age.as_secs(),
                        "Removed abandoned collection lock"
                    );
                }
                Err(e) => tracing::error!(path = %entry.path.display(), error = %e, "Cannot remove abandoned lock"),
            }
        }
        removed
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
