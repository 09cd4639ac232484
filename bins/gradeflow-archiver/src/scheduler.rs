// Recurring trigger for the archival job

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::archive::ArchivalJob;

/// Tick immediately, then every `every`, until `shutdown` flips.
/// Ticks never overlap inside one process; a slow tick delays the next one.
pub async fn run(job: ArchivalJob, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        match job.tick(Utc::now()).await {
            Ok(report) if report.archives_built > 0 || report.failures > 0 || report.stale_locks_removed > 0 => {
                tracing::info!(
                    sheets = report.sheets_processed,
                    built = report.archives_built,
                    failures = report.failures,
                    stale_locks_removed = report.stale_locks_removed,
                    "Archival tick finished"
                );
            }
            Ok(_) => tracing::debug!("Archival tick found nothing to do"),
            Err(e) => tracing::error!(error = %e, "Archival tick failed to load catalog"),
        }
    }

    tracing::info!("Archival schedule stopped");
}
