// Prometheus metrics for the archival job

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct ArchiveMetrics {
    registry: Registry,
    pub archives_built: IntCounter,
    pub archive_failures: IntCounter,
    pub notifications_failed: IntCounter,
    pub stale_locks_removed: IntCounter,
}

impl ArchiveMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let archives_built = IntCounter::new(
            "gradeflow_archives_built_total",
            "Total number of collection archives written",
        )?;
        let archive_failures = IntCounter::new(
            "gradeflow_archive_failures_total",
            "Total number of collection archives that failed and were rolled back",
        )?;
        let notifications_failed = IntCounter::new(
            "gradeflow_notifications_failed_total",
            "Total number of tutor notifications that could not be sent",
        )?;
        let stale_locks_removed = IntCounter::new(
            "gradeflow_stale_locks_removed_total",
            "Total number of abandoned collection locks removed",
        )?;

        registry.register(Box::new(archives_built.clone()))?;
        registry.register(Box::new(archive_failures.clone()))?;
        registry.register(Box::new(notifications_failed.clone()))?;
        registry.register(Box::new(stale_locks_removed.clone()))?;

        Ok(Self {
            registry,
            archives_built,
            archive_failures,
            notifications_failed,
            stale_locks_removed,
        })
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
