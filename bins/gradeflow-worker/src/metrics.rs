// Prometheus metrics for the grading worker

use gradeflow_common::{TestStatus, Visibility};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Worker metrics, each bound to one registry.
/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct WorkerMetrics {
    registry: Registry,
    jobs_processed: IntCounterVec,
    job_duration: HistogramVec,
    deliveries: IntCounterVec,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Graded jobs by visibility and final test status
        let jobs_processed = IntCounterVec::new(
            Opts::new("gradeflow_jobs_processed_total", "Total number of graded jobs"),
            &["visibility", "status"],
        )?;

        // Container run time in seconds
        let job_duration = HistogramVec::new(
            HistogramOpts::new("gradeflow_job_duration_seconds", "Test run duration in seconds")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["visibility"],
        )?;

        // How deliveries were settled: ack, reject, requeue, dead_letter
        let deliveries = IntCounterVec::new(
            Opts::new("gradeflow_deliveries_total", "Total settled deliveries"),
            &["outcome"],
        )?;

        registry.register(Box::new(jobs_processed.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;

        Ok(Self {
            registry,
            jobs_processed,
            job_duration,
            deliveries,
        })
    }

    pub fn record_job(&self, visibility: Visibility, status: TestStatus, duration: Duration) {
        let visibility = visibility.as_str();
        let status = status.to_string();
        self.jobs_processed
            .with_label_values(&[visibility, status.as_str()])
            .inc();
        self.job_duration
            .with_label_values(&[visibility])
            .observe(duration.as_secs_f64());
    }

    pub fn record_delivery(&self, outcome: &str) {
        self.deliveries.with_label_values(&[outcome]).inc();
    }

    /// Render in Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
