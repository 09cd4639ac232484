mod download;
mod handler;
mod metrics;
mod outcome;
mod pool;
mod reporter;
mod routes;
mod runner;

use anyhow::Context;
use gradeflow_common::{logging, Config};
use std::sync::Arc;
use tokio::signal;

use crate::handler::{GradingHandler, SubmissionHandler, VoidHandler};
use crate::metrics::WorkerMetrics;
use crate::pool::WorkerPool;
use crate::runner::DockerRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let _log_guard = logging::init(&config.log);

    tracing::info!(
        name = %config.worker.name,
        instances = config.worker.instances,
        queue = %config.broker.topology.ready_key(),
        void = config.worker.void,
        "Gradeflow worker booting"
    );

    let metrics = WorkerMetrics::new().context("cannot register metrics")?;

    let handler: Arc<dyn SubmissionHandler> = if config.worker.void {
        tracing::warn!("Void mode: deliveries are acknowledged without grading");
        Arc::new(VoidHandler)
    } else {
        tokio::fs::create_dir_all(&config.worker.workdir)
            .await
            .with_context(|| format!("cannot create workdir {}", config.worker.workdir.display()))?;

        let runner = DockerRunner::connect(config.worker.docker_timeout)
            .await
            .context("container runtime unavailable")?;
        tracing::info!("Connected to Docker");

        let client = reqwest::Client::builder()
            .timeout(config.worker.http_timeout)
            .build()
            .context("cannot build HTTP client")?;

        Arc::new(GradingHandler::new(
            client,
            Arc::new(runner),
            config.worker.workdir.clone(),
            config.worker.docker_memory_bytes,
            metrics.clone(),
        ))
    };

    let consumers = pool::connect_consumers(&config.broker, &config.worker)
        .await
        .context("broker unavailable")?;
    tracing::info!(redis = %config.broker.redis_url, "Connected to broker");

    let pool = WorkerPool::spawn(consumers, handler, metrics.clone());

    let listener = tokio::net::TcpListener::bind(&config.worker.health_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.worker.health_addr))?;
    tracing::info!(addr = %config.worker.health_addr, "Health endpoint listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes::router(metrics)).await {
            tracing::error!(error = %e, "Health endpoint stopped");
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    tracing::info!(members = pool.size(), "Received shutdown signal, draining");

    pool.shutdown().await;
    server.abort();

    tracing::info!("Worker shutdown complete");
    Ok(())
}
