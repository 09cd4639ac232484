mod archive;
mod catalog;
mod metrics;
mod notify;
mod routes;
mod scheduler;
mod zipper;

use anyhow::Context;
use gradeflow_common::{logging, Config};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use crate::archive::ArchivalJob;
use crate::catalog::JsonCatalog;
use crate::metrics::ArchiveMetrics;
use crate::notify::{LogNotifier, NoticeTemplate, SendmailNotifier, TutorNotifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let _log_guard = logging::init(&config.log);

    tracing::info!(
        interval_secs = config.archive.interval.as_secs(),
        catalog = %config.archive.catalog_path.display(),
        generated = %config.paths.generated_files.display(),
        "Gradeflow archiver booting"
    );

    let store = config.paths.file_store();
    store
        .ensure_dirs()
        .context("cannot create upload and generated-file directories")?;

    let metrics = ArchiveMetrics::new().context("cannot register metrics")?;
    let template = NoticeTemplate::new().context("invalid notification template")?;

    let notifier: Arc<dyn TutorNotifier> = if config.email.send {
        Arc::new(
            SendmailNotifier::new(template, &config.email.from, &config.email.sendmail_binary)
                .context("invalid e-mail configuration")?,
        )
    } else {
        tracing::info!("E-mail sending disabled, notifications are logged");
        Arc::new(LogNotifier::new(template))
    };

    let job = ArchivalJob::new(
        store,
        Arc::new(JsonCatalog::new(config.archive.catalog_path.clone())),
        notifier,
        config.archive.stale_lock_after,
        metrics.clone(),
    );

    let (shutdown, signal_rx) = watch::channel(false);
    let schedule = tokio::spawn(scheduler::run(job, config.archive.interval, signal_rx));

    let listener = tokio::net::TcpListener::bind(&config.archive.health_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.archive.health_addr))?;
    tracing::info!(addr = %config.archive.health_addr, "Health endpoint listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes::router(metrics)).await {
            tracing::error!(error = %e, "Health endpoint stopped");
        }
    });

    signal::ctrl_c()
        .await
        .context("failed to install CTRL+C signal handler")?;
    tracing::info!("Received shutdown signal");

    let _ = shutdown.send(true);
    if let Err(e) = schedule.await {
        tracing::error!(error = %e, "Archival schedule terminated abnormally");
    }
    server.abort();

    tracing::info!("Archiver shutdown complete");
    Ok(())
}
