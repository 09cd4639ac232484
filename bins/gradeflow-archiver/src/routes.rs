// Health and metrics endpoints of the archival job

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};

use crate::metrics::ArchiveMetrics;

pub fn router(metrics: ArchiveMetrics) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<ArchiveMetrics>) -> impl IntoResponse {
    metrics.render().map_err(|e| {
        tracing::error!(error = %e, "Failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
