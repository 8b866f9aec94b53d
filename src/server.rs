//! Probe and metrics surface for the host: readiness, liveness backed by
//! the health registry, and the prometheus exposition endpoint.

use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;
use crate::metrics_consts::{BATCH_SIZE, ENQUEUE_BLOCKED_MS};

/// Buckets for the queue-wait histogram. Enqueues are sub-millisecond until
/// a queue fills; the upper buckets size how long the poll thread sat in
/// backpressure.
const QUEUE_WAIT_MS_BUCKETS: &[f64] = &[0.25, 1.0, 5.0, 25.0, 100.0, 500.0, 2_000.0, 10_000.0];

/// Buckets for records-per-batch, bounded above by MAX_BATCH_SIZE in
/// practice.
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1_000.0];

fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(ENQUEUE_BLOCKED_MS.into()), QUEUE_WAIT_MS_BUCKETS)
        .unwrap()
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.into()), BATCH_SIZE_BUCKETS)
        .unwrap()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Build the probe router and install the process-wide metrics recorder.
/// Call once at startup.
pub fn router(liveness: HealthRegistry) -> Router {
    let recorder = install_recorder();
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(recorder.render())))
}

async fn index() -> &'static str {
    "consumer group host"
}

/// Bind the probe router and serve it until the process exits.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}
