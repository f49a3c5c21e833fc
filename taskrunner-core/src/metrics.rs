//! Prometheus metrics endpoint shared by every binary, plus the job-lifecycle
//! counters/histograms the Worker, Scheduler, and Callback Server each record against.
//!
//! The endpoint plumbing (`setup_metrics_router`, `track_metrics`, `serve`) is generic
//! HTTP-metrics-exporter boilerplate with nothing domain-specific in it.

use std::time::Instant;

use axum::{body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// Intended for the Router returned by `setup_metrics_router`, with more routes
/// (health, readiness) layered on by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router exposing `/metrics` in the Prometheus exposition format.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route("/metrics", get(move || std::future::ready(recorder_handle.render())))
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request count and latency for every HTTP route it wraps.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [("method", method.to_string()), ("path", path), ("status", status)];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Job-lifecycle metrics recorded by the Worker and Scheduler. Kept as free functions
/// rather than a struct since `metrics` records against a process-global recorder
/// (installed once by `setup_metrics_recorder`) and every caller already has a
/// `task_identifier` and outcome in hand at the call site.
pub fn record_job_claimed(task_identifier: &str) {
    metrics::counter!("taskrunner_jobs_claimed_total", "task" => task_identifier.to_owned()).increment(1);
}

pub fn record_job_completed(task_identifier: &str) {
    metrics::counter!("taskrunner_jobs_completed_total", "task" => task_identifier.to_owned()).increment(1);
}

pub fn record_job_failed(task_identifier: &str, terminal: bool) {
    metrics::counter!(
        "taskrunner_jobs_failed_total",
        "task" => task_identifier.to_owned(),
        "terminal" => terminal.to_string(),
    )
    .increment(1);
}

pub fn record_dispatch_duration(task_identifier: &str, seconds: f64) {
    metrics::histogram!("taskrunner_dispatch_duration_seconds", "task" => task_identifier.to_owned()).record(seconds);
}

pub fn record_jobs_reclaimed(count: u64) {
    metrics::counter!("taskrunner_jobs_reclaimed_total").increment(count);
}
