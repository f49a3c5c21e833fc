//! Binary entry point: claim jobs from the job store and dispatch them to task functions.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use taskrunner_core::dispatch::DispatchClient;
use taskrunner_core::health::HealthRegistry;
use taskrunner_core::metrics::{serve, setup_metrics_router};
use taskrunner_core::store::JobStore;
use taskrunner_postgres::PgJobStore;
use taskrunner_worker::{Config, Worker};
use tokio::sync::Notify;
use tracing::{info, warn};
use url::Url;

/// Subscribe to `jobs_insert` forever, reconnecting on a dropped listener connection
/// instead of letting a transient database blip take down the whole idle-delay race.
async fn run_notify_listener(database_url: String, notify: Arc<Notify>) {
    loop {
        if let Err(error) = taskrunner_postgres::listen_for_notifications(&database_url, || notify.notify_one()).await {
            warn!("jobs_insert listener disconnected, reconnecting: {}", error);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let store: Arc<dyn JobStore> = Arc::new(
        PgJobStore::connect(&config.database_url, &config.jobs_schema, config.max_pg_connections).await?,
    );

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), time::Duration::seconds(60)).await;

    let callback_url = Url::parse(&config.callback_url)?;
    let gateway_base_url = config.gateway_base_url.as_deref().map(Url::parse).transpose()?;

    let dispatch_client = Arc::new(DispatchClient::new(
        gateway_base_url,
        config.dev_task_url_map.0.clone(),
        callback_url,
        config.dispatch_timeout.0,
    ));

    info!("worker {} starting", config.worker_id.as_str());

    let notify = Arc::new(Notify::new());
    tokio::task::spawn(run_notify_listener(config.database_url.clone(), notify.clone()));

    let worker = Worker::new(
        config.worker_id.as_str().to_owned(),
        store,
        dispatch_client,
        config.effective_supported_tasks(),
        tokio::time::Duration::from_millis(config.idle_delay.0.as_millis() as u64),
        config.max_concurrent_jobs,
        worker_liveness,
        notify,
    );

    worker.release_stale_claims().await?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind).await.expect("failed to start serving worker health/metrics");
    });

    worker.run().await?;

    Ok(())
}

async fn index() -> &'static str {
    "taskrunner worker"
}
