//! Binary entry point: race the health/metrics HTTP server against the reclaim/cron tick.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::Duration;
use envconfig::Envconfig;
use eyre::Result;
use taskrunner_core::health::HealthRegistry;
use taskrunner_core::metrics::setup_metrics_router;
use taskrunner_core::store::{CronCatchUp, SchedulerStore};
use taskrunner_postgres::PgJobStore;
use taskrunner_scheduler::{handlers, Config, Scheduler};
use tokio::task::JoinSet;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let store: Arc<dyn SchedulerStore> = Arc::new(
        PgJobStore::connect(&config.database_url, &config.jobs_schema, config.max_pg_connections).await?,
    );

    let liveness = HealthRegistry::new("liveness");
    let scheduler_liveness = liveness.register("scheduler".to_string(), time::Duration::seconds(60)).await;

    let scheduler = Scheduler::new(
        store,
        Duration::seconds(config.lost_job_threshold_secs),
        CronCatchUp::Skip,
        scheduler_liveness,
    );

    let router = Router::new()
        .merge(handlers::app::app())
        .route("/_readiness", get(handlers::app::index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());
    let http_server = listen(router, config.bind());
    let tick_interval = tokio::time::Duration::from_secs(config.reclaim_interval_secs);

    let mut tasks = JoinSet::new();
    tasks.spawn(http_server);
    tasks.spawn(async move {
        scheduler.run(tick_interval).await;
        Ok(())
    });

    match tasks.join_next().await {
        Some(Ok(Ok(()))) => tracing::error!("taskrunner-scheduler task exited unexpectedly"),
        Some(Ok(Err(error))) => tracing::error!("taskrunner-scheduler task failed: {}", error),
        Some(Err(join_error)) => tracing::error!("taskrunner-scheduler task panicked: {}", join_error),
        None => {}
    }

    Ok(())
}
