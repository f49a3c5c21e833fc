//! The all-in-one process: one `PgJobStore`, one `Worker`, one `Scheduler`, and the
//! Callback Server's routes sharing a single HTTP listener.
//!
//! Grounded in the three standalone binaries' `main.rs` wiring (`taskrunner-worker`,
//! `taskrunner-scheduler`, `taskrunner-callback`): the Supervisor constructs the same
//! pieces each of them does, just against one store and one listener instead of three.
//! The addition unique to this crate is the shutdown fan-out: the standalone binaries
//! only ever get killed by their process supervisor, but a single process hosting all
//! three components needs to stop them in a safe order on its own signal.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use chrono::Duration as ChronoDuration;
use taskrunner_callback::handlers as callback_handlers;
use taskrunner_core::dispatch::DispatchClient;
use taskrunner_core::health::HealthRegistry;
use taskrunner_core::metrics::setup_metrics_router;
use taskrunner_core::store::{CronCatchUp, JobStore, SchedulerStore};
use taskrunner_postgres::PgJobStore;
use taskrunner_scheduler::Scheduler;
use taskrunner_worker::Worker;
use tokio::sync::Notify;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;

async fn run_notify_listener(database_url: String, notify: Arc<Notify>) {
    loop {
        if let Err(error) = taskrunner_postgres::listen_for_notifications(&database_url, || notify.notify_one()).await {
            warn!("jobs_insert listener disconnected, reconnecting: {}", error);
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
}

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Build every component and run until a shutdown signal arrives, then stop them
    /// in order: Scheduler, then Worker, then the Callback Server's HTTP listener, then
    /// the shared store (closed implicitly once every `Arc<PgJobStore>` is dropped).
    ///
    /// The Worker and Scheduler are stopped by aborting their tasks outright rather than
    /// draining in-flight work: `Worker::run`/`Scheduler::run` have no built-in
    /// cancellation point, so an in-flight dispatch or tick is cut short rather than
    /// awaited to completion. Jobs left locked by an aborted dispatch are picked back up
    /// by the next Scheduler reclaim pass once restarted.
    pub async fn run(self) -> eyre::Result<()> {
        let config = self.config;

        let store = Arc::new(PgJobStore::connect(&config.database_url, &config.jobs_schema, config.max_pg_connections).await?);
        let job_store: Arc<dyn JobStore> = store.clone();
        let scheduler_store: Arc<dyn SchedulerStore> = store.clone();

        let liveness = HealthRegistry::new("liveness");
        let worker_liveness = liveness.register("worker".to_string(), time::Duration::seconds(60)).await;
        let scheduler_liveness = liveness.register("scheduler".to_string(), time::Duration::seconds(60)).await;
        let callback_liveness = liveness.register("callback-server".to_string(), time::Duration::seconds(60)).await;
        callback_liveness.report_healthy().await;

        let callback_url = Url::parse(&config.callback_url)?;
        let gateway_base_url = config.gateway_base_url.as_deref().map(Url::parse).transpose()?;
        let dispatch_client = Arc::new(DispatchClient::new(
            gateway_base_url,
            config.dev_task_url_map.0.clone(),
            callback_url,
            config.dispatch_timeout.0,
        ));

        info!("supervisor starting worker {} and scheduler {}", config.worker_id.as_str(), config.scheduler_id);

        let notify = Arc::new(Notify::new());
        tokio::task::spawn(run_notify_listener(config.database_url.clone(), notify.clone()));

        let worker = Arc::new(Worker::new(
            config.worker_id.as_str().to_owned(),
            job_store.clone(),
            dispatch_client,
            config.effective_supported_tasks(),
            tokio::time::Duration::from_millis(config.idle_delay.0.as_millis() as u64),
            config.max_concurrent_jobs,
            worker_liveness,
            notify,
        ));
        worker.release_stale_claims().await?;

        let scheduler = Arc::new(Scheduler::new(
            scheduler_store,
            ChronoDuration::seconds(config.lost_job_threshold_secs),
            CronCatchUp::Skip,
            scheduler_liveness,
        ));

        let app = callback_handlers::app::add_routes(Router::new(), job_store)
            .route("/_readiness", get(callback_handlers::app::index))
            .route("/_liveness", get(move || ready(liveness.get_status())))
            .merge(setup_metrics_router());

        let listener = tokio::net::TcpListener::bind(config.bind()).await?;
        let shutdown = Arc::new(Notify::new());
        let http_shutdown = shutdown.clone();
        let http_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_shutdown.notified().await })
                .await
        });

        let worker_for_shutdown = worker.clone();
        let worker_task = tokio::spawn(async move { worker.run().await });
        let reclaim_interval = tokio::time::Duration::from_secs(config.reclaim_interval_secs);
        let scheduler_task = tokio::spawn(async move { scheduler.run(reclaim_interval).await });

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, stopping scheduler, worker, then callback server");

        scheduler_task.abort();
        worker_task.abort();

        if let Err(error) = worker_for_shutdown.release_stale_claims().await {
            tracing::error!("failed to release claims during shutdown: {}", error);
        }

        shutdown.notify_one();
        match http_task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!("callback server exited with an error: {}", error),
            Err(join_error) if !join_error.is_cancelled() => {
                tracing::error!("callback server task panicked during shutdown: {}", join_error)
            }
            Err(_) => {}
        }

        drop(store);
        Ok(())
    }
}
