//! Binary entry point: serve the callback endpoint task functions report outcomes to.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use taskrunner_callback::{handlers, Config};
use taskrunner_core::health::HealthRegistry;
use taskrunner_core::metrics::setup_metrics_router;
use taskrunner_core::store::JobStore;
use taskrunner_postgres::PgJobStore;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let store: Arc<dyn JobStore> = Arc::new(
        PgJobStore::connect(&config.database_url, &config.jobs_schema, config.max_pg_connections).await?,
    );

    let liveness = HealthRegistry::new("liveness");
    let callback_liveness = liveness.register("callback-server".to_string(), time::Duration::seconds(60)).await;
    callback_liveness.report_healthy().await;

    let app = handlers::app::add_routes(Router::new(), store)
        .route("/_readiness", get(handlers::app::index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());

    listen(app, config.bind()).await
}
