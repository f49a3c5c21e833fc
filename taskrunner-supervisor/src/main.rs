//! Binary entry point: run the Worker, Scheduler, and Callback Server as one process.

use envconfig::Envconfig;
use taskrunner_supervisor::{Config, Supervisor};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;
    Supervisor::new(config).run().await
}
