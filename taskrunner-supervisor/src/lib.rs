//! Wires a `PgJobStore`, a `Worker`, a `Scheduler`, and the Callback Server's routes into
//! a single process, for deployments that don't need the three components scaled
//! independently. Each component runs exactly as it would standalone; the Supervisor
//! only owns the shared store, the shared HTTP listener, and the shutdown fan-out.

pub mod config;
pub mod supervisor;

pub use config::Config;
pub use supervisor::Supervisor;
