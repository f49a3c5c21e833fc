pub mod config;
pub mod error;
pub mod worker;

pub use config::Config;
pub use error::WorkerError;
pub use worker::Worker;
