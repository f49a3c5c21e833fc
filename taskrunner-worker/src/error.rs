use thiserror::Error;

/// Errors related to claiming from and recording outcomes against the job store.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a store error occurred: {0}")]
    StoreError(#[from] taskrunner_core::store::StoreError),
    #[error("failed to initialize the job store: {0}")]
    InitError(String),
}
