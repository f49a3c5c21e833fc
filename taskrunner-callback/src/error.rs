use thiserror::Error;

/// Errors from recording a callback's outcome against the job store.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("a store error occurred: {0}")]
    StoreError(#[from] taskrunner_core::store::StoreError),
}
