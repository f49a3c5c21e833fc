use thiserror::Error;

/// Errors from reclaiming lost claims and materializing due cron entries.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("a store error occurred: {0}")]
    StoreError(#[from] taskrunner_core::store::StoreError),
}
