//! Claims jobs from a `JobStore` and dispatches them to external task functions.
//!
//! A semaphore-bounded claim loop reports liveness on every tick and spawns one task
//! per claimed job. Completion here is asynchronous: a successful dispatch only means
//! the external function accepted the job, not that it finished; the job stays locked
//! until the Callback Server records the outcome. A dispatch the function never
//! accepted (a network error, a non-2xx status) is the one outcome this worker records
//! itself, via `fail_job`.

use std::sync::Arc;

use taskrunner_core::dispatch::{DispatchClient, DispatchError};
use taskrunner_core::health::HealthHandle;
use taskrunner_core::job::Job;
use taskrunner_core::metrics::{record_dispatch_duration, record_job_claimed, record_job_failed};
use taskrunner_core::store::JobStore;
use taskrunner_core::config::TaskAllowList;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::WorkerError;

/// Polls a `JobStore` for eligible jobs and dispatches them, bounded by
/// `max_concurrent_jobs` in-flight dispatches at any one time.
pub struct Worker {
    worker_id: String,
    store: Arc<dyn JobStore>,
    dispatch_client: Arc<DispatchClient>,
    supported_tasks: TaskAllowList,
    idle_delay: tokio::time::Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
    /// Notified by a background `listen_for_notifications` task on every `jobs_insert`.
    /// Raced against `idle_delay` in `wait_for_job` so a fresh insert is picked up
    /// without waiting out the full idle delay.
    notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        worker_id: String,
        store: Arc<dyn JobStore>,
        dispatch_client: Arc<DispatchClient>,
        supported_tasks: TaskAllowList,
        idle_delay: tokio::time::Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            worker_id,
            store,
            dispatch_client,
            supported_tasks,
            idle_delay,
            max_concurrent_jobs,
            liveness,
            notify,
        }
    }

    /// Release every claim this worker currently holds. Called once at startup so a
    /// worker that crashed mid-dispatch doesn't leave its prior claims stuck until the
    /// Scheduler's reclaim threshold elapses.
    pub async fn release_stale_claims(&self) -> Result<u64, WorkerError> {
        let released = self.store.release_jobs(&self.worker_id).await?;
        if released > 0 {
            info!("released {} stale claim(s) held by {}", released, self.worker_id);
        }
        Ok(released)
    }

    /// Claim at most one job. Returns `Ok(None)` both when nothing is eligible and when
    /// the claimed job falls outside the allow-list (it is failed back immediately, and
    /// the caller should just keep polling).
    async fn try_claim(&self) -> Result<Option<Job>, WorkerError> {
        let names = self.supported_tasks.names().map(|n| n.to_vec());
        let Some(job) = self.store.get_job(&self.worker_id, names.as_deref()).await? else {
            return Ok(None);
        };

        reject_unsupported(&self.store, &self.worker_id, &self.supported_tasks, job).await
    }

    /// Wait until a job is claimable, waking on whichever comes first: the idle-delay
    /// timer or a `jobs_insert` notification. Either one is just a prompt to poll again;
    /// a notification that fires while nothing is eligible yet (a future `run_at`) falls
    /// back to the idle delay on the next loop iteration.
    async fn wait_for_job(&self) -> Result<Job, WorkerError> {
        let mut interval = tokio::time::interval(self.idle_delay);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.liveness.report_healthy().await;

            if let Some(job) = self.try_claim().await? {
                return Ok(job);
            }
        }
    }

    /// Run the claim loop forever, spawning a dispatch task per claimed job. A dispatch
    /// task that cannot even record its own failure is fatal: it releases this worker's
    /// claims and the error is returned here, which `main.rs` turns into a non-zero exit.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let mut dispatches: JoinSet<Result<(), WorkerError>> = JoinSet::new();

        loop {
            metrics::gauge!("taskrunner_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);

            tokio::select! {
                job = self.wait_for_job() => {
                    let job = job?;
                    record_job_claimed(&job.task_identifier);

                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore has been closed");
                    let store = self.store.clone();
                    let dispatch_client = self.dispatch_client.clone();
                    let worker_id = self.worker_id.clone();

                    dispatches.spawn(async move {
                        let result = dispatch_and_record(store, dispatch_client, &worker_id, job).await;
                        drop(permit);
                        result
                    });
                }
                Some(joined) = dispatches.join_next(), if !dispatches.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => return Err(error),
                        Err(join_error) => return Err(WorkerError::InitError(format!("dispatch task panicked: {join_error}"))),
                    }
                }
            }
        }
    }
}

/// Dispatch a single claimed job and, if the function never accepted it, fail it back
/// into the store. A successful dispatch leaves the job locked for the Callback Server
/// to resolve later. If the store itself rejects the `fail_job` write, the claim is
/// released and the error is propagated so `Worker::run` exits instead of leaving the
/// job silently stuck.
async fn dispatch_and_record(
    store: Arc<dyn JobStore>,
    dispatch_client: Arc<DispatchClient>,
    worker_id: &str,
    job: Job,
) -> Result<(), WorkerError> {
    let started = tokio::time::Instant::now();
    let result = dispatch_client.dispatch(&job).await;
    record_dispatch_duration(&job.task_identifier, started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            info!("dispatched job {} ({})", job.id, job.task_identifier);
            Ok(())
        }
        Err(error) => {
            let terminal = job.attempts >= job.max_attempts;
            record_job_failed(&job.task_identifier, terminal);
            warn!("dispatch of job {} failed: {}", job.id, error);

            if let Err(store_error) = store.fail_job(worker_id, job.id, &dispatch_failure_message(&error)).await {
                error!(
                    "failed to record dispatch failure for job {}: {} — releasing claims and exiting",
                    job.id, store_error
                );
                if let Err(release_error) = store.release_jobs(worker_id).await {
                    error!("failed to release claims for {} during fatal shutdown: {}", worker_id, release_error);
                }
                return Err(WorkerError::StoreError(store_error));
            }
            Ok(())
        }
    }
}

fn dispatch_failure_message(error: &DispatchError) -> String {
    error.to_string()
}

/// The store is expected to filter claims by the allow-list, but a task outside it must
/// never reach dispatch even if it slips through. Fails the job back immediately instead.
async fn reject_unsupported(
    store: &Arc<dyn JobStore>,
    worker_id: &str,
    supported_tasks: &TaskAllowList,
    job: Job,
) -> Result<Option<Job>, WorkerError> {
    if supported_tasks.supports(&job.task_identifier) {
        return Ok(Some(job));
    }

    warn!("worker {} received unsupported task {}", worker_id, job.task_identifier);
    store.fail_job(worker_id, job.id, "Unsupported task").await?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use taskrunner_core::health::HealthRegistry;
    use taskrunner_core::job::NewJobOptions;
    use taskrunner_core::store::MemoryJobStore;
    use url::Url;

    async fn liveness_handle() -> HealthHandle {
        let registry = HealthRegistry::new("liveness");
        registry.register("worker".to_string(), time::Duration::seconds(30)).await
    }

    #[tokio::test]
    async fn release_stale_claims_clears_prior_locks() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::default());
        store
            .add_job("db1", "t", serde_json::json!({}), NewJobOptions::default())
            .await
            .unwrap();
        store.get_job("worker-1", None).await.unwrap();

        let dispatch_client = Arc::new(DispatchClient::new(
            None,
            HashMap::new(),
            Url::parse("http://localhost:3302/").unwrap(),
            std::time::Duration::from_secs(5),
        ));

        let worker = Worker::new(
            "worker-1".to_string(),
            store.clone(),
            dispatch_client,
            TaskAllowList::Any,
            tokio::time::Duration::from_millis(10),
            4,
            liveness_handle().await,
            Arc::new(Notify::new()),
        );

        let released = worker.release_stale_claims().await.unwrap();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn dispatch_failure_is_recorded_against_the_store() {
        let memory = Arc::new(MemoryJobStore::default());
        let store: Arc<dyn JobStore> = memory.clone();
        let id = store
            .add_job("db1", "t", serde_json::json!({}), NewJobOptions::default().max_attempts(3))
            .await
            .unwrap();
        let job = store.get_job("worker-1", None).await.unwrap().unwrap();
        assert_eq!(job.id, id);

        // No gateway and no dev-map entry: dispatch must fail to resolve a URL.
        let dispatch_client = Arc::new(DispatchClient::new(
            None,
            HashMap::new(),
            Url::parse("http://localhost:3302/").unwrap(),
            std::time::Duration::from_secs(5),
        ));

        dispatch_and_record(store.clone(), dispatch_client, "worker-1", job).await.unwrap();

        let reread = memory.jobs().into_iter().find(|j| j.id == id).unwrap();
        assert!(reread.locked_by.is_none(), "a failed dispatch must release the claim");
        assert_eq!(reread.attempts, 1);
    }

    #[tokio::test]
    async fn an_unsupported_task_is_failed_without_dispatching() {
        // Simulate a store that did not filter by the allow-list (`get_job` with
        // `None`): the worker-side guard must still catch it before dispatch.
        let memory = Arc::new(MemoryJobStore::default());
        let store: Arc<dyn JobStore> = memory.clone();
        let id = store
            .add_job("db1", "some-other-task", serde_json::json!({}), NewJobOptions::default())
            .await
            .unwrap();
        let job = store.get_job("worker-1", None).await.unwrap().unwrap();
        assert_eq!(job.id, id);

        let supported = TaskAllowList::Named(vec!["simple-email".to_string()]);
        let claimed = reject_unsupported(&store, "worker-1", &supported, job).await.unwrap();
        assert!(claimed.is_none(), "an unsupported task must not be handed to the dispatch path");

        let reread = memory.jobs().into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(reread.attempts, 1);
        assert_eq!(reread.last_error.as_deref(), Some("Unsupported task"));
    }
}
