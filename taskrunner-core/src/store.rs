//! The `JobStore` and `SchedulerStore` traits: a typed, minimal API over whatever
//! transactional SQL implementation backs the jobs table.
//!
//! Production code drives these traits through `taskrunner_postgres::PgJobStore`.
//! Tests drive them through [`MemoryJobStore`], an in-process double that honors the
//! same claim/complete/fail/release semantics without a database, so the invariants
//! documented on each method can be exercised without a live PostgreSQL instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, NewJobOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// A static schedule definition the Scheduler periodically materializes into jobs.
///
/// Only fixed intervals are supported; full crontab syntax is deferred (see DESIGN.md).
#[derive(Debug, Clone)]
pub enum CronSchedule {
    Interval(Duration),
}

impl CronSchedule {
    /// The next run strictly after `from`, per the configured cron catch-up policy.
    pub fn next_after(&self, from: DateTime<Utc>, now: DateTime<Utc>, catch_up: CronCatchUp) -> DateTime<Utc> {
        let Self::Interval(interval) = self;
        if interval.num_milliseconds() <= 0 {
            return now + Duration::seconds(1);
        }
        match catch_up {
            CronCatchUp::Skip => {
                let mut next = from + *interval;
                while next <= now {
                    next += *interval;
                }
                next
            }
            CronCatchUp::All => from + *interval,
        }
    }
}

/// Whether a Scheduler that was down for several intervals enqueues every missed tick
/// (`All`) or only the next one (`Skip`). Decided in DESIGN.md; `Skip` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronCatchUp {
    Skip,
    All,
}

impl Default for CronCatchUp {
    fn default() -> Self {
        CronCatchUp::Skip
    }
}

#[derive(Debug, Clone)]
pub struct CronEntry {
    pub identifier: String,
    pub task_identifier: String,
    pub payload: serde_json::Value,
    pub database_id: String,
    pub schedule: CronSchedule,
    pub next_run_at: DateTime<Utc>,
}

/// The transactional surface the Worker and Callback Server depend on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job and trigger the `jobs:insert` notification. Returns the new id.
    async fn add_job(
        &self,
        database_id: &str,
        task_identifier: &str,
        payload: serde_json::Value,
        opts: NewJobOptions,
    ) -> Result<JobId, StoreError>;

    /// Atomically select and lock the next eligible job, or `None` if none is eligible.
    /// Ordering: `priority` asc, then `run_at` asc, then `id` asc. Never blocks.
    async fn get_job(
        &self,
        worker_id: &str,
        supported_task_names: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError>;

    /// Delete the row, but only if it is still locked by `worker_id`. Returns the
    /// deleted job, or `None` if no row matched (already resolved or reassigned).
    async fn complete_job(&self, worker_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Record a failed attempt and reschedule, but only if still locked by `worker_id`.
    /// Returns the updated job, or `None` if no row matched.
    async fn fail_job(&self, worker_id: &str, job_id: JobId, message: &str) -> Result<Option<Job>, StoreError>;

    /// Clear every claim held by `worker_id`, without touching `attempts`. Returns the count released.
    async fn release_jobs(&self, worker_id: &str) -> Result<u64, StoreError>;
}

/// The surface the Scheduler depends on: lost-job reclamation and cron materialization.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Release every claim whose `locked_at` is older than `threshold`, regardless of owner.
    /// Returns the number of rows released.
    async fn reclaim_lost_jobs(&self, threshold: Duration) -> Result<u64, StoreError>;

    /// Seed (or no-op update) a cron entry definition. Called once at Scheduler startup per
    /// configured entry; subsequent calls with the same identifier leave `next_run_at` untouched.
    async fn register_cron_entry(&self, entry: CronEntry) -> Result<(), StoreError>;

    /// All cron entries whose `next_run_at <= now`.
    async fn due_cron_entries(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>, StoreError>;

    /// Enqueue the entry's prototype job and advance `next_run_at` past `now`.
    async fn fire_cron_entry(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
        catch_up: CronCatchUp,
    ) -> Result<JobId, StoreError>;
}

struct MemoryState {
    jobs: Vec<Job>,
    next_id: JobId,
    cron_entries: HashMap<String, CronEntry>,
}

/// An in-process `JobStore` + `SchedulerStore` double used by unit tests.
///
/// Grounded in the trait-based job store abstraction (a `JobStore` trait with a
/// swappable backend) so Worker and Scheduler logic can be exercised deterministically
/// without standing up PostgreSQL.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    retry_policy: RetryPolicy,
}

impl MemoryJobStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                jobs: Vec::new(),
                next_id: 1,
                cron_entries: HashMap::new(),
            }),
            retry_policy,
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().expect("memory store mutex poisoned").jobs.clone()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(
        &self,
        database_id: &str,
        task_identifier: &str,
        payload: serde_json::Value,
        opts: NewJobOptions,
    ) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let id = state.next_id;
        state.next_id += 1;
        let now = Utc::now();
        state.jobs.push(Job {
            id,
            task_identifier: task_identifier.to_owned(),
            payload,
            database_id: database_id.to_owned(),
            queue_name: opts.queue_name.clone(),
            priority: opts.priority.unwrap_or(DEFAULT_PRIORITY),
            run_at: opts.run_at.unwrap_or(now),
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn get_job(
        &self,
        worker_id: &str,
        supported_task_names: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let now = Utc::now();
        let mut candidates: Vec<usize> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.locked_at.is_none()
                    && job.run_at <= now
                    && supported_task_names
                        .map(|names| names.iter().any(|n| n == &job.task_identifier))
                        .unwrap_or(true)
            })
            .map(|(idx, _)| idx)
            .collect();

        candidates.sort_by(|&a, &b| {
            let (ja, jb) = (&state.jobs[a], &state.jobs[b]);
            ja.priority
                .cmp(&jb.priority)
                .then(ja.run_at.cmp(&jb.run_at))
                .then(ja.id.cmp(&jb.id))
        });

        let Some(&idx) = candidates.first() else {
            return Ok(None);
        };

        let job = &mut state.jobs[idx];
        job.locked_at = Some(now);
        job.locked_by = Some(worker_id.to_owned());
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, worker_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let Some(idx) = state
            .jobs
            .iter()
            .position(|job| job.id == job_id && job.locked_by.as_deref() == Some(worker_id))
        else {
            return Ok(None);
        };
        Ok(Some(state.jobs.remove(idx)))
    }

    async fn fail_job(&self, worker_id: &str, job_id: JobId, message: &str) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let retry_policy = self.retry_policy.clone();
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id && job.locked_by.as_deref() == Some(worker_id))
        else {
            return Ok(None);
        };

        let now = Utc::now();
        job.last_error = Some(message.to_owned());
        job.locked_at = None;
        job.locked_by = None;
        job.updated_at = now;
        job.run_at = now
            + if job.attempts >= job.max_attempts {
                Duration::days(36500)
            } else {
                retry_policy.next_run_delay(job.attempts as u32)
            };
        Ok(Some(job.clone()))
    }

    async fn release_jobs(&self, worker_id: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let mut released = 0u64;
        for job in state.jobs.iter_mut() {
            if job.locked_by.as_deref() == Some(worker_id) {
                job.locked_at = None;
                job.locked_by = None;
                job.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl SchedulerStore for MemoryJobStore {
    async fn reclaim_lost_jobs(&self, threshold: Duration) -> Result<u64, StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let now = Utc::now();
        let mut released = 0u64;
        for job in state.jobs.iter_mut() {
            if let Some(locked_at) = job.locked_at {
                if now - locked_at >= threshold {
                    job.locked_at = None;
                    job.locked_by = None;
                    job.updated_at = now;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn register_cron_entry(&self, entry: CronEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("memory store mutex poisoned");
        state.cron_entries.entry(entry.identifier.clone()).or_insert(entry);
        Ok(())
    }

    async fn due_cron_entries(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>, StoreError> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        Ok(state
            .cron_entries
            .values()
            .filter(|entry| entry.next_run_at <= now)
            .cloned()
            .collect())
    }

    async fn fire_cron_entry(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
        catch_up: CronCatchUp,
    ) -> Result<JobId, StoreError> {
        let (task_identifier, payload, database_id) = {
            let state = self.state.lock().expect("memory store mutex poisoned");
            let entry = state
                .cron_entries
                .get(identifier)
                .ok_or_else(|| StoreError::Query(format!("unknown cron entry {identifier}")))?;
            (
                entry.task_identifier.clone(),
                entry.payload.clone(),
                entry.database_id.clone(),
            )
        };

        let job_id = self
            .add_job(&database_id, &task_identifier, payload, NewJobOptions::default())
            .await?;

        let mut state = self.state.lock().expect("memory store mutex poisoned");
        if let Some(entry) = state.cron_entries.get_mut(identifier) {
            entry.next_run_at = entry.schedule.next_after(entry.next_run_at, now, catch_up);
        }
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = MemoryJobStore::default();
        store
            .add_job("db1", "simple-email", json!({"to": "a@x"}), NewJobOptions::default())
            .await
            .unwrap();

        let first = store.get_job("w1", None).await.unwrap();
        let second = store.get_job("w2", None).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn complete_job_is_noop_for_wrong_worker() {
        let store = MemoryJobStore::default();
        let id = store
            .add_job("db1", "t", json!({}), NewJobOptions::default())
            .await
            .unwrap();
        store.get_job("w1", None).await.unwrap();

        assert!(store.complete_job("w2", id).await.unwrap().is_none(), "wrong-worker complete must report no match");
        assert_eq!(store.jobs().len(), 1, "wrong-worker complete must not delete the row");

        let completed = store.complete_job("w1", id).await.unwrap();
        assert_eq!(completed.unwrap().id, id);
        assert_eq!(store.jobs().len(), 0);
    }

    #[tokio::test]
    async fn fail_job_reschedules_into_the_future() {
        let store = MemoryJobStore::default();
        let id = store
            .add_job("db1", "t", json!({}), NewJobOptions::default().max_attempts(5))
            .await
            .unwrap();
        store.get_job("w1", None).await.unwrap();

        store.fail_job("w1", id, "boom").await.unwrap();

        let job = store.jobs().into_iter().find(|j| j.id == id).unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.run_at > Utc::now());
        assert!(job.locked_by.is_none());
    }

    #[tokio::test]
    async fn terminal_failure_after_max_attempts() {
        let store = MemoryJobStore::default();
        let id = store
            .add_job("db1", "t", json!({}), NewJobOptions::default().max_attempts(1).run_at(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        store.get_job("w1", None).await.unwrap();
        store.fail_job("w1", id, "boom").await.unwrap();

        let job = store.jobs().into_iter().find(|j| j.id == id).unwrap();
        assert!(job.is_terminal_failed());

        let reclaimed = store.get_job("w2", None).await.unwrap();
        assert!(reclaimed.is_none(), "terminal-failed jobs must never be reclaimed");
    }

    #[tokio::test]
    async fn release_jobs_clears_only_that_workers_claims() {
        let store = MemoryJobStore::default();
        store.add_job("db1", "t", json!({}), NewJobOptions::default()).await.unwrap();
        store.add_job("db1", "t", json!({}), NewJobOptions::default()).await.unwrap();
        store.get_job("w1", None).await.unwrap();
        store.get_job("w1", None).await.unwrap();

        let released = store.release_jobs("w1").await.unwrap();
        assert_eq!(released, 2);
        assert!(store.jobs().iter().all(|j| j.locked_by.is_none()));
    }

    #[tokio::test]
    async fn reclaim_lost_jobs_respects_threshold() {
        let store = MemoryJobStore::default();
        let id = store.add_job("db1", "t", json!({}), NewJobOptions::default()).await.unwrap();
        store.get_job("w1", None).await.unwrap();

        let released = store.reclaim_lost_jobs(Duration::hours(1)).await.unwrap();
        assert_eq!(released, 0, "a fresh claim is not yet lost");

        {
            let mut state = store.state.lock().unwrap();
            let job = state.jobs.iter_mut().find(|j| j.id == id).unwrap();
            job.locked_at = Some(Utc::now() - Duration::minutes(10));
        }

        let released = store.reclaim_lost_jobs(Duration::minutes(5)).await.unwrap();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn cron_entry_fires_and_advances() {
        let store = MemoryJobStore::default();
        let now = Utc::now();
        store
            .register_cron_entry(CronEntry {
                identifier: "nightly-report".to_owned(),
                task_identifier: "send-report".to_owned(),
                payload: json!({}),
                database_id: "db1".to_owned(),
                schedule: CronSchedule::Interval(Duration::hours(24)),
                next_run_at: now - Duration::seconds(1),
            })
            .await
            .unwrap();

        let due = store.due_cron_entries(now).await.unwrap();
        assert_eq!(due.len(), 1);

        store.fire_cron_entry("nightly-report", now, CronCatchUp::Skip).await.unwrap();
        assert_eq!(store.jobs().len(), 1);

        let due_again = store.due_cron_entries(now).await.unwrap();
        assert!(due_again.is_empty(), "next_run_at must have advanced past now");
    }
}
