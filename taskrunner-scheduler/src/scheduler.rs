//! Reclaims lost claims and materializes due cron entries into jobs, on a shared tick.
//!
//! A single-permit semaphore guards against overlapping ticks if a run takes longer
//! than the interval.

use std::sync::Arc;

use chrono::{Duration, Utc};
use taskrunner_core::health::HealthHandle;
use taskrunner_core::metrics::record_jobs_reclaimed;
use taskrunner_core::store::{CronCatchUp, SchedulerStore};
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::error::SchedulerError;

pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    lost_job_threshold: Duration,
    catch_up: CronCatchUp,
    liveness: HealthHandle,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SchedulerStore>, lost_job_threshold: Duration, catch_up: CronCatchUp, liveness: HealthHandle) -> Self {
        Self {
            store,
            lost_job_threshold,
            catch_up,
            liveness,
        }
    }

    /// Reclaim lost claims, then materialize every due cron entry. A failure in one
    /// operation does not skip the other; if either fails, the first error encountered
    /// is returned after both have been attempted.
    async fn tick(&self) -> Result<(), SchedulerError> {
        self.liveness.report_healthy().await;
        let mut first_error: Option<SchedulerError> = None;

        match self.store.reclaim_lost_jobs(self.lost_job_threshold).await {
            Ok(0) => {}
            Ok(count) => {
                info!("reclaimed {} lost job(s)", count);
                record_jobs_reclaimed(count);
            }
            Err(error) => {
                error!("failed to reclaim lost jobs: {}", error);
                first_error.get_or_insert(error.into());
            }
        }

        let now = Utc::now();
        match self.store.due_cron_entries(now).await {
            Ok(due) => {
                for entry in due {
                    if let Err(error) = self.store.fire_cron_entry(&entry.identifier, now, self.catch_up).await {
                        error!("failed to fire cron entry {}: {}", entry.identifier, error);
                        first_error.get_or_insert(error.into());
                    }
                }
            }
            Err(error) => {
                error!("failed to list due cron entries: {}", error);
                first_error.get_or_insert(error.into());
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Run the reclaim/cron tick on `interval` forever. A single permit ensures a slow
    /// tick is never overlapped by the next one. A tick error is already logged inside
    /// `tick`; the loop just keeps running on the next interval.
    pub async fn run(&self, interval: tokio::time::Duration) {
        let semaphore = Semaphore::new(1);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let _permit = semaphore.acquire().await;
            ticker.tick().await;
            let _unused = self.tick().await;
            drop(_permit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskrunner_core::health::HealthRegistry;
    use taskrunner_core::store::{CronEntry, CronSchedule, JobStore, MemoryJobStore};

    async fn liveness() -> HealthHandle {
        let registry = HealthRegistry::new("liveness");
        registry.register("scheduler".to_string(), time::Duration::seconds(30)).await
    }

    #[tokio::test]
    async fn tick_reclaims_and_fires_due_cron_entries() {
        let memory = Arc::new(MemoryJobStore::default());
        memory.add_job("db1", "t", json!({}), Default::default()).await.unwrap();
        memory.get_job("stale-worker", None).await.unwrap();

        memory
            .register_cron_entry(CronEntry {
                identifier: "nightly".to_owned(),
                task_identifier: "send-report".to_owned(),
                payload: json!({}),
                database_id: "db1".to_owned(),
                schedule: CronSchedule::Interval(Duration::hours(24)),
                next_run_at: Utc::now() - Duration::seconds(1),
            })
            .await
            .unwrap();

        let store: Arc<dyn SchedulerStore> = memory.clone();
        let scheduler = Scheduler::new(store, Duration::zero(), CronCatchUp::Skip, liveness().await);
        scheduler.tick().await.unwrap();

        assert!(
            memory.jobs().iter().all(|j| j.locked_by.is_none()),
            "a zero lost-job threshold must reclaim the stale claim"
        );

        let due_again = memory.due_cron_entries(Utc::now()).await.unwrap();
        assert!(due_again.is_empty(), "firing the cron entry must advance next_run_at");
    }
}
