//! PostgreSQL-backed [`JobStore`] and [`SchedulerStore`], plus a standalone
//! `listen_for_notifications` helper for the `jobs_insert` channel.
//!
//! `get_job` is a single `FOR UPDATE SKIP LOCKED` dequeue CTE. Table and schema names
//! are interpolated with `format!` rather than bound, since `sqlx` does not support
//! binding identifiers.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id              BIGSERIAL PRIMARY KEY,
//!     task_identifier TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     database_id     TEXT NOT NULL,
//!     queue_name      TEXT,
//!     priority        INTEGER NOT NULL DEFAULT 0,
//!     run_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     attempts        INTEGER NOT NULL DEFAULT 0,
//!     max_attempts    INTEGER NOT NULL DEFAULT 5,
//!     last_error      TEXT,
//!     locked_at       TIMESTAMPTZ,
//!     locked_by       TEXT,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX jobs_ready_idx ON jobs (priority, run_at) WHERE locked_at IS NULL;
//!
//! CREATE TABLE cron_entries (
//!     identifier      TEXT PRIMARY KEY,
//!     task_identifier TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     database_id     TEXT NOT NULL,
//!     interval_ms     BIGINT NOT NULL,
//!     next_run_at     TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Both tables live in a configurable schema (`JOBS_SCHEMA`, default `app_jobs`) so
//! this store can share a database with unrelated application tables.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use taskrunner_core::job::{Job, JobId, NewJobOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
use taskrunner_core::store::{CronCatchUp, CronEntry, CronSchedule, JobStore, SchedulerStore, StoreError};
use tracing::{info, warn};

const NOTIFY_CHANNEL: &str = "jobs_insert";

fn sqlx_err(error: sqlx::Error) -> StoreError {
    StoreError::Query(error.to_string())
}

/// A `JobStore` + `SchedulerStore` backed by a PostgreSQL `jobs`/`cron_entries` pair
/// of tables, both living in `schema`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    schema: String,
}

impl PgJobStore {
    pub async fn connect(database_url: &str, schema: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        Ok(Self::new(pool, schema))
    }

    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.to_owned(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn jobs_table(&self) -> String {
        format!("\"{}\".\"jobs\"", self.schema)
    }

    fn cron_table(&self) -> String {
        format!("\"{}\".\"cron_entries\"", self.schema)
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
        Job {
            id: row.get("id"),
            task_identifier: row.get("task_identifier"),
            payload: row.get("payload"),
            database_id: row.get("database_id"),
            queue_name: row.get("queue_name"),
            priority: row.get("priority"),
            run_at: row.get("run_at"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            locked_at: row.get("locked_at"),
            locked_by: row.get("locked_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    fn row_to_cron_entry(row: &sqlx::postgres::PgRow) -> CronEntry {
        let interval_ms: i64 = row.get("interval_ms");
        CronEntry {
            identifier: row.get("identifier"),
            task_identifier: row.get("task_identifier"),
            payload: row.get("payload"),
            database_id: row.get("database_id"),
            schedule: CronSchedule::Interval(Duration::milliseconds(interval_ms)),
            next_run_at: row.get("next_run_at"),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add_job(
        &self,
        database_id: &str,
        task_identifier: &str,
        payload: serde_json::Value,
        opts: NewJobOptions,
    ) -> Result<JobId, StoreError> {
        let query = format!(
            r#"
            INSERT INTO {table} (task_identifier, payload, database_id, queue_name, priority, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()), $7)
            RETURNING id
            "#,
            table = self.jobs_table()
        );

        let row = sqlx::query(&query)
            .bind(task_identifier)
            .bind(&payload)
            .bind(database_id)
            .bind(&opts.queue_name)
            .bind(opts.priority.unwrap_or(DEFAULT_PRIORITY))
            .bind(opts.run_at)
            .bind(opts.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?;

        let id: JobId = row.get("id");

        if let Err(error) = sqlx::query(&format!("NOTIFY {NOTIFY_CHANNEL}")).execute(&self.pool).await {
            warn!("failed to send jobs_insert notification: {}", error);
        }

        Ok(id)
    }

    async fn get_job(&self, worker_id: &str, supported_task_names: Option<&[String]>) -> Result<Option<Job>, StoreError> {
        let table = self.jobs_table();
        let query = match supported_task_names {
            Some(_) => format!(
                r#"
                WITH claimable AS (
                    SELECT id FROM {table}
                    WHERE locked_at IS NULL AND run_at <= NOW() AND task_identifier = ANY($2)
                    ORDER BY priority ASC, run_at ASC, id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {table}
                SET locked_at = NOW(), locked_by = $1, attempts = attempts + 1, updated_at = NOW()
                FROM claimable
                WHERE {table}.id = claimable.id
                RETURNING {table}.*
                "#
            ),
            None => format!(
                r#"
                WITH claimable AS (
                    SELECT id FROM {table}
                    WHERE locked_at IS NULL AND run_at <= NOW()
                    ORDER BY priority ASC, run_at ASC, id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {table}
                SET locked_at = NOW(), locked_by = $1, attempts = attempts + 1, updated_at = NOW()
                FROM claimable
                WHERE {table}.id = claimable.id
                RETURNING {table}.*
                "#
            ),
        };

        let mut q = sqlx::query(&query).bind(worker_id);
        if let Some(names) = supported_task_names {
            q = q.bind(names);
        }

        let row = q.fetch_optional(&self.pool).await.map_err(sqlx_err)?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    async fn complete_job(&self, worker_id: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!(
            r#"DELETE FROM {table} WHERE id = $1 AND locked_by = $2 RETURNING {table}.*"#,
            table = self.jobs_table()
        );
        let row = sqlx::query(&query).bind(job_id).bind(worker_id).fetch_optional(&self.pool).await.map_err(sqlx_err)?;
        Ok(row.as_ref().map(Self::row_to_job))
    }

    async fn fail_job(&self, worker_id: &str, job_id: JobId, message: &str) -> Result<Option<Job>, StoreError> {
        let table = self.jobs_table();

        // terminal_run_at is conceptually infinite; a century out keeps the column a
        // plain TIMESTAMPTZ instead of needing a nullable "never" sentinel.
        let query = format!(
            r#"
            UPDATE {table}
            SET last_error = $1,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = NOW(),
                run_at = CASE
                    WHEN attempts >= max_attempts THEN NOW() + INTERVAL '100 years'
                    ELSE NOW() + ($2 * INTERVAL '1 millisecond')
                END
            WHERE id = $3 AND locked_by = $4
            RETURNING {table}.*
            "#
        );

        let row = sqlx::query(&format!("SELECT attempts FROM {table} WHERE id = $1 AND locked_by = $2 FOR UPDATE"))
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempts: i32 = row.get("attempts");
        let retry_policy = taskrunner_core::retry::RetryPolicy::default();
        let delay_ms = retry_policy.next_run_delay(attempts as u32).num_milliseconds();

        let row = sqlx::query(&query)
            .bind(message)
            .bind(delay_ms)
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;

        Ok(row.as_ref().map(Self::row_to_job))
    }

    async fn release_jobs(&self, worker_id: &str) -> Result<u64, StoreError> {
        let query = format!(
            r#"UPDATE {table} SET locked_at = NULL, locked_by = NULL, updated_at = NOW() WHERE locked_by = $1"#,
            table = self.jobs_table()
        );
        let result = sqlx::query(&query).bind(worker_id).execute(&self.pool).await.map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SchedulerStore for PgJobStore {
    async fn reclaim_lost_jobs(&self, threshold: Duration) -> Result<u64, StoreError> {
        let query = format!(
            r#"
            UPDATE {table}
            SET locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE locked_at IS NOT NULL AND locked_at < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
            table = self.jobs_table()
        );
        let result = sqlx::query(&query).bind(threshold.num_milliseconds()).execute(&self.pool).await.map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn register_cron_entry(&self, entry: CronEntry) -> Result<(), StoreError> {
        let CronSchedule::Interval(interval) = entry.schedule;
        let query = format!(
            r#"
            INSERT INTO {table} (identifier, task_identifier, payload, database_id, interval_ms, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (identifier) DO NOTHING
            "#,
            table = self.cron_table()
        );
        sqlx::query(&query)
            .bind(&entry.identifier)
            .bind(&entry.task_identifier)
            .bind(&entry.payload)
            .bind(&entry.database_id)
            .bind(interval.num_milliseconds())
            .bind(entry.next_run_at)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn due_cron_entries(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>, StoreError> {
        let query = format!("SELECT * FROM {table} WHERE next_run_at <= $1", table = self.cron_table());
        let rows = sqlx::query(&query).bind(now).fetch_all(&self.pool).await.map_err(sqlx_err)?;
        Ok(rows.iter().map(Self::row_to_cron_entry).collect())
    }

    async fn fire_cron_entry(&self, identifier: &str, now: DateTime<Utc>, catch_up: CronCatchUp) -> Result<JobId, StoreError> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        let row = sqlx::query(&format!(
            "SELECT * FROM {table} WHERE identifier = $1 FOR UPDATE",
            table = self.cron_table()
        ))
        .bind(identifier)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::Query(format!("unknown cron entry {identifier}")))?;

        let entry = Self::row_to_cron_entry(&row);

        let insert_query = format!(
            r#"
            INSERT INTO {table} (task_identifier, payload, database_id, priority, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, NOW(), $5)
            RETURNING id
            "#,
            table = self.jobs_table()
        );
        // queue_name is left NULL: cron entries have no queue routing concept of their own.
        let job_row = sqlx::query(&insert_query)
            .bind(&entry.task_identifier)
            .bind(&entry.payload)
            .bind(&entry.database_id)
            .bind(DEFAULT_PRIORITY)
            .bind(DEFAULT_MAX_ATTEMPTS)
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_err)?;
        let job_id: JobId = job_row.get("id");

        let next_run_at = entry.schedule.next_after(entry.next_run_at, now, catch_up);
        sqlx::query(&format!(
            "UPDATE {table} SET next_run_at = $1 WHERE identifier = $2",
            table = self.cron_table()
        ))
        .bind(next_run_at)
        .bind(identifier)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;

        if let Err(error) = sqlx::query(&format!("NOTIFY {NOTIFY_CHANNEL}")).execute(&self.pool).await {
            warn!("failed to send jobs_insert notification: {}", error);
        }

        Ok(job_id)
    }
}

/// Subscribe to `jobs_insert` and invoke `on_notify` for every notification, until the
/// connection is lost. Kept outside the `JobStore` trait per the design notes: the
/// trait stays object-safe and testable against [`taskrunner_core::MemoryJobStore`],
/// which has no equivalent wakeup channel to implement.
pub async fn listen_for_notifications<F>(database_url: &str, mut on_notify: F) -> Result<(), StoreError>
where
    F: FnMut() + Send,
{
    let mut listener = PgListener::connect(database_url)
        .await
        .map_err(|error| StoreError::Unavailable(error.to_string()))?;
    listener.listen(NOTIFY_CHANNEL).await.map_err(sqlx_err)?;

    info!("listening for {} notifications", NOTIFY_CHANNEL);
    loop {
        listener.recv().await.map_err(sqlx_err)?;
        on_notify();
    }
}
