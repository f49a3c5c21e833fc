//! The `Job` type and the request shape used to enqueue one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unique, monotonically increasing job identifier.
pub type JobId = i64;

/// A unit of work claimed and executed by a single `Worker`.
///
/// Field names mirror the columns of the PostgreSQL adapter's `jobs` table so that
/// `sqlx::FromRow` can map a query result onto this struct directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Short string naming the remote function to invoke.
    pub task_identifier: String,
    /// Opaque JSON document carried to the function verbatim.
    pub payload: serde_json::Value,
    /// Multi-tenant routing hint passed through to the function in a header.
    pub database_id: String,
    /// Opaque routing label carried through from `NewJobOptions`; the store neither
    /// filters nor orders by it.
    pub queue_name: Option<String>,
    /// Lower runs first.
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A job is terminal-failed once its last attempt failed and no attempts remain.
    pub fn is_terminal_failed(&self) -> bool {
        self.locked_at.is_none() && self.last_error.is_some() && self.attempts >= self.max_attempts
    }
}

/// Optional overrides accepted by `JobStore::add_job`.
#[derive(Debug, Clone, Default)]
pub struct NewJobOptions {
    pub max_attempts: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
    pub queue_name: Option<String>,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_PRIORITY: i32 = 0;

impl NewJobOptions {
    pub fn max_attempts(mut self, value: i32) -> Self {
        self.max_attempts = Some(value);
        self
    }

    pub fn run_at(mut self, value: DateTime<Utc>) -> Self {
        self.run_at = Some(value);
        self
    }

    pub fn priority(mut self, value: i32) -> Self {
        self.priority = Some(value);
        self
    }

    pub fn queue_name(mut self, value: impl Into<String>) -> Self {
        self.queue_name = Some(value.into());
        self
    }
}
