//! Queue backends: where submitted executor jobs wait until they fire.
//!
//! Every job runs the executor for one task id. A backend keeps two views:
//! a ready queue drained by workers, and a table of scheduled jobs that
//! [`QueueBackend::promote_due`] moves onto the ready queue when they fall due.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskherd_core::config::{QueueBackendKind, QueueConfig};
use taskherd_core::error::Result;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Opaque handle of one submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub task_id: i64,
}

impl JobHandle {
    pub(crate) fn new(task_id: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
        }
    }
}

/// A job waiting in the scheduled table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub handle: JobHandle,
    pub fire_at: DateTime<Utc>,
    /// Set for recurring jobs.
    pub interval_secs: Option<u64>,
    /// How long a recurring job's record outlives its interval.
    pub retention_secs: Option<u64>,
}

impl ScheduledJob {
    /// Next fire time strictly after `now`, for recurring jobs.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = Duration::seconds(self.interval_secs.filter(|i| *i > 0)? as i64);
        let mut next = self.fire_at + interval;
        if next <= now {
            // Missed occurrences are skipped, not replayed.
            let behind = (now - next).num_seconds() / interval.num_seconds() + 1;
            next += interval * behind as i32;
        }
        Some(next)
    }
}

/// Contract of an external delayed-job queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;

    /// Queue the executor for immediate execution.
    async fn enqueue(&self, task_id: i64) -> Result<JobHandle>;

    /// Register a one-shot job at `at`.
    async fn schedule_at(&self, at: DateTime<Utc>, task_id: i64) -> Result<JobHandle>;

    /// Register a job that fires at `at` and then every `interval_secs`.
    async fn schedule_recurring(
        &self,
        at: DateTime<Utc>,
        task_id: i64,
        interval_secs: u64,
        retention_secs: u64,
    ) -> Result<JobHandle>;

    /// Cancel a job, wherever it waits. `Ok(false)` if no such job exists.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    /// Scheduled jobs with their next fire time.
    async fn list_scheduled(&self) -> Result<Vec<(JobHandle, DateTime<Utc>)>>;

    /// Move every job due at `now` onto the ready queue, re-arming recurring
    /// ones. Returns how many were promoted.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Take the next ready job, if any.
    async fn pop_ready(&self) -> Result<Option<JobHandle>>;
}

/// Construct the backend selected in configuration.
pub async fn from_config(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>> {
    match config.backend {
        QueueBackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        QueueBackendKind::Redis => Ok(Arc::new(
            RedisBackend::connect(&config.redis_url, &config.key_prefix).await?,
        )),
    }
}
