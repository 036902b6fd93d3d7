//! Redis queue backend, shared by every worker pointed at the same server.
//!
//! Keys, under a configurable prefix:
//! - `<prefix>:ready`: list of job ids waiting for a worker
//! - `<prefix>:scheduled`: sorted set of job ids scored by fire time (epoch seconds)
//! - `<prefix>:job:<id>`: JSON job document
//!
//! Recurring job documents expire `interval + retention` seconds after their
//! next fire time, so a job nobody promotes anymore eventually disappears.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use taskherd_core::error::{Result, TaskherdError};

use super::{JobHandle, QueueBackend, ScheduledJob};

/// Key layout under one prefix.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn ready(&self) -> String {
        format!("{}:ready", self.prefix)
    }

    fn scheduled(&self) -> String {
        format!("{}:scheduled", self.prefix)
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{id}", self.prefix)
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    keys: Keys,
}

impl RedisBackend {
    /// Connect to `url`. Fails if the server cannot be reached.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(queue_err)?;
        let conn = ConnectionManager::new(client).await.map_err(queue_err)?;
        tracing::info!("🔌 Redis queue backend connected (prefix '{prefix}')");
        Ok(Self {
            conn,
            keys: Keys {
                prefix: prefix.to_string(),
            },
        })
    }

    async fn load(&self, id: &str) -> Result<Option<ScheduledJob>> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = conn.get(self.keys.job(id)).await.map_err(queue_err)?;
        match doc {
            Some(doc) => serde_json::from_str(&doc)
                .map(Some)
                .map_err(|e| TaskherdError::Queue(format!("corrupt job document {id}: {e}"))),
            None => Ok(None),
        }
    }

    /// Queue the document write and the sorted-set entry of `job`.
    fn stage(
        &self,
        pipe: &mut redis::Pipeline,
        job: &ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let doc = serde_json::to_string(job)
            .map_err(|e| TaskherdError::Queue(format!("serialize job: {e}")))?;
        let key = self.keys.job(&job.handle.id);
        match ttl(job, now) {
            Some(secs) => pipe.set_ex(&key, doc, secs),
            None => pipe.set(&key, doc),
        };
        pipe.zadd(self.keys.scheduled(), &job.handle.id, score(job.fire_at));
        Ok(())
    }

    async fn schedule(&self, job: ScheduledJob) -> Result<JobHandle> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.stage(&mut pipe, &job, Utc::now())?;

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(queue_err)?;
        Ok(job.handle)
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, task_id: i64) -> Result<JobHandle> {
        let handle = JobHandle::new(task_id);
        let job = ScheduledJob {
            handle: handle.clone(),
            fire_at: Utc::now(),
            interval_secs: None,
            retention_secs: None,
        };
        let doc = serde_json::to_string(&job)
            .map_err(|e| TaskherdError::Queue(format!("serialize job: {e}")))?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(&handle.id), doc)
            .rpush(self.keys.ready(), &handle.id)
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(handle)
    }

    async fn schedule_at(&self, at: DateTime<Utc>, task_id: i64) -> Result<JobHandle> {
        self.schedule(ScheduledJob {
            handle: JobHandle::new(task_id),
            fire_at: at,
            interval_secs: None,
            retention_secs: None,
        })
        .await
    }

    async fn schedule_recurring(
        &self,
        at: DateTime<Utc>,
        task_id: i64,
        interval_secs: u64,
        retention_secs: u64,
    ) -> Result<JobHandle> {
        self.schedule(ScheduledJob {
            handle: JobHandle::new(task_id),
            fire_at: at,
            interval_secs: Some(interval_secs),
            retention_secs: Some(retention_secs),
        })
        .await
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (zrem, lrem, del): (i64, i64, i64) = redis::pipe()
            .atomic()
            .zrem(self.keys.scheduled(), job_id)
            .lrem(self.keys.ready(), 0, job_id)
            .del(self.keys.job(job_id))
            .query_async(&mut conn)
            .await
            .map_err(queue_err)?;
        Ok(zrem + lrem + del > 0)
    }

    async fn list_scheduled(&self) -> Result<Vec<(JobHandle, DateTime<Utc>)>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrange(self.keys.scheduled(), 0, -1)
            .await
            .map_err(queue_err)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await? {
                Some(job) => jobs.push((job.handle, job.fire_at)),
                None => tracing::warn!(job_id = %id, "Scheduled job has no document, skipping"),
            }
        }
        Ok(jobs)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(self.keys.scheduled(), "-inf", score(now))
            .await
            .map_err(queue_err)?;

        let mut promoted = 0;
        for id in due {
            // Whoever removes the member owns this occurrence.
            let claimed: i64 = conn
                .zrem(self.keys.scheduled(), &id)
                .await
                .map_err(queue_err)?;
            if claimed == 0 {
                continue;
            }
            let Some(job) = self.load(&id).await? else {
                tracing::warn!(job_id = %id, "Due job has no document, dropping");
                continue;
            };

            let mut pipe = redis::pipe();
            pipe.atomic().rpush(self.keys.ready(), &id);
            if let Some(rearmed) = rearm(&job, now) {
                self.stage(&mut pipe, &rearmed, now)?;
            }
            let _: () = pipe.query_async(&mut conn).await.map_err(queue_err)?;
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn pop_ready(&self) -> Result<Option<JobHandle>> {
        let mut conn = self.conn.clone();
        loop {
            let id: Option<String> = conn
                .lpop(self.keys.ready(), None)
                .await
                .map_err(queue_err)?;
            let Some(id) = id else {
                return Ok(None);
            };
            let Some(job) = self.load(&id).await? else {
                tracing::warn!(job_id = %id, "Dropping ready job without a document");
                continue;
            };
            if job.interval_secs.is_none() {
                let _: i64 = conn.del(self.keys.job(&id)).await.map_err(queue_err)?;
            }
            return Ok(Some(job.handle));
        }
    }
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Document lifetime: recurring jobs live until their fire time plus one
/// interval and the retention; one-shot jobs never expire.
fn ttl(job: &ScheduledJob, now: DateTime<Utc>) -> Option<u64> {
    let interval = job.interval_secs?;
    let until_fire = (job.fire_at - now).num_seconds().max(0) as u64;
    Some(until_fire + interval + job.retention_secs.unwrap_or(0))
}

/// The next occurrence of a recurring job promoted at `now`.
fn rearm(job: &ScheduledJob, now: DateTime<Utc>) -> Option<ScheduledJob> {
    let next = job.next_after(now)?;
    Some(ScheduledJob {
        fire_at: next,
        ..job.clone()
    })
}

fn queue_err(e: redis::RedisError) -> TaskherdError {
    TaskherdError::Queue(format!("redis: {e}"))
}
