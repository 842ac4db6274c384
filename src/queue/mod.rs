//! Database-backed job queue.
//!
//! Jobs are rows in `queued_jobs`; workers claim them with a conditional
//! UPDATE so a job runs at most once even with several workers polling the
//! same database. Completed jobs are deleted, failed jobs are kept with
//! their error for inspection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::repository::pool::{run_blocking, SqlitePool};
use crate::repository::parse_datetime;
use crate::schema::queued_jobs;

const STATUS_PENDING: &str = "pending";
const STATUS_RUNNING: &str = "running";
const STATUS_FAILED: &str = "failed";

/// How long a worker sleeps when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A unit of queued work. One variant per pipeline stage handler plus the
/// scheduled fetch that feeds the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "kebab-case")]
pub enum Task {
    FetchSource { scheduled_import_id: String },
    DatasetDetection { import_file_id: String },
    AnalyzeDuplicates { import_job_id: String },
    DetectSchema { import_job_id: String },
    ValidateSchema { import_job_id: String },
    CreateEvents { import_job_id: String, batch_index: u64 },
    GeocodeBatch { import_job_id: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::FetchSource { .. } => "fetch-source",
            Task::DatasetDetection { .. } => "dataset-detection",
            Task::AnalyzeDuplicates { .. } => "analyze-duplicates",
            Task::DetectSchema { .. } => "detect-schema",
            Task::ValidateSchema { .. } => "validate-schema",
            Task::CreateEvents { .. } => "create-events",
            Task::GeocodeBatch { .. } => "geocode-batch",
        }
    }
}

/// A claimed queue entry handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub task: Task,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
}

/// Handler dispatched by the worker loop for each claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Persistent queue over the `queued_jobs` table.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a task to run at or after `run_at`. Returns the queue id.
    pub async fn enqueue(&self, task: &Task, run_at: DateTime<Utc>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let queue_id = id.clone();
        let task_name = task.name().to_string();
        let payload = serde_json::to_string(task)
            .map_err(|e| ImportError::Validation(format!("unserializable task: {}", e)))?;
        let now = Utc::now().to_rfc3339();
        let run_at = run_at.to_rfc3339();

        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_into(queued_jobs::table)
                .values((
                    queued_jobs::id.eq(&id),
                    queued_jobs::task.eq(&task_name),
                    queued_jobs::payload.eq(&payload),
                    queued_jobs::status.eq(STATUS_PENDING),
                    queued_jobs::run_at.eq(&run_at),
                    queued_jobs::attempts.eq(0),
                    queued_jobs::created_at.eq(&now),
                    queued_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(queue_id)
    }

    /// Enqueue a task to run immediately.
    pub async fn enqueue_now(&self, task: &Task) -> Result<String> {
        self.enqueue(task, Utc::now()).await
    }

    /// Claim the oldest due pending job. The pending-to-running transition
    /// is a conditional UPDATE; zero rows affected means another worker won
    /// the race and we return nothing this round.
    pub async fn claim(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now().to_rfc3339();
        let claimed: Option<(String, String, i32, String)> =
            run_blocking(self.pool.clone(), move |conn| {
                let candidate: Option<(String, String, i32, String)> = queued_jobs::table
                    .filter(queued_jobs::status.eq(STATUS_PENDING))
                    .filter(queued_jobs::run_at.le(&now))
                    .order(queued_jobs::run_at.asc())
                    .select((
                        queued_jobs::id,
                        queued_jobs::payload,
                        queued_jobs::attempts,
                        queued_jobs::run_at,
                    ))
                    .first(conn)
                    .optional()?;

                let Some((id, payload, attempts, run_at)) = candidate else {
                    return Ok(None);
                };

                let rows = diesel::update(
                    queued_jobs::table
                        .find(&id)
                        .filter(queued_jobs::status.eq(STATUS_PENDING)),
                )
                .set((
                    queued_jobs::status.eq(STATUS_RUNNING),
                    queued_jobs::attempts.eq(queued_jobs::attempts + 1),
                    queued_jobs::updated_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)?;

                if rows == 1 {
                    Ok(Some((id, payload, attempts + 1, run_at)))
                } else {
                    Ok(None)
                }
            })
            .await?;

        let Some((id, payload, attempts, run_at)) = claimed else {
            return Ok(None);
        };
        let task: Task = serde_json::from_str(&payload)
            .map_err(|e| ImportError::Validation(format!("corrupt queue payload: {}", e)))?;
        Ok(Some(QueuedJob {
            id,
            task,
            attempts,
            run_at: parse_datetime(&run_at),
        }))
    }

    /// Remove a finished job from the queue.
    pub async fn complete(&self, queue_id: &str) -> Result<()> {
        let queue_id = queue_id.to_string();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::delete(queued_jobs::table.find(&queue_id)).execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Mark a job failed, keeping the row for inspection.
    pub async fn fail(&self, queue_id: &str, error: &str) -> Result<()> {
        let queue_id = queue_id.to_string();
        let error = error.to_string();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(queued_jobs::table.find(&queue_id))
                .set((
                    queued_jobs::status.eq(STATUS_FAILED),
                    queued_jobs::error.eq(Some(&error)),
                    queued_jobs::updated_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Number of pending jobs (due or not).
    pub async fn pending_count(&self) -> Result<i64> {
        let count = run_blocking(self.pool.clone(), move |conn| {
            queued_jobs::table
                .filter(queued_jobs::status.eq(STATUS_PENDING))
                .count()
                .first::<i64>(conn)
        })
        .await?;
        Ok(count)
    }
}

/// Polling worker that claims queue entries and dispatches them to a
/// [`TaskHandler`]. Handler errors fail the queue entry; the handler itself
/// is responsible for marking the domain objects failed.
pub struct Worker {
    queue: JobQueue,
    handler: Arc<dyn TaskHandler>,
}

impl Worker {
    pub fn new(queue: JobQueue, handler: Arc<dyn TaskHandler>) -> Self {
        Self { queue, handler }
    }

    /// Run until the queue is drained. Used by the one-shot CLI path and by
    /// tests; the long-running server spawns [`Worker::run_forever`].
    pub async fn run_until_idle(&self) -> Result<u64> {
        let mut processed = 0;
        while self.tick().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Run forever, sleeping between polls when the queue is empty.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            if !self.tick().await? {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    /// Claim and dispatch one job. Returns whether a job was processed.
    async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(false);
        };
        tracing::debug!(queue_id = %job.id, task = job.task.name(), "dispatching job");
        match self.handler.handle(&job.task).await {
            Ok(()) => self.queue.complete(&job.id).await?,
            Err(e) => {
                tracing::warn!(queue_id = %job.id, task = job.task.name(), error = %e, "task failed");
                self.queue.fail(&job.id, &e.to_string()).await?;
            }
        }
        Ok(true)
    }
}
