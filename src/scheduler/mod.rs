//! Due-schedule sweeping and the stuck-import reaper.
//!
//! Both entry points are periodic sweeps driven by the CLI or the server's
//! background loop. Per-schedule errors are counted and logged, never
//! allowed to abort the rest of a sweep.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::ScheduledImport;
use crate::queue::{JobQueue, Task};
use crate::repository::ScheduledImportRepository;

/// Imports running longer than this are presumed wedged.
pub const STUCK_TIMEOUT_HOURS: i64 = 2;

/// Ceiling on schedules reset in one reaper pass.
pub const REAPER_BATCH_LIMIT: i64 = 1000;

/// Outcome of one due-schedule sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: u64,
    pub triggered: u64,
    /// Due schedules skipped because they were already running.
    pub skipped_running: u64,
    pub errors: u64,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Schedules marked running when the pass started.
    pub total_running: u64,
    /// Schedules force-failed by this pass.
    pub reset_count: u64,
}

pub struct Scheduler {
    schedules: ScheduledImportRepository,
    queue: JobQueue,
}

impl Scheduler {
    pub fn new(schedules: ScheduledImportRepository, queue: JobQueue) -> Self {
        Self { schedules, queue }
    }

    /// Scan enabled schedules and enqueue a fetch for each one due at `now`.
    /// A schedule already running is skipped, mirroring the webhook path.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let enabled = self.schedules.list_enabled().await?;

        for schedule in enabled {
            if !schedule.schedule.is_due(schedule.last_run, now) {
                continue;
            }
            report.due += 1;
            match self.trigger(&schedule, now).await {
                Ok(true) => report.triggered += 1,
                Ok(false) => {
                    report.skipped_running += 1;
                    tracing::debug!(schedule = %schedule.id, "due but already running, skipped");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(schedule = %schedule.id, error = %e, "failed to trigger schedule");
                }
            }
        }

        tracing::info!(
            due = report.due,
            triggered = report.triggered,
            skipped = report.skipped_running,
            errors = report.errors,
            "schedule sweep finished"
        );
        Ok(report)
    }

    /// CAS the schedule into running and enqueue its fetch. Returns whether
    /// this caller won the swap.
    pub async fn trigger(&self, schedule: &ScheduledImport, now: DateTime<Utc>) -> Result<bool> {
        if !self.schedules.try_mark_running(&schedule.id, now).await? {
            return Ok(false);
        }
        self.queue
            .enqueue_now(&Task::FetchSource {
                scheduled_import_id: schedule.id.clone(),
            })
            .await?;
        Ok(true)
    }

    /// Force-fail schedules wedged in `running` beyond the timeout. Bounded
    /// per pass and idempotent: the conditional reset makes a second pass
    /// over the same schedule a no-op.
    pub async fn reap_stuck(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let total_running = self.schedules.count_running().await?.max(0) as u64;
        let cutoff = now - Duration::hours(STUCK_TIMEOUT_HOURS);
        let stuck = self
            .schedules
            .list_stuck_running(cutoff, REAPER_BATCH_LIMIT)
            .await?;

        let mut reset_count = 0u64;
        for schedule in stuck {
            let error = format!(
                "import stuck in running state for over {} hours, reset by reaper",
                STUCK_TIMEOUT_HOURS
            );
            match self.schedules.force_fail_stuck(&schedule.id, &error).await {
                Ok(true) => {
                    reset_count += 1;
                    tracing::warn!(schedule = %schedule.id, "reset stuck import");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(schedule = %schedule.id, error = %e, "failed to reset stuck import");
                }
            }
        }

        Ok(ReapReport {
            total_running,
            reset_count,
        })
    }
}
