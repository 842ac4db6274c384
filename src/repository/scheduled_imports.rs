//! Repository for recurring fetch definitions.
//!
//! The `running` status guards against concurrent triggering. All
//! transitions into `running` go through [`ScheduledImportRepository::try_mark_running`],
//! a conditional update whose affected-row count is the compare-and-swap
//! result; concurrent callers racing on the same schedule see exactly one
//! success.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::ScheduledImportRecord;
use super::{parse_datetime, parse_datetime_opt};
use crate::error::{ImportError, Result};
use crate::models::{
    AuthConfig, ExecutionRecord, RetryConfig, Schedule, ScheduleStats, ScheduledImport,
    EXECUTION_HISTORY_CAP,
};
use crate::schema::scheduled_imports;

/// Status markers persisted in `last_status`.
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

impl From<ScheduledImportRecord> for ScheduledImport {
    fn from(record: ScheduledImportRecord) -> Self {
        ScheduledImport {
            id: record.id,
            name: record.name,
            source_url: record.source_url,
            auth: serde_json::from_str::<AuthConfig>(&record.auth).unwrap_or_default(),
            schedule: serde_json::from_str::<Schedule>(&record.schedule).unwrap_or(
                Schedule::Frequency {
                    frequency: crate::models::Frequency::Daily,
                },
            ),
            webhook_token: record.webhook_token,
            webhook_enabled: record.webhook_enabled != 0,
            enabled: record.enabled != 0,
            catalog_id: record.catalog_id,
            dataset_id: record.dataset_id,
            created_by: record.created_by,
            retry: serde_json::from_str::<RetryConfig>(&record.retry).unwrap_or_default(),
            skip_duplicate_check: record.skip_duplicate_check != 0,
            expected_content_type: record.expected_content_type,
            last_run: parse_datetime_opt(record.last_run),
            last_status: record.last_status,
            last_error: record.last_error,
            next_run: parse_datetime_opt(record.next_run),
            execution_history: serde_json::from_str::<Vec<ExecutionRecord>>(
                &record.execution_history,
            )
            .unwrap_or_default(),
            stats: serde_json::from_str::<ScheduleStats>(&record.stats).unwrap_or_default(),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

/// Repository for [`ScheduledImport`] documents.
#[derive(Clone)]
pub struct ScheduledImportRepository {
    pool: SqlitePool,
}

impl ScheduledImportRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate and insert a new schedule.
    pub async fn create(&self, import: &ScheduledImport) -> Result<()> {
        import.validate()?;
        let import = import.clone();
        let auth = serde_json::to_string(&import.auth).unwrap_or_else(|_| r#"{"type":"none"}"#.into());
        let schedule = serde_json::to_string(&import.schedule)
            .map_err(|e| ImportError::Validation(format!("unserializable schedule: {}", e)))?;
        let retry = serde_json::to_string(&import.retry).unwrap_or_else(|_| "{}".to_string());
        let history =
            serde_json::to_string(&import.execution_history).unwrap_or_else(|_| "[]".to_string());
        let stats = serde_json::to_string(&import.stats).unwrap_or_else(|_| "{}".to_string());

        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_into(scheduled_imports::table)
                .values((
                    scheduled_imports::id.eq(&import.id),
                    scheduled_imports::name.eq(&import.name),
                    scheduled_imports::source_url.eq(&import.source_url),
                    scheduled_imports::auth.eq(&auth),
                    scheduled_imports::schedule.eq(&schedule),
                    scheduled_imports::webhook_token.eq(&import.webhook_token),
                    scheduled_imports::webhook_enabled.eq(import.webhook_enabled as i32),
                    scheduled_imports::enabled.eq(import.enabled as i32),
                    scheduled_imports::catalog_id.eq(&import.catalog_id),
                    scheduled_imports::dataset_id.eq(&import.dataset_id),
                    scheduled_imports::created_by.eq(&import.created_by),
                    scheduled_imports::retry.eq(&retry),
                    scheduled_imports::skip_duplicate_check.eq(import.skip_duplicate_check as i32),
                    scheduled_imports::expected_content_type.eq(&import.expected_content_type),
                    scheduled_imports::last_run.eq(import.last_run.map(|t| t.to_rfc3339())),
                    scheduled_imports::last_status.eq(&import.last_status),
                    scheduled_imports::last_error.eq(&import.last_error),
                    scheduled_imports::next_run.eq(import.next_run.map(|t| t.to_rfc3339())),
                    scheduled_imports::execution_history.eq(&history),
                    scheduled_imports::stats.eq(&stats),
                    scheduled_imports::created_at.eq(import.created_at.to_rfc3339()),
                    scheduled_imports::updated_at.eq(import.updated_at.to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Get a schedule by id.
    pub async fn get(&self, id: &str) -> Result<Option<ScheduledImport>> {
        let id = id.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .find(&id)
                .first::<ScheduledImportRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(ScheduledImport::from))
    }

    /// Look up a schedule by its webhook token.
    pub async fn get_by_token(&self, token: &str) -> Result<Option<ScheduledImport>> {
        let token = token.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .filter(scheduled_imports::webhook_token.eq(&token))
                .first::<ScheduledImportRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(ScheduledImport::from))
    }

    /// All enabled schedules, for the due-schedule sweep.
    pub async fn list_enabled(&self) -> Result<Vec<ScheduledImport>> {
        let records = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .filter(scheduled_imports::enabled.eq(1))
                .load::<ScheduledImportRecord>(conn)
        })
        .await?;
        Ok(records.into_iter().map(ScheduledImport::from).collect())
    }

    /// Count enabled schedules owned by a user (active-schedule quota).
    pub async fn count_enabled_for_user(&self, user_id: &str) -> Result<i64> {
        let user_id = user_id.to_string();
        let count = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .filter(scheduled_imports::created_by.eq(&user_id))
                .filter(scheduled_imports::enabled.eq(1))
                .count()
                .first::<i64>(conn)
        })
        .await?;
        Ok(count)
    }

    /// Compare-and-swap into `running`. Returns whether the swap happened;
    /// a `false` means the schedule was already running.
    pub async fn try_mark_running(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        let now_str = now.to_rfc3339();
        let swapped = run_blocking(self.pool.clone(), move |conn| {
            let rows = diesel::update(
                scheduled_imports::table
                    .find(&id)
                    .filter(
                        scheduled_imports::last_status
                            .ne(STATUS_RUNNING)
                            .or(scheduled_imports::last_status.is_null()),
                    ),
            )
            .set((
                scheduled_imports::last_status.eq(STATUS_RUNNING),
                scheduled_imports::last_run.eq(Some(&now_str)),
                scheduled_imports::updated_at.eq(&now_str),
            ))
            .execute(conn)?;
            Ok(rows == 1)
        })
        .await?;
        Ok(swapped)
    }

    /// Persist the computed next fire time.
    pub async fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let id = id.to_string();
        let next = next_run.map(|t| t.to_rfc3339());
        let now = Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(scheduled_imports::table.find(&id))
                .set((
                    scheduled_imports::next_run.eq(&next),
                    scheduled_imports::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record a finished run: status, error, history ring, and stats.
    pub async fn record_completion(
        &self,
        id: &str,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    ) -> Result<()> {
        let import = self
            .get(id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("scheduled import {}", id)))?;

        let mut history = import.execution_history;
        history.insert(
            0,
            ExecutionRecord {
                started_at: import.last_run.unwrap_or_else(Utc::now),
                status: if success {
                    STATUS_COMPLETED.to_string()
                } else {
                    STATUS_FAILED.to_string()
                },
                duration_ms: Some(duration_ms),
                error: error.clone(),
            },
        );
        history.truncate(EXECUTION_HISTORY_CAP);

        let mut stats = import.stats;
        stats.record_run(success, duration_ms);

        let id = id.to_string();
        let status = if success { STATUS_COMPLETED } else { STATUS_FAILED };
        let history_json = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());
        let stats_json = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        let now = Utc::now().to_rfc3339();

        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(scheduled_imports::table.find(&id))
                .set((
                    scheduled_imports::last_status.eq(status),
                    scheduled_imports::last_error.eq(&error),
                    scheduled_imports::execution_history.eq(&history_json),
                    scheduled_imports::stats.eq(&stats_json),
                    scheduled_imports::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Schedules stuck in `running` since before the cutoff, oldest first,
    /// capped for one reaper pass.
    pub async fn list_stuck_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledImport>> {
        let cutoff_str = cutoff.to_rfc3339();
        let records = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .filter(scheduled_imports::last_status.eq(STATUS_RUNNING))
                .filter(scheduled_imports::last_run.lt(&cutoff_str))
                .order(scheduled_imports::last_run.asc())
                .limit(limit)
                .load::<ScheduledImportRecord>(conn)
        })
        .await?;
        Ok(records.into_iter().map(ScheduledImport::from).collect())
    }

    /// Count all schedules currently marked running.
    pub async fn count_running(&self) -> Result<i64> {
        let count = run_blocking(self.pool.clone(), move |conn| {
            scheduled_imports::table
                .filter(scheduled_imports::last_status.eq(STATUS_RUNNING))
                .count()
                .first::<i64>(conn)
        })
        .await?;
        Ok(count)
    }

    /// Force-fail one stuck schedule. Conditional on still being `running`,
    /// so a second reaper pass over the same schedule is a no-op.
    pub async fn force_fail_stuck(&self, id: &str, error: &str) -> Result<bool> {
        let import = match self.get(id).await? {
            Some(i) => i,
            None => return Ok(false),
        };

        let mut history = import.execution_history;
        history.insert(
            0,
            ExecutionRecord {
                started_at: import.last_run.unwrap_or_else(Utc::now),
                status: STATUS_FAILED.to_string(),
                duration_ms: None,
                error: Some(error.to_string()),
            },
        );
        history.truncate(EXECUTION_HISTORY_CAP);

        let mut stats = import.stats;
        stats.record_run(false, 0);

        let id = id.to_string();
        let error = error.to_string();
        let history_json = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());
        let stats_json = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        let now = Utc::now().to_rfc3339();

        let reset = run_blocking(self.pool.clone(), move |conn| {
            let rows = diesel::update(
                scheduled_imports::table
                    .find(&id)
                    .filter(scheduled_imports::last_status.eq(STATUS_RUNNING)),
            )
            .set((
                scheduled_imports::last_status.eq(STATUS_FAILED),
                scheduled_imports::last_error.eq(Some(&error)),
                scheduled_imports::execution_history.eq(&history_json),
                scheduled_imports::stats.eq(&stats_json),
                scheduled_imports::updated_at.eq(&now),
            ))
            .execute(conn)?;
            Ok(rows == 1)
        })
        .await?;
        Ok(reset)
    }

    /// Delete a schedule.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let deleted = run_blocking(self.pool.clone(), move |conn| {
            let rows = diesel::delete(scheduled_imports::table.find(&id)).execute(conn)?;
            Ok(rows > 0)
        })
        .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frequency;
    use crate::repository::test_support::setup_test_db;

    fn sample_import() -> ScheduledImport {
        ScheduledImport::new(
            "nightly crimes".into(),
            "https://example.com/crimes.csv".into(),
            Schedule::Frequency {
                frequency: Frequency::Daily,
            },
            "catalog-1".into(),
            "user-1".into(),
        )
    }

    #[tokio::test]
    async fn test_create_and_token_lookup() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ScheduledImportRepository::new(pool);

        let import = sample_import();
        repo.create(&import).await.unwrap();

        let by_token = repo
            .get_by_token(&import.webhook_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_token.id, import.id);
        assert!(repo.get_by_token("no-such-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_allows_exactly_one_transition() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ScheduledImportRepository::new(pool);

        let import = sample_import();
        repo.create(&import).await.unwrap();

        let now = Utc::now();
        assert!(repo.try_mark_running(&import.id, now).await.unwrap());
        // Second attempt loses the swap.
        assert!(!repo.try_mark_running(&import.id, now).await.unwrap());

        // After completion the swap is available again.
        repo.record_completion(&import.id, true, 120, None)
            .await
            .unwrap();
        assert!(repo.try_mark_running(&import.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_force_fail_stuck_is_idempotent() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ScheduledImportRepository::new(pool);

        let import = sample_import();
        repo.create(&import).await.unwrap();
        repo.try_mark_running(&import.id, Utc::now()).await.unwrap();

        assert!(repo
            .force_fail_stuck(&import.id, "stuck for over 2 hours")
            .await
            .unwrap());
        // Already failed: nothing left to reset.
        assert!(!repo
            .force_fail_stuck(&import.id, "stuck for over 2 hours")
            .await
            .unwrap());

        let fetched = repo.get(&import.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_status.as_deref(), Some(STATUS_FAILED));
        assert!(fetched.execution_history[0]
            .error
            .as_deref()
            .unwrap()
            .contains("stuck"));
    }

    #[tokio::test]
    async fn test_stuck_listing_respects_cutoff() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ScheduledImportRepository::new(pool);

        let import = sample_import();
        repo.create(&import).await.unwrap();

        let three_hours_ago = Utc::now() - chrono::Duration::hours(3);
        repo.try_mark_running(&import.id, three_hours_ago)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(2);
        let stuck = repo.list_stuck_running(cutoff, 1000).await.unwrap();
        assert_eq!(stuck.len(), 1);

        // A fresh run is not stuck.
        repo.record_completion(&import.id, true, 10, None).await.unwrap();
        repo.try_mark_running(&import.id, Utc::now()).await.unwrap();
        let stuck = repo.list_stuck_running(cutoff, 1000).await.unwrap();
        assert!(stuck.is_empty());
    }

    #[tokio::test]
    async fn test_completion_updates_history_and_stats() {
        let (pool, _dir) = setup_test_db().await;
        let repo = ScheduledImportRepository::new(pool);

        let import = sample_import();
        repo.create(&import).await.unwrap();
        repo.try_mark_running(&import.id, Utc::now()).await.unwrap();
        repo.record_completion(&import.id, false, 250, Some("HTTP 500".into()))
            .await
            .unwrap();

        let fetched = repo.get(&import.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_status.as_deref(), Some(STATUS_FAILED));
        assert_eq!(fetched.stats.failed_runs, 1);
        assert_eq!(fetched.execution_history.len(), 1);
        assert_eq!(fetched.execution_history[0].error.as_deref(), Some("HTTP 500"));
    }
}
