//! Rate limiting and quota enforcement at the pipeline's entry points.
//!
//! The webhook limiter is backed by a hit log in the database so every
//! process sharing the store sees the same windows. Quota checks run
//! before anything is queued; a refused action consumes nothing.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::error::{ImportError, Result};
use crate::models::{QuotaKind, TrustLevel, UNLIMITED};
use crate::repository::pool::{run_blocking, SqlitePool};
use crate::repository::{ScheduledImportRepository, UsageRepository};
use crate::schema::webhook_hits;

/// Burst window: one trigger per ten seconds per token.
pub const BURST_WINDOW_SECS: i64 = 10;
/// Hourly ceiling per token.
pub const HOURLY_LIMIT: i64 = 5;
const HOUR_SECS: i64 = 3_600;

/// Which window refused a webhook trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Burst,
    Hourly,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Burst => "burst",
            LimitType::Hourly => "hourly",
        }
    }
}

/// Outcome of a webhook rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited {
        limit_type: LimitType,
        /// Seconds until a retry can succeed.
        retry_after_secs: u64,
        message: String,
    },
}

/// Per-token webhook rate limiter over the shared hit log.
#[derive(Clone)]
pub struct WebhookRateLimiter {
    pool: SqlitePool,
}

impl WebhookRateLimiter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Check both windows for `token` and record the hit when allowed.
    /// The burst window is checked before the hourly one.
    pub async fn check(&self, token: &str, now: DateTime<Utc>) -> Result<RateLimitDecision> {
        let token = token.to_string();
        let now_ms = now.timestamp_millis();
        let burst_cutoff = now_ms - BURST_WINDOW_SECS * 1_000;
        let hour_cutoff = now_ms - HOUR_SECS * 1_000;

        let decision = run_blocking(self.pool.clone(), move |conn| {
            // Entries older than the hourly window can never matter again.
            diesel::delete(
                webhook_hits::table
                    .filter(webhook_hits::token.eq(&token))
                    .filter(webhook_hits::timestamp_ms.lt(hour_cutoff)),
            )
            .execute(conn)?;

            let newest: Option<i64> = webhook_hits::table
                .filter(webhook_hits::token.eq(&token))
                .filter(webhook_hits::timestamp_ms.ge(burst_cutoff))
                .select(diesel::dsl::max(webhook_hits::timestamp_ms))
                .first(conn)?;
            if let Some(newest) = newest {
                let elapsed_secs = (now_ms - newest) / 1_000;
                let retry_after = (BURST_WINDOW_SECS - elapsed_secs).max(1) as u64;
                return Ok(RateLimitDecision::Limited {
                    limit_type: LimitType::Burst,
                    retry_after_secs: retry_after,
                    message: format!("limited to 1 request per {} seconds", BURST_WINDOW_SECS),
                });
            }

            let hourly: Vec<i64> = webhook_hits::table
                .filter(webhook_hits::token.eq(&token))
                .filter(webhook_hits::timestamp_ms.ge(hour_cutoff))
                .select(webhook_hits::timestamp_ms)
                .order(webhook_hits::timestamp_ms.asc())
                .load(conn)?;
            if hourly.len() as i64 >= HOURLY_LIMIT {
                // The oldest hit in the window leaving it frees a slot.
                let oldest = hourly[0];
                let retry_after = ((oldest + HOUR_SECS * 1_000 - now_ms) / 1_000).max(1) as u64;
                return Ok(RateLimitDecision::Limited {
                    limit_type: LimitType::Hourly,
                    retry_after_secs: retry_after,
                    message: format!("limited to {} requests per hour", HOURLY_LIMIT),
                });
            }

            diesel::insert_into(webhook_hits::table)
                .values((
                    webhook_hits::token.eq(&token),
                    webhook_hits::timestamp_ms.eq(now_ms),
                ))
                .execute(conn)?;
            Ok(RateLimitDecision::Allowed)
        })
        .await?;
        Ok(decision)
    }
}

/// Quota enforcement for user-triggered actions. All checks happen before
/// queueing; a refusal is a [`ImportError::QuotaExceeded`].
#[derive(Clone)]
pub struct QuotaGuard {
    usage: UsageRepository,
    schedules: ScheduledImportRepository,
}

impl QuotaGuard {
    pub fn new(usage: UsageRepository, schedules: ScheduledImportRepository) -> Self {
        Self { usage, schedules }
    }

    /// Charge one upload against the daily ceiling.
    pub async fn charge_upload(&self, user_id: &str, trust: TrustLevel) -> Result<()> {
        self.charge(user_id, QuotaKind::Upload, trust.limits().uploads_per_day, 1)
            .await
    }

    /// Charge one URL fetch against the daily ceiling.
    pub async fn charge_url_fetch(&self, user_id: &str, trust: TrustLevel) -> Result<()> {
        self.charge(
            user_id,
            QuotaKind::UrlFetch,
            trust.limits().url_fetches_per_day,
            1,
        )
        .await
    }

    /// Charge one import job against the daily ceiling.
    pub async fn charge_import_job(&self, user_id: &str, trust: TrustLevel) -> Result<()> {
        self.charge(
            user_id,
            QuotaKind::ImportJob,
            trust.limits().import_jobs_per_day,
            1,
        )
        .await
    }

    /// Charge created events against the per-import and lifetime ceilings.
    pub async fn charge_events(
        &self,
        user_id: &str,
        trust: TrustLevel,
        count: u64,
    ) -> Result<()> {
        let limits = trust.limits();
        if limits.events_per_import != UNLIMITED && count as i64 > limits.events_per_import {
            return Err(ImportError::QuotaExceeded(format!(
                "import of {} events exceeds the per-import limit of {}",
                count, limits.events_per_import
            )));
        }
        self.charge(user_id, QuotaKind::TotalEvents, limits.total_events, count as i64)
            .await
    }

    /// Refuse files over the trust level's size ceiling.
    pub fn check_file_size(&self, trust: TrustLevel, size_bytes: u64) -> Result<()> {
        let limit = trust.limits().max_file_size_bytes;
        if limit != UNLIMITED && size_bytes as i64 > limit {
            return Err(ImportError::QuotaExceeded(format!(
                "file of {} bytes exceeds the size limit of {} bytes",
                size_bytes, limit
            )));
        }
        Ok(())
    }

    /// Refuse enabling more schedules than the trust level allows. Counts
    /// live state rather than a counter, so disabling frees a slot.
    pub async fn check_active_schedules(&self, user_id: &str, trust: TrustLevel) -> Result<()> {
        let limit = trust.limits().max_active_schedules;
        if limit == UNLIMITED {
            return Ok(());
        }
        let active = self.schedules.count_enabled_for_user(user_id).await?;
        if active >= limit {
            return Err(ImportError::QuotaExceeded(format!(
                "active schedule limit of {} reached",
                limit
            )));
        }
        Ok(())
    }

    async fn charge(
        &self,
        user_id: &str,
        kind: QuotaKind,
        limit: i64,
        amount: i64,
    ) -> Result<()> {
        let allowed = self
            .usage
            .check_and_increment(user_id, kind, limit, amount)
            .await?;
        if allowed {
            Ok(())
        } else {
            Err(ImportError::QuotaExceeded(format!(
                "{} limit of {} reached",
                kind.as_str(),
                limit
            )))
        }
    }
}
