//! Atomic quota usage counters.
//!
//! Daily counters are bucketed by date key; lifetime counters share one
//! bucket. Check-and-increment is a single conditional UPDATE so that
//! concurrent workers cannot both consume the last unit of a quota.

use chrono::Utc;
use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use crate::error::Result;
use crate::models::{QuotaKind, UNLIMITED};
use crate::schema::usage_counters;

/// Bucket key for lifetime counters.
const LIFETIME_DAY: &str = "-";

fn day_key(kind: QuotaKind) -> String {
    if kind.resets_daily() {
        Utc::now().format("%Y-%m-%d").to_string()
    } else {
        LIFETIME_DAY.to_string()
    }
}

fn counter_id(user_id: &str, kind: QuotaKind, day: &str) -> String {
    format!("{}:{}:{}", user_id, day, kind.as_str())
}

/// Repository for per-user usage counters.
#[derive(Clone)]
pub struct UsageRepository {
    pool: SqlitePool,
}

impl UsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Consume `amount` units against `limit`. Returns whether the quota
    /// had room; on `false` nothing was consumed. A limit of `-1` always
    /// succeeds and still counts usage.
    pub async fn check_and_increment(
        &self,
        user_id: &str,
        kind: QuotaKind,
        limit: i64,
        amount: i64,
    ) -> Result<bool> {
        let day = day_key(kind);
        let id = counter_id(user_id, kind, &day);
        let user_id = user_id.to_string();
        let kind_str = kind.as_str().to_string();

        let allowed = run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_or_ignore_into(usage_counters::table)
                .values((
                    usage_counters::id.eq(&id),
                    usage_counters::user_id.eq(&user_id),
                    usage_counters::day.eq(&day),
                    usage_counters::kind.eq(&kind_str),
                    usage_counters::count.eq(0),
                ))
                .execute(conn)?;

            if limit == UNLIMITED {
                diesel::update(usage_counters::table.find(&id))
                    .set(usage_counters::count.eq(usage_counters::count + amount))
                    .execute(conn)?;
                return Ok(true);
            }

            // Single-statement check-and-consume.
            let rows = diesel::update(
                usage_counters::table
                    .find(&id)
                    .filter(usage_counters::count.le(limit - amount)),
            )
            .set(usage_counters::count.eq(usage_counters::count + amount))
            .execute(conn)?;
            Ok(rows == 1)
        })
        .await?;
        Ok(allowed)
    }

    /// Current count for today's (or the lifetime) bucket.
    pub async fn current(&self, user_id: &str, kind: QuotaKind) -> Result<i64> {
        let id = counter_id(user_id, kind, &day_key(kind));
        let count = run_blocking(self.pool.clone(), move |conn| {
            usage_counters::table
                .find(&id)
                .select(usage_counters::count)
                .first::<i64>(conn)
                .optional()
        })
        .await?;
        Ok(count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::setup_test_db;

    #[tokio::test]
    async fn test_limit_enforced_at_boundary() {
        let (pool, _dir) = setup_test_db().await;
        let repo = UsageRepository::new(pool);

        for _ in 0..3 {
            assert!(repo
                .check_and_increment("user-1", QuotaKind::Upload, 3, 1)
                .await
                .unwrap());
        }
        // Fourth upload of the day is refused and not counted.
        assert!(!repo
            .check_and_increment("user-1", QuotaKind::Upload, 3, 1)
            .await
            .unwrap());
        assert_eq!(repo.current("user-1", QuotaKind::Upload).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unlimited_sentinel_always_allows() {
        let (pool, _dir) = setup_test_db().await;
        let repo = UsageRepository::new(pool);

        for _ in 0..10 {
            assert!(repo
                .check_and_increment("admin", QuotaKind::UrlFetch, UNLIMITED, 1)
                .await
                .unwrap());
        }
        assert_eq!(repo.current("admin", QuotaKind::UrlFetch).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_bulk_amount_refused_when_it_would_overflow() {
        let (pool, _dir) = setup_test_db().await;
        let repo = UsageRepository::new(pool);

        assert!(repo
            .check_and_increment("user-1", QuotaKind::TotalEvents, 100, 60)
            .await
            .unwrap());
        assert!(!repo
            .check_and_increment("user-1", QuotaKind::TotalEvents, 100, 60)
            .await
            .unwrap());
        assert_eq!(
            repo.current("user-1", QuotaKind::TotalEvents).await.unwrap(),
            60
        );
    }

    #[tokio::test]
    async fn test_users_do_not_share_buckets() {
        let (pool, _dir) = setup_test_db().await;
        let repo = UsageRepository::new(pool);

        assert!(repo
            .check_and_increment("user-1", QuotaKind::Upload, 1, 1)
            .await
            .unwrap());
        assert!(repo
            .check_and_increment("user-2", QuotaKind::Upload, 1, 1)
            .await
            .unwrap());
    }
}
