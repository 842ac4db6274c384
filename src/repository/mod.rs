//! Database access for pipeline state.
//!
//! One repository per aggregate, each a thin wrapper over the shared r2d2
//! pool. Repositories convert between Diesel records and domain models and
//! host the atomic operations (compare-and-swap status transitions, counter
//! increments) the concurrency model depends on.

mod datasets;
mod events;
mod import_files;
mod import_jobs;
mod location_cache;
pub mod pool;
mod records;
mod scheduled_imports;
mod usage;

pub use datasets::DatasetRepository;
pub use events::EventRepository;
pub use import_files::ImportFileRepository;
pub use import_jobs::ImportJobRepository;
pub use location_cache::LocationCacheRepository;
pub use pool::{create_pool, create_pool_from_url, init_schema, run_blocking, SqlitePool};
pub use scheduled_imports::ScheduledImportRepository;
pub use usage::UsageRepository;

use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp column, falling back to the epoch for
/// malformed values rather than failing the whole row.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
}

/// Parse an optional RFC 3339 timestamp column.
pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared test database setup.

    use super::pool::{create_pool_from_url, init_schema, run_blocking, SqlitePool};

    /// Create a pooled temp-file database with the full schema.
    pub async fn setup_test_db() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = create_pool_from_url(&db_path.display().to_string()).unwrap();

        run_blocking(pool.clone(), |conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
        .unwrap();

        (pool, dir)
    }
}
