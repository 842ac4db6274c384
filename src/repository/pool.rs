//! Diesel connection pool management for SQLite.
//!
//! Workers are distributed processes, so all coordination happens through
//! the database: WAL journaling for concurrent readers, a busy timeout for
//! writer contention, and single-statement updates for the atomic
//! increment/compare-and-swap operations the pipeline relies on.
//! Diesel's async support does not cover SQLite, so operations run as sync
//! Diesel wrapped in `spawn_blocking`.

use std::path::Path;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// r2d2 pool error type alias.
pub type R2D2Error = diesel::r2d2::PoolError;

/// Connection pool for SQLite using r2d2.
pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Pooled connection type.
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Create a Diesel connection pool for SQLite.
pub fn create_pool(db_path: &Path) -> Result<SqlitePool, R2D2Error> {
    create_pool_from_url(&db_path.display().to_string())
}

/// Create a Diesel connection pool from a database URL.
pub fn create_pool_from_url(database_url: &str) -> Result<SqlitePool, R2D2Error> {
    let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    let manager = ConnectionManager::<SqliteConnection>::new(url);

    Pool::builder()
        .max_size(10)
        .connection_timeout(Duration::from_secs(30))
        .connection_customizer(Box::new(ConnectionPragmas))
        .build(manager)
}

/// Applies the SQLite pragmas to every connection the pool hands out.
#[derive(Debug)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        init_connection_pragmas(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Initialize SQLite pragmas for a connection.
fn init_connection_pragmas(conn: &mut SqliteConnection) -> Result<(), DieselError> {
    diesel::sql_query("PRAGMA journal_mode = WAL").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous = NORMAL").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys = ON").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout = 30000").execute(conn)?;
    Ok(())
}

/// Create all pipeline tables if they do not exist.
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), DieselError> {
    for statement in SCHEMA_SQL {
        diesel::sql_query(*statement).execute(conn)?;
    }
    Ok(())
}

const SCHEMA_SQL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS import_files (
        id TEXT PRIMARY KEY,
        catalog_id TEXT NOT NULL,
        origin TEXT NOT NULL,
        status TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes BIGINT NOT NULL,
        storage_path TEXT NOT NULL,
        scheduled_import_id TEXT,
        is_duplicate INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_import_files_catalog_hash
        ON import_files(catalog_id, content_hash)"#,
    r#"CREATE TABLE IF NOT EXISTS import_jobs (
        id TEXT PRIMARY KEY,
        import_file_id TEXT NOT NULL,
        dataset_id TEXT NOT NULL,
        sheet_name TEXT,
        stage TEXT NOT NULL,
        rows_total BIGINT NOT NULL DEFAULT 0,
        rows_processed BIGINT NOT NULL DEFAULT 0,
        events_created BIGINT NOT NULL DEFAULT 0,
        geocoded_count BIGINT NOT NULL DEFAULT 0,
        duplicate_summary TEXT NOT NULL DEFAULT '{}',
        schema_validation TEXT NOT NULL DEFAULT '{}',
        geocode_summary TEXT NOT NULL DEFAULT '{}',
        batch_size BIGINT NOT NULL DEFAULT 100,
        total_batches BIGINT NOT NULL DEFAULT 0,
        batches_completed BIGINT NOT NULL DEFAULT 0,
        error_log TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_import_jobs_file
        ON import_jobs(import_file_id)"#,
    r#"CREATE TABLE IF NOT EXISTS scheduled_imports (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        source_url TEXT NOT NULL,
        auth TEXT NOT NULL DEFAULT '{"type":"none"}',
        schedule TEXT NOT NULL,
        webhook_token TEXT NOT NULL UNIQUE,
        webhook_enabled INTEGER NOT NULL DEFAULT 1,
        enabled INTEGER NOT NULL DEFAULT 1,
        catalog_id TEXT NOT NULL,
        dataset_id TEXT,
        created_by TEXT NOT NULL,
        retry TEXT NOT NULL DEFAULT '{}',
        skip_duplicate_check INTEGER NOT NULL DEFAULT 0,
        expected_content_type TEXT,
        last_run TEXT,
        last_status TEXT,
        last_error TEXT,
        next_run TEXT,
        execution_history TEXT NOT NULL DEFAULT '[]',
        stats TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        catalog_id TEXT NOT NULL,
        name TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        id_strategy TEXT NOT NULL DEFAULT '{"type":"computed-hash"}',
        transformations TEXT NOT NULL DEFAULT '[]',
        address_field TEXT,
        current_schema_version INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS schema_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dataset_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        fields TEXT NOT NULL,
        approved_by TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(dataset_id, version)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        import_file_id TEXT NOT NULL,
        import_job_id TEXT NOT NULL,
        data TEXT NOT NULL,
        validation_status TEXT NOT NULL,
        transform_notes TEXT NOT NULL DEFAULT '[]',
        row_hash TEXT NOT NULL,
        address TEXT,
        geocode TEXT,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_events_dataset_hash
        ON events(dataset_id, row_hash)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_events_job
        ON events(import_job_id)"#,
    r#"CREATE TABLE IF NOT EXISTS location_cache (
        address TEXT PRIMARY KEY,
        latitude DOUBLE NOT NULL,
        longitude DOUBLE NOT NULL,
        confidence DOUBLE NOT NULL,
        provider TEXT NOT NULL,
        normalized_address TEXT NOT NULL,
        hits BIGINT NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS usage_counters (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        day TEXT NOT NULL,
        kind TEXT NOT NULL,
        count BIGINT NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS webhook_hits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL,
        timestamp_ms BIGINT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_webhook_hits_token_time
        ON webhook_hits(token, timestamp_ms)"#,
    r#"CREATE TABLE IF NOT EXISTS queued_jobs (
        id TEXT PRIMARY KEY,
        task TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        run_at TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_queued_jobs_status_run_at
        ON queued_jobs(status, run_at)"#,
];

/// Run a blocking Diesel operation asynchronously.
///
/// Wraps a sync closure in `spawn_blocking` so Diesel operations can be
/// used in async contexts without blocking the runtime.
pub async fn run_blocking<F, T>(pool: SqlitePool, f: F) -> Result<T, DieselError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, DieselError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| {
            DieselError::DatabaseError(
                diesel::result::DatabaseErrorKind::Unknown,
                Box::new(e.to_string()),
            )
        })?;
        f(&mut conn)
    })
    .await
    .map_err(|e| {
        DieselError::DatabaseError(
            diesel::result::DatabaseErrorKind::Unknown,
            Box::new(e.to_string()),
        )
    })?
}
