//! Diesel ORM record structs for database tables.
//!
//! Records mirror the table column order exactly. JSON-valued attributes
//! are TEXT columns holding serde_json strings; timestamps are RFC 3339.

use diesel::prelude::*;

use crate::schema;

/// Import file record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::import_files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ImportFileRecord {
    pub id: String,
    pub catalog_id: String,
    pub origin: String,
    pub status: String,
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub storage_path: String,
    pub scheduled_import_id: Option<String>,
    pub is_duplicate: i32,
    pub metadata: String,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Import job record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::import_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ImportJobRecord {
    pub id: String,
    pub import_file_id: String,
    pub dataset_id: String,
    pub sheet_name: Option<String>,
    pub stage: String,
    pub rows_total: i64,
    pub rows_processed: i64,
    pub events_created: i64,
    pub geocoded_count: i64,
    pub duplicate_summary: String,
    pub schema_validation: String,
    pub geocode_summary: String,
    pub batch_size: i64,
    pub total_batches: i64,
    pub batches_completed: i64,
    pub error_log: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Scheduled import record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::scheduled_imports)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScheduledImportRecord {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub auth: String,
    pub schedule: String,
    pub webhook_token: String,
    pub webhook_enabled: i32,
    pub enabled: i32,
    pub catalog_id: String,
    pub dataset_id: Option<String>,
    pub created_by: String,
    pub retry: String,
    pub skip_duplicate_check: i32,
    pub expected_content_type: Option<String>,
    pub last_run: Option<String>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub next_run: Option<String>,
    pub execution_history: String,
    pub stats: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Dataset record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::datasets)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DatasetRecord {
    pub id: String,
    pub catalog_id: String,
    pub name: String,
    pub config: String,
    pub id_strategy: String,
    pub transformations: String,
    pub address_field: Option<String>,
    pub current_schema_version: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

/// Schema version record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::schema_versions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SchemaVersionRecord {
    pub id: i32,
    pub dataset_id: String,
    pub version: i32,
    pub fields: String,
    pub approved_by: Option<String>,
    pub created_at: String,
}

/// Event record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EventRecord {
    pub id: String,
    pub dataset_id: String,
    pub import_file_id: String,
    pub import_job_id: String,
    pub data: String,
    pub validation_status: String,
    pub transform_notes: String,
    pub row_hash: String,
    pub address: Option<String>,
    pub geocode: Option<String>,
    pub created_at: String,
}

/// Location cache record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::location_cache)]
#[diesel(primary_key(address))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LocationCacheRecord {
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub confidence: f64,
    pub provider: String,
    pub normalized_address: String,
    pub hits: i64,
    pub created_at: String,
}

/// Usage counter record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::usage_counters)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UsageCounterRecord {
    pub id: String,
    pub user_id: String,
    pub day: String,
    pub kind: String,
    pub count: i64,
}

/// Queued job record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::queued_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueuedJobRecord {
    pub id: String,
    pub task: String,
    pub payload: String,
    pub status: String,
    pub run_at: String,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
