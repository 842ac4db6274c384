//! Pipeline execution units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;

/// Default number of rows materialized per create-events batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Progress counters updated as stages complete.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub rows_total: u64,
    pub rows_processed: u64,
    pub events_created: u64,
    pub geocoded_count: u64,
}

/// Duplicate analysis summary for one job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DuplicateSummary {
    pub total_rows: u64,
    pub unique_rows: u64,
    /// Rows repeated within the same file/sheet.
    pub internal_duplicates: u64,
    /// Rows matching events already imported into the dataset.
    pub external_duplicates: u64,
}

/// Schema validation sub-record driving the await-approval suspend state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaValidation {
    pub requires_approval: bool,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    /// Whether the pending diff was classified as breaking.
    pub breaking: bool,
    /// Human-readable description of the schema diff.
    #[serde(default)]
    pub diff_summary: Vec<String>,
}

/// Batch geocoding summary persisted by the geocode-batch stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GeocodeSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub cached: u64,
}

/// One unit of pipeline work for a (file, sheet/dataset) pair.
///
/// A multi-sheet ImportFile fans out into one ImportJob per mapped sheet;
/// each job progresses through the stage machine independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub import_file_id: String,
    pub dataset_id: String,
    /// Sheet this job covers; `None` for single-table sources (CSV).
    pub sheet_name: Option<String>,
    pub stage: Stage,
    pub progress: JobProgress,
    pub duplicates: DuplicateSummary,
    pub schema_validation: SchemaValidation,
    pub geocode_summary: GeocodeSummary,
    pub batch_size: u64,
    /// `ceil(rows_total / batch_size)`, fixed at dataset-detection time.
    pub total_batches: u64,
    /// Atomically incremented as create-events batches finish, in any order.
    pub batches_completed: u64,
    pub error_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(import_file_id: String, dataset_id: String, sheet_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            import_file_id,
            dataset_id,
            sheet_name,
            stage: Stage::DatasetDetection,
            progress: JobProgress::default(),
            duplicates: DuplicateSummary::default(),
            schema_validation: SchemaValidation::default(),
            geocode_summary: GeocodeSummary::default(),
            batch_size: DEFAULT_BATCH_SIZE as u64,
            total_batches: 0,
            batches_completed: 0,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Batch count for a row total: at least one batch so empty sources
    /// still flow through the pipeline to completion.
    pub fn batch_count(rows_total: u64, batch_size: u64) -> u64 {
        if rows_total == 0 {
            1
        } else {
            rows_total.div_ceil(batch_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_count() {
        assert_eq!(ImportJob::batch_count(0, 100), 1);
        assert_eq!(ImportJob::batch_count(1, 100), 1);
        assert_eq!(ImportJob::batch_count(100, 100), 1);
        assert_eq!(ImportJob::batch_count(101, 100), 2);
        assert_eq!(ImportJob::batch_count(250, 100), 3);
    }

    #[test]
    fn test_new_job_starts_at_dataset_detection() {
        let job = ImportJob::new("file-1".into(), "dataset-1".into(), None);
        assert_eq!(job.stage, Stage::DatasetDetection);
        assert_eq!(job.batch_size, 100);
        assert!(!job.schema_validation.requires_approval);
    }
}
