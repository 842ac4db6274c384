//! Repository for pipeline execution units.

use diesel::prelude::*;

use super::pool::{run_blocking, SqlitePool};
use super::records::ImportJobRecord;
use super::parse_datetime;
use crate::error::Result;
use crate::models::{
    DuplicateSummary, GeocodeSummary, ImportJob, JobProgress, SchemaValidation, Stage,
};
use crate::schema::import_jobs;

impl From<ImportJobRecord> for ImportJob {
    fn from(record: ImportJobRecord) -> Self {
        ImportJob {
            id: record.id,
            import_file_id: record.import_file_id,
            dataset_id: record.dataset_id,
            sheet_name: record.sheet_name,
            stage: Stage::from_str(&record.stage).unwrap_or(Stage::Failed),
            progress: JobProgress {
                rows_total: record.rows_total.max(0) as u64,
                rows_processed: record.rows_processed.max(0) as u64,
                events_created: record.events_created.max(0) as u64,
                geocoded_count: record.geocoded_count.max(0) as u64,
            },
            duplicates: serde_json::from_str(&record.duplicate_summary).unwrap_or_default(),
            schema_validation: serde_json::from_str(&record.schema_validation).unwrap_or_default(),
            geocode_summary: serde_json::from_str(&record.geocode_summary).unwrap_or_default(),
            batch_size: record.batch_size.max(1) as u64,
            total_batches: record.total_batches.max(0) as u64,
            batches_completed: record.batches_completed.max(0) as u64,
            error_log: serde_json::from_str(&record.error_log).unwrap_or_default(),
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

/// Repository for [`ImportJob`] documents.
#[derive(Clone)]
pub struct ImportJobRepository {
    pool: SqlitePool,
}

impl ImportJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new import job.
    pub async fn create(&self, job: &ImportJob) -> Result<()> {
        let job = job.clone();
        let duplicates =
            serde_json::to_string(&job.duplicates).unwrap_or_else(|_| "{}".to_string());
        let validation =
            serde_json::to_string(&job.schema_validation).unwrap_or_else(|_| "{}".to_string());
        let geocode =
            serde_json::to_string(&job.geocode_summary).unwrap_or_else(|_| "{}".to_string());
        let errors = serde_json::to_string(&job.error_log).unwrap_or_else(|_| "[]".to_string());

        run_blocking(self.pool.clone(), move |conn| {
            diesel::insert_into(import_jobs::table)
                .values((
                    import_jobs::id.eq(&job.id),
                    import_jobs::import_file_id.eq(&job.import_file_id),
                    import_jobs::dataset_id.eq(&job.dataset_id),
                    import_jobs::sheet_name.eq(&job.sheet_name),
                    import_jobs::stage.eq(job.stage.as_str()),
                    import_jobs::rows_total.eq(job.progress.rows_total as i64),
                    import_jobs::rows_processed.eq(job.progress.rows_processed as i64),
                    import_jobs::events_created.eq(job.progress.events_created as i64),
                    import_jobs::geocoded_count.eq(job.progress.geocoded_count as i64),
                    import_jobs::duplicate_summary.eq(&duplicates),
                    import_jobs::schema_validation.eq(&validation),
                    import_jobs::geocode_summary.eq(&geocode),
                    import_jobs::batch_size.eq(job.batch_size as i64),
                    import_jobs::total_batches.eq(job.total_batches as i64),
                    import_jobs::batches_completed.eq(job.batches_completed as i64),
                    import_jobs::error_log.eq(&errors),
                    import_jobs::created_at.eq(job.created_at.to_rfc3339()),
                    import_jobs::updated_at.eq(job.updated_at.to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get(&self, id: &str) -> Result<Option<ImportJob>> {
        let id = id.to_string();
        let record = run_blocking(self.pool.clone(), move |conn| {
            import_jobs::table
                .find(&id)
                .first::<ImportJobRecord>(conn)
                .optional()
        })
        .await?;
        Ok(record.map(ImportJob::from))
    }

    /// All jobs fanned out from one import file.
    pub async fn list_for_file(&self, import_file_id: &str) -> Result<Vec<ImportJob>> {
        let import_file_id = import_file_id.to_string();
        let records = run_blocking(self.pool.clone(), move |conn| {
            import_jobs::table
                .filter(import_jobs::import_file_id.eq(&import_file_id))
                .order(import_jobs::created_at.asc())
                .load::<ImportJobRecord>(conn)
        })
        .await?;
        Ok(records.into_iter().map(ImportJob::from).collect())
    }

    /// Move a job to a new stage.
    pub async fn set_stage(&self, id: &str, stage: Stage) -> Result<()> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::stage.eq(stage.as_str()),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Persist row totals and batch math computed at dataset-detection.
    pub async fn set_detection_result(
        &self,
        id: &str,
        rows_total: u64,
        batch_size: u64,
        total_batches: u64,
    ) -> Result<()> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::rows_total.eq(rows_total as i64),
                    import_jobs::batch_size.eq(batch_size as i64),
                    import_jobs::total_batches.eq(total_batches as i64),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Persist the duplicate analysis summary.
    pub async fn set_duplicate_summary(&self, id: &str, summary: &DuplicateSummary) -> Result<()> {
        let id = id.to_string();
        let json = serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string());
        let rows_processed = summary.total_rows as i64;
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::duplicate_summary.eq(&json),
                    import_jobs::rows_processed.eq(rows_processed),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Persist the schema validation sub-record.
    pub async fn set_schema_validation(
        &self,
        id: &str,
        validation: &SchemaValidation,
    ) -> Result<()> {
        let id = id.to_string();
        let json = serde_json::to_string(validation).unwrap_or_else(|_| "{}".to_string());
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::schema_validation.eq(&json),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Persist the geocoding summary and geocoded counter.
    pub async fn set_geocode_summary(&self, id: &str, summary: &GeocodeSummary) -> Result<()> {
        let id = id.to_string();
        let json = serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string());
        let geocoded = summary.successful as i64;
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::geocode_summary.eq(&json),
                    import_jobs::geocoded_count.eq(geocoded),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Atomically add to the created-events counter.
    pub async fn add_events_created(&self, id: &str, count: u64) -> Result<()> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            diesel::update(import_jobs::table.find(&id))
                .set((
                    import_jobs::events_created
                        .eq(import_jobs::events_created + count as i64),
                    import_jobs::updated_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Atomically increment the completed-batch counter, returning the new
    /// count. Batches finish in any order; the caller that observes the
    /// count reach `total_batches` owns the transition to the next stage.
    pub async fn increment_batches_completed(&self, id: &str) -> Result<u64> {
        let id = id.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let completed = run_blocking(self.pool.clone(), move |conn| {
            conn.transaction(|conn| {
                diesel::update(import_jobs::table.find(&id))
                    .set((
                        import_jobs::batches_completed
                            .eq(import_jobs::batches_completed + 1),
                        import_jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)?;
                import_jobs::table
                    .find(&id)
                    .select(import_jobs::batches_completed)
                    .first::<i64>(conn)
            })
        })
        .await?;
        Ok(completed.max(0) as u64)
    }

    /// Append an error to the job's error log.
    pub async fn append_error(&self, id: &str, message: &str) -> Result<()> {
        let id = id.to_string();
        let message = message.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(self.pool.clone(), move |conn| {
            conn.transaction(|conn| {
                let current: String = import_jobs::table
                    .find(&id)
                    .select(import_jobs::error_log)
                    .first(conn)?;
                let mut log: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
                log.push(message.clone());
                let json = serde_json::to_string(&log).unwrap_or_else(|_| "[]".to_string());
                diesel::update(import_jobs::table.find(&id))
                    .set((
                        import_jobs::error_log.eq(&json),
                        import_jobs::updated_at.eq(&now),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await?;
        Ok(())
    }

    /// Mark a job failed, recording the reason.
    pub async fn fail(&self, id: &str, message: &str) -> Result<()> {
        self.append_error(id, message).await?;
        self.set_stage(id, Stage::Failed).await
    }
}
