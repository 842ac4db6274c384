//! Pipeline orchestration.
//!
//! Every stage handler follows the same contract: load the ImportJob, do
//! one unit of work, persist progress, enqueue the successor, return. State
//! lives in the database between stages, so a crashed worker resumes from
//! the last completed stage. A handler error fails the job and propagates
//! to the owning file; there is no mid-pipeline retry.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::dedupe;
use crate::error::{ImportError, Result};
use crate::fetch::{FetchClient, FetchOptions, FetchedContent};
use crate::geocode::GeocodingService;
use crate::limits::QuotaGuard;
use crate::models::{
    Event, FileOrigin, FileStatus, ImportFile, ImportJob, SchemaValidation, ScheduledImport, Stage,
    TrustLevel,
};
use crate::parse::{parse_content, ParsedSheet};
use crate::queue::{JobQueue, Task, TaskHandler};
use crate::repository::pool::SqlitePool;
use crate::repository::{
    DatasetRepository, EventRepository, ImportFileRepository, ImportJobRepository,
    ScheduledImportRepository, UsageRepository,
};
use crate::schema_engine::{
    apply_diff, decide, diff_schemas, infer_schema, SchemaDecision, INFERENCE_SAMPLE_SIZE,
};
use crate::storage::BlobStore;
use crate::transform::transform_row;

/// Sheet-mapping key used for sources without sheet names (CSV).
const DEFAULT_SHEET_KEY: &str = "default";

/// Stage orchestrator and entry point for all queued work.
pub struct Pipeline {
    pub files: ImportFileRepository,
    pub jobs: ImportJobRepository,
    pub datasets: DatasetRepository,
    pub events: EventRepository,
    pub schedules: ScheduledImportRepository,
    pub queue: JobQueue,
    geocoder: GeocodingService,
    fetcher: FetchClient,
    store: BlobStore,
    quota: QuotaGuard,
    trust: TrustLevel,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        store: BlobStore,
        geocoder: GeocodingService,
        fetcher: FetchClient,
    ) -> Self {
        let quota = QuotaGuard::new(
            UsageRepository::new(pool.clone()),
            ScheduledImportRepository::new(pool.clone()),
        );
        Self {
            files: ImportFileRepository::new(pool.clone()),
            jobs: ImportJobRepository::new(pool.clone()),
            datasets: DatasetRepository::new(pool.clone()),
            events: EventRepository::new(pool.clone()),
            schedules: ScheduledImportRepository::new(pool.clone()),
            queue: JobQueue::new(pool.clone()),
            geocoder,
            fetcher,
            store,
            quota,
            trust: TrustLevel::Member,
        }
    }

    /// Override the trust level quotas are enforced against.
    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = trust;
        self
    }

    // ---- fetch-source ----

    /// Fetch a schedule's source and hand the file to the pipeline. The
    /// schedule was CAS-marked running by whoever enqueued this task.
    async fn run_fetch(&self, scheduled_import_id: &str) -> Result<()> {
        let schedule = self
            .schedules
            .get(scheduled_import_id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("schedule {}", scheduled_import_id)))?;

        let started = Instant::now();
        let outcome = self.fetch_and_ingest(&schedule).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let next_run = schedule.schedule.next_after(Utc::now());
        self.schedules.set_next_run(&schedule.id, next_run).await?;

        match outcome {
            Ok(file) => {
                tracing::info!(
                    schedule = %schedule.id,
                    file = %file.id,
                    duplicate = file.is_duplicate,
                    "scheduled fetch finished"
                );
                self.schedules
                    .record_completion(&schedule.id, true, duration_ms, None)
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.schedules
                    .record_completion(&schedule.id, false, duration_ms, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Fetch the source and return the ImportFile the bytes now belong to:
    /// the prior completed import when the content is unchanged, a fresh
    /// record queued for processing otherwise.
    async fn fetch_and_ingest(&self, schedule: &ScheduledImport) -> Result<ImportFile> {
        let options = FetchOptions {
            auth: schedule.auth.clone(),
            retry: schedule.retry,
            expected_content_type: schedule.expected_content_type.clone(),
            ..FetchOptions::default()
        };
        let fetched = self.fetcher.fetch(&schedule.source_url, &options).await?;

        // Duplicate short-circuit: same bytes already imported under this
        // catalog. The prior import is reused under its original id; no new
        // record is created.
        if !schedule.skip_duplicate_check {
            if let Some(mut prior) = self
                .files
                .find_completed_by_hash(&schedule.catalog_id, &fetched.content_hash)
                .await?
            {
                tracing::info!(
                    schedule = %schedule.id,
                    prior_file = %prior.id,
                    "content unchanged, reusing prior import"
                );
                self.files.mark_duplicate(&prior.id).await?;
                prior.is_duplicate = true;
                return Ok(prior);
            }
        }

        let storage_path = self
            .store
            .write(&fetched.content_hash, &fetched.bytes)
            .await?;
        let file = self.file_from_fetch(schedule, &fetched, storage_path);
        self.files.create(&file).await?;
        self.queue
            .enqueue_now(&Task::DatasetDetection {
                import_file_id: file.id.clone(),
            })
            .await?;
        Ok(file)
    }

    fn file_from_fetch(
        &self,
        schedule: &ScheduledImport,
        fetched: &FetchedContent,
        storage_path: String,
    ) -> ImportFile {
        let mut file = ImportFile::new(
            schedule.catalog_id.clone(),
            FileOrigin::Url,
            fetched.content_hash.clone(),
            fetched.mime_type.clone(),
            fetched.bytes.len() as u64,
            storage_path,
        );
        file.scheduled_import_id = Some(schedule.id.clone());
        file.metadata.fetch_attempts = fetched.attempts;
        file.metadata.auth_kind = Some(schedule.auth.kind().to_string());
        file.metadata.original_filename = fetched.filename.clone();
        file.metadata.created_by = Some(schedule.created_by.clone());
        file
    }

    /// Ingest an uploaded file: whitelist its MIME type, store the blob,
    /// create the ImportFile, and enqueue dataset-detection. Returns the
    /// created file so callers can report its id.
    pub async fn ingest_upload(
        &self,
        catalog_id: &str,
        dataset_id: Option<&str>,
        filename: Option<&str>,
        mime_type: &str,
        bytes: &[u8],
        created_by: &str,
    ) -> Result<ImportFile> {
        let mime_type = mime_type
            .split(';')
            .next()
            .unwrap_or(mime_type)
            .trim()
            .to_ascii_lowercase();
        if !crate::parse::CSV_MIME_TYPES.contains(&mime_type.as_str())
            && !crate::parse::EXCEL_MIME_TYPES.contains(&mime_type.as_str())
        {
            return Err(ImportError::Validation(format!(
                "unsupported upload content type: {}",
                mime_type
            )));
        }
        if let Some(id) = dataset_id {
            if self.datasets.get(id).await?.is_none() {
                return Err(ImportError::NotFound(format!("dataset {}", id)));
            }
        }

        let content_hash = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(bytes))
        };
        let storage_path = self.store.write(&content_hash, bytes).await?;

        let mut file = ImportFile::new(
            catalog_id.to_string(),
            FileOrigin::Upload,
            content_hash,
            mime_type,
            bytes.len() as u64,
            storage_path,
        );
        file.metadata.original_filename = filename.map(str::to_string);
        file.metadata.created_by = Some(created_by.to_string());
        if let Some(id) = dataset_id {
            file.metadata
                .sheet_mapping
                .insert(DEFAULT_SHEET_KEY.to_string(), id.to_string());
        }
        self.files.create(&file).await?;
        self.queue
            .enqueue_now(&Task::DatasetDetection {
                import_file_id: file.id.clone(),
            })
            .await?;
        tracing::info!(file = %file.id, catalog = catalog_id, "upload accepted");
        Ok(file)
    }

    /// Register a new scheduled import. Enabled schedules count against the
    /// owner's active-schedule ceiling.
    pub async fn register_schedule(&self, schedule: &ScheduledImport) -> Result<()> {
        if schedule.enabled {
            self.quota
                .check_active_schedules(&schedule.created_by, self.trust)
                .await?;
        }
        self.schedules.create(schedule).await?;
        tracing::info!(schedule = %schedule.id, name = %schedule.name, "schedule registered");
        Ok(())
    }

    // ---- dataset-detection ----

    /// Parse the file and fan out one job per mapped sheet.
    async fn dataset_detection(&self, import_file_id: &str) -> Result<()> {
        let file = self.require_file(import_file_id).await?;
        self.files.set_status(&file.id, FileStatus::Parsing).await?;

        let bytes = self.store.read(&file.storage_path).await?;
        let sheets = parse_content(&bytes, &file.mime_type)?;
        self.files
            .set_status(&file.id, FileStatus::Processing)
            .await?;

        let schedule_dataset_id = match &file.scheduled_import_id {
            Some(id) => self.schedules.get(id).await?.and_then(|s| s.dataset_id),
            None => None,
        };
        let single_sheet = sheets.len() == 1;
        let actor = file
            .metadata
            .created_by
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());

        for sheet in &sheets {
            let dataset_id = self
                .resolve_dataset(&file, sheet, single_sheet, schedule_dataset_id.as_deref())
                .await?;

            // Each sheet job counts against the owner's quotas; a refusal
            // here fails the whole file before anything is materialized.
            self.quota.charge_import_job(&actor, self.trust).await?;
            self.quota
                .charge_events(&actor, self.trust, sheet.rows.len() as u64)
                .await?;

            let mut job = ImportJob::new(file.id.clone(), dataset_id, sheet.name.clone());
            job.stage = Stage::AnalyzeDuplicates;
            job.progress.rows_total = sheet.rows.len() as u64;
            job.total_batches = ImportJob::batch_count(job.progress.rows_total, job.batch_size);
            self.jobs.create(&job).await?;

            tracing::info!(
                file = %file.id,
                job = %job.id,
                sheet = sheet.name.as_deref().unwrap_or(DEFAULT_SHEET_KEY),
                rows = job.progress.rows_total,
                batches = job.total_batches,
                "sheet mapped"
            );
            self.queue
                .enqueue_now(&Task::AnalyzeDuplicates {
                    import_job_id: job.id,
                })
                .await?;
        }
        Ok(())
    }

    /// Resolve a sheet to its dataset: explicit mapping first, then the
    /// schedule's target (single-table sources only), then a name match,
    /// and finally a fresh dataset named after the sheet.
    async fn resolve_dataset(
        &self,
        file: &ImportFile,
        sheet: &ParsedSheet,
        single_sheet: bool,
        schedule_dataset_id: Option<&str>,
    ) -> Result<String> {
        let key = sheet.name.as_deref().unwrap_or(DEFAULT_SHEET_KEY);

        if let Some(mapped) = file.metadata.sheet_mapping.get(key) {
            if self.datasets.get(mapped).await?.is_some() {
                return Ok(mapped.clone());
            }
            return Err(ImportError::Validation(format!(
                "sheet '{}' is mapped to unknown dataset {}",
                key, mapped
            )));
        }
        if single_sheet {
            if let Some(id) = schedule_dataset_id {
                if self.datasets.get(id).await?.is_some() {
                    return Ok(id.to_string());
                }
            }
        }
        if let Some(existing) = self.datasets.find_by_name(&file.catalog_id, key).await? {
            return Ok(existing.id);
        }

        let dataset = crate::models::Dataset::new(file.catalog_id.clone(), key.to_string());
        self.datasets.create(&dataset).await?;
        tracing::info!(dataset = %dataset.id, name = key, "created dataset for new sheet");
        Ok(dataset.id)
    }

    // ---- analyze-duplicates ----

    async fn analyze_duplicates(&self, import_job_id: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        let dataset = self.require_dataset(&job.dataset_id).await?;
        let sheet = self.load_sheet(&job).await?;

        let keys: Vec<String> = sheet
            .rows
            .iter()
            .map(|row| dedupe::row_identity(&dataset.id_strategy, row))
            .collect();
        let existing = self.events.existing_row_hashes(&dataset.id, &keys).await?;
        let outcome = dedupe::analyze(&dataset.id_strategy, &sheet.rows, &existing);

        tracing::info!(
            job = %job.id,
            total = outcome.summary.total_rows,
            unique = outcome.summary.unique_rows,
            internal = outcome.summary.internal_duplicates,
            external = outcome.summary.external_duplicates,
            "duplicate analysis"
        );
        self.jobs
            .set_duplicate_summary(&job.id, &outcome.summary)
            .await?;
        self.advance(&job.id, Stage::AnalyzeDuplicates).await
    }

    // ---- detect-schema ----

    async fn detect_schema(&self, import_job_id: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        let sheet = self.load_sheet(&job).await?;
        let inferred = infer_schema(&sheet.rows, INFERENCE_SAMPLE_SIZE);
        tracing::debug!(job = %job.id, fields = inferred.fields.len(), "schema inferred");
        self.advance(&job.id, Stage::DetectSchema).await
    }

    // ---- validate-schema ----

    async fn validate_schema(&self, import_job_id: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        let dataset = self.require_dataset(&job.dataset_id).await?;
        let sheet = self.load_sheet(&job).await?;

        let inferred = infer_schema(&sheet.rows, INFERENCE_SAMPLE_SIZE);
        let current = self
            .datasets
            .latest_schema(&dataset.id)
            .await?
            .map(|v| v.schema)
            .unwrap_or_default();
        let diff = diff_schemas(&current, &inferred);
        let decision = decide(
            dataset.config.locked,
            dataset.config.auto_approve_non_breaking,
            &diff,
        );

        match decision {
            SchemaDecision::AutoApprove => {
                if !diff.is_empty() {
                    let merged = apply_diff(&current, &inferred);
                    let version = self
                        .datasets
                        .create_schema_version(&dataset.id, &merged, None)
                        .await?;
                    tracing::info!(job = %job.id, version, "schema auto-approved");
                }
                let validation = SchemaValidation {
                    requires_approval: false,
                    approved: true,
                    approved_by: None,
                    approved_at: Some(Utc::now()),
                    breaking: diff.is_breaking(),
                    diff_summary: diff.summary(),
                };
                self.jobs.set_schema_validation(&job.id, &validation).await?;
                self.jobs.set_stage(&job.id, Stage::CreateEvents).await?;
                self.enqueue_event_batches(&job).await
            }
            SchemaDecision::AwaitApproval => {
                let validation = SchemaValidation {
                    requires_approval: true,
                    approved: false,
                    approved_by: None,
                    approved_at: None,
                    breaking: diff.is_breaking(),
                    diff_summary: diff.summary(),
                };
                self.jobs.set_schema_validation(&job.id, &validation).await?;
                self.jobs.set_stage(&job.id, Stage::AwaitApproval).await?;
                tracing::info!(
                    job = %job.id,
                    breaking = diff.is_breaking(),
                    "schema change awaits approval"
                );
                // Suspend: no successor until approve/reject.
                Ok(())
            }
        }
    }

    async fn enqueue_event_batches(&self, job: &ImportJob) -> Result<()> {
        for batch_index in 0..job.total_batches {
            self.queue
                .enqueue_now(&Task::CreateEvents {
                    import_job_id: job.id.clone(),
                    batch_index,
                })
                .await?;
        }
        Ok(())
    }

    // ---- create-events ----

    /// Materialize one batch of rows. Batches complete in any order; the
    /// increment that reaches `total_batches` owns the geocode hand-off.
    async fn create_events(&self, import_job_id: &str, batch_index: u64) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        let dataset = self.require_dataset(&job.dataset_id).await?;
        let sheet = self.load_sheet(&job).await?;

        let keys: Vec<String> = sheet
            .rows
            .iter()
            .map(|row| dedupe::row_identity(&dataset.id_strategy, row))
            .collect();
        let existing = self.events.existing_row_hashes(&dataset.id, &keys).await?;
        let outcome = dedupe::analyze(&dataset.id_strategy, &sheet.rows, &existing);

        let start = (batch_index * job.batch_size) as usize;
        let end = ((batch_index + 1) * job.batch_size).min(sheet.rows.len() as u64) as usize;

        let mut batch = Vec::new();
        for index in start..end.max(start) {
            if !outcome.is_unique(index) {
                continue;
            }
            let transformed = transform_row(&dataset.transformations, &sheet.rows[index]);
            let address = dataset
                .address_field
                .as_deref()
                .and_then(|field| transformed.data.get(field))
                .and_then(value_to_text);

            let mut event = Event::new(
                dataset.id.clone(),
                job.import_file_id.clone(),
                job.id.clone(),
                transformed.data,
                outcome.keys[index].clone(),
            );
            event.validation_status = transformed.status;
            event.transform_notes = transformed.notes;
            event.address = address;
            batch.push(event);
        }

        let created = self.events.insert_batch(batch).await?;
        self.jobs.add_events_created(&job.id, created as u64).await?;
        tracing::debug!(job = %job.id, batch_index, created, "batch materialized");

        let completed = self.jobs.increment_batches_completed(&job.id).await?;
        if completed == job.total_batches {
            self.jobs.set_stage(&job.id, Stage::GeocodeBatch).await?;
            self.queue
                .enqueue_now(&Task::GeocodeBatch {
                    import_job_id: job.id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    // ---- geocode-batch ----

    async fn geocode_batch(&self, import_job_id: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        let pending = self.events.ungeocoded_for_job(&job.id).await?;

        let addresses: Vec<String> = pending
            .iter()
            .filter_map(|event| event.address.clone())
            .collect();
        let (results, summary) = self.geocoder.geocode_batch(&addresses).await?;

        for event in &pending {
            let Some(address) = &event.address else {
                continue;
            };
            if let Some(result) = results.get(address) {
                self.events.set_geocode(&event.id, result).await?;
            }
        }

        tracing::info!(
            job = %job.id,
            total = summary.total,
            successful = summary.successful,
            cached = summary.cached,
            failed = summary.failed,
            "geocoding finished"
        );
        self.jobs.set_geocode_summary(&job.id, &summary).await?;
        self.jobs.set_stage(&job.id, Stage::Completed).await?;
        self.rollup_file(&job.import_file_id).await
    }

    /// When every job fanned out from a file is terminal, roll the file up
    /// to its final status.
    async fn rollup_file(&self, import_file_id: &str) -> Result<()> {
        let jobs = self.jobs.list_for_file(import_file_id).await?;
        if jobs.is_empty() || !jobs.iter().all(|j| j.stage.is_terminal()) {
            return Ok(());
        }
        if jobs.iter().all(|j| j.stage == Stage::Completed) {
            self.files
                .set_status(import_file_id, FileStatus::Completed)
                .await
        } else {
            self.files
                .fail(import_file_id, "one or more sheet jobs failed")
                .await
        }
    }

    // ---- approval hooks ----

    /// Approve a suspended schema change: creates the SchemaVersion and
    /// resumes the pipeline at create-events.
    pub async fn approve_schema(&self, import_job_id: &str, approved_by: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        if job.stage != Stage::AwaitApproval {
            return Err(ImportError::Validation(format!(
                "job {} is not awaiting approval (stage {})",
                job.id,
                job.stage.as_str()
            )));
        }
        let dataset = self.require_dataset(&job.dataset_id).await?;
        let sheet = self.load_sheet(&job).await?;

        let inferred = infer_schema(&sheet.rows, INFERENCE_SAMPLE_SIZE);
        let current = self
            .datasets
            .latest_schema(&dataset.id)
            .await?
            .map(|v| v.schema)
            .unwrap_or_default();
        let merged = apply_diff(&current, &inferred);
        let version = self
            .datasets
            .create_schema_version(&dataset.id, &merged, Some(approved_by))
            .await?;

        let mut validation = job.schema_validation.clone();
        validation.approved = true;
        validation.approved_by = Some(approved_by.to_string());
        validation.approved_at = Some(Utc::now());
        self.jobs.set_schema_validation(&job.id, &validation).await?;
        self.jobs.set_stage(&job.id, Stage::CreateEvents).await?;
        tracing::info!(job = %job.id, version, approved_by, "schema approved, resuming");
        self.enqueue_event_batches(&job).await
    }

    /// Reject a suspended schema change: the job and its file fail.
    pub async fn reject_schema(&self, import_job_id: &str, rejected_by: &str) -> Result<()> {
        let job = self.require_job(import_job_id).await?;
        if job.stage != Stage::AwaitApproval {
            return Err(ImportError::Validation(format!(
                "job {} is not awaiting approval (stage {})",
                job.id,
                job.stage.as_str()
            )));
        }
        let reason = format!("schema change rejected by {}", rejected_by);
        self.jobs.fail(&job.id, &reason).await?;
        self.files.fail(&job.import_file_id, &reason).await?;
        Ok(())
    }

    // ---- shared helpers ----

    /// Standard stage hand-off: move to the successor and enqueue it.
    async fn advance(&self, job_id: &str, from: Stage) -> Result<()> {
        let next = from.successor().ok_or_else(|| ImportError::Stage {
            stage: from.as_str().to_string(),
            message: "terminal stage cannot advance".into(),
        })?;
        self.jobs.set_stage(job_id, next).await?;
        let task = match next {
            Stage::AnalyzeDuplicates => Task::AnalyzeDuplicates {
                import_job_id: job_id.to_string(),
            },
            Stage::DetectSchema => Task::DetectSchema {
                import_job_id: job_id.to_string(),
            },
            Stage::ValidateSchema => Task::ValidateSchema {
                import_job_id: job_id.to_string(),
            },
            Stage::GeocodeBatch => Task::GeocodeBatch {
                import_job_id: job_id.to_string(),
            },
            other => {
                return Err(ImportError::Stage {
                    stage: from.as_str().to_string(),
                    message: format!("no direct hand-off to {}", other.as_str()),
                })
            }
        };
        self.queue.enqueue_now(&task).await?;
        Ok(())
    }

    async fn load_sheet(&self, job: &ImportJob) -> Result<ParsedSheet> {
        let file = self.require_file(&job.import_file_id).await?;
        let bytes = self.store.read(&file.storage_path).await?;
        let sheets = parse_content(&bytes, &file.mime_type)?;
        match &job.sheet_name {
            None => sheets
                .into_iter()
                .next()
                .ok_or_else(|| ImportError::Parse("source has no sheets".into())),
            Some(name) => sheets
                .into_iter()
                .find(|s| s.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| ImportError::Parse(format!("sheet '{}' disappeared", name))),
        }
    }

    async fn require_file(&self, id: &str) -> Result<ImportFile> {
        self.files
            .get(id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("import file {}", id)))
    }

    async fn require_job(&self, id: &str) -> Result<ImportJob> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("import job {}", id)))
    }

    async fn require_dataset(&self, id: &str) -> Result<crate::models::Dataset> {
        self.datasets
            .get(id)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("dataset {}", id)))
    }

    /// Failure policy: mark the job failed with the error, then propagate
    /// to the owning file.
    async fn fail_job(&self, import_job_id: &str, error: &ImportError) {
        if let Err(e) = self.jobs.fail(import_job_id, &error.to_string()).await {
            tracing::error!(job = import_job_id, error = %e, "failed to record job failure");
            return;
        }
        if let Ok(Some(job)) = self.jobs.get(import_job_id).await {
            let _ = self
                .files
                .fail(&job.import_file_id, &error.to_string())
                .await;
        }
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl TaskHandler for Pipeline {
    async fn handle(&self, task: &Task) -> Result<()> {
        match task {
            Task::FetchSource {
                scheduled_import_id,
            } => self.run_fetch(scheduled_import_id).await,
            Task::DatasetDetection { import_file_id } => {
                let result = self.dataset_detection(import_file_id).await;
                if let Err(e) = &result {
                    let _ = self.files.fail(import_file_id, &e.to_string()).await;
                }
                result
            }
            Task::AnalyzeDuplicates { import_job_id } => {
                let result = self.analyze_duplicates(import_job_id).await;
                if let Err(e) = &result {
                    self.fail_job(import_job_id, e).await;
                }
                result
            }
            Task::DetectSchema { import_job_id } => {
                let result = self.detect_schema(import_job_id).await;
                if let Err(e) = &result {
                    self.fail_job(import_job_id, e).await;
                }
                result
            }
            Task::ValidateSchema { import_job_id } => {
                let result = self.validate_schema(import_job_id).await;
                if let Err(e) = &result {
                    self.fail_job(import_job_id, e).await;
                }
                result
            }
            Task::CreateEvents {
                import_job_id,
                batch_index,
            } => {
                let result = self.create_events(import_job_id, *batch_index).await;
                if let Err(e) = &result {
                    self.fail_job(import_job_id, e).await;
                }
                result
            }
            Task::GeocodeBatch { import_job_id } => {
                let result = self.geocode_batch(import_job_id).await;
                if let Err(e) = &result {
                    self.fail_job(import_job_id, e).await;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::GeocodingProvider;
    use crate::models::{
        Dataset, Frequency, GeocodeResult, QuotaKind, RetryConfig, Schedule, TransformKind,
        TransformRule,
    };
    use crate::queue::Worker;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::LocationCacheRepository;
    use diesel::prelude::*;
    use sha2::Digest;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedProvider;

    #[async_trait]
    impl GeocodingProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn min_delay(&self) -> Duration {
            Duration::ZERO
        }

        async fn geocode(&self, address: &str) -> Result<Option<GeocodeResult>> {
            Ok(Some(GeocodeResult {
                latitude: 47.0,
                longitude: -122.0,
                confidence: 0.9,
                provider: "fixed".into(),
                normalized_address: address.to_string(),
            }))
        }
    }

    async fn build_pipeline() -> (Arc<Pipeline>, crate::repository::SqlitePool, tempfile::TempDir)
    {
        build_pipeline_with(TrustLevel::Member).await
    }

    async fn build_pipeline_with(
        trust: TrustLevel,
    ) -> (Arc<Pipeline>, crate::repository::SqlitePool, tempfile::TempDir) {
        let (pool, dir) = setup_test_db().await;
        let store = BlobStore::new(dir.path().join("data"));
        let geocoder = GeocodingService::new(
            LocationCacheRepository::new(pool.clone()),
            vec![Arc::new(FixedProvider)],
        );
        let fetcher = FetchClient::new(Duration::from_secs(5)).unwrap();
        let pipeline = Arc::new(
            Pipeline::new(pool.clone(), store, geocoder, fetcher).with_trust(trust),
        );
        (pipeline, pool, dir)
    }

    /// Serve fixed bytes from an ephemeral local port.
    async fn spawn_static_server(body: &'static [u8]) -> String {
        let app = axum::Router::new().route("/data.csv", axum::routing::get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/data.csv", addr)
    }

    fn csv_schedule(url: String, dataset_id: &str) -> ScheduledImport {
        let mut schedule = ScheduledImport::new(
            "nightly".into(),
            url,
            Schedule::Frequency {
                frequency: Frequency::Daily,
            },
            "catalog-1".into(),
            "user-1".into(),
        );
        schedule.dataset_id = Some(dataset_id.to_string());
        // The test server serves octet-stream; name the real type.
        schedule.expected_content_type = Some("text/csv".into());
        schedule.retry = RetryConfig {
            max_retries: 0,
            delay_ms: 10,
            exponential: false,
        };
        schedule
    }

    async fn trigger_fetch(pipeline: &Pipeline, schedule_id: &str) {
        assert!(pipeline
            .schedules
            .try_mark_running(schedule_id, Utc::now())
            .await
            .unwrap());
        pipeline
            .queue
            .enqueue_now(&Task::FetchSource {
                scheduled_import_id: schedule_id.to_string(),
            })
            .await
            .unwrap();
    }

    async fn count_files_with_hash(pool: &crate::repository::SqlitePool, hash: &str) -> i64 {
        let hash = hash.to_string();
        crate::repository::run_blocking(pool.clone(), move |conn| {
            crate::schema::import_files::table
                .filter(crate::schema::import_files::content_hash.eq(&hash))
                .count()
                .first::<i64>(conn)
        })
        .await
        .unwrap()
    }

    async fn ingest_csv(pipeline: &Pipeline, dataset: &Dataset, csv: &[u8]) -> ImportFile {
        let hash = hex::encode(sha2::Sha256::digest(csv));
        let path = pipeline.store.write(&hash, csv).await.unwrap();

        let mut file = ImportFile::new(
            dataset.catalog_id.clone(),
            FileOrigin::Upload,
            hash,
            "text/csv".into(),
            csv.len() as u64,
            path,
        );
        file.metadata
            .sheet_mapping
            .insert(DEFAULT_SHEET_KEY.to_string(), dataset.id.clone());
        pipeline.files.create(&file).await.unwrap();
        pipeline
            .queue
            .enqueue_now(&Task::DatasetDetection {
                import_file_id: file.id.clone(),
            })
            .await
            .unwrap();
        file
    }

    #[tokio::test]
    async fn test_full_pipeline_auto_approve() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let mut dataset = Dataset::new("catalog-1".into(), "events".into());
        dataset.config.auto_approve_non_breaking = true;
        dataset.address_field = Some("address".into());
        dataset.transformations = vec![TransformRule {
            field: "attendance".into(),
            kind: TransformKind::ToNumber,
        }];
        pipeline.datasets.create(&dataset).await.unwrap();

        let csv = b"name,address,attendance\n\
                    Fair,1 Main St,100\n\
                    Fair,1 Main St,100\n\
                    Parade,2 Oak Ave,250\n";
        let file = ingest_csv(&pipeline, &dataset, csv).await;

        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Completed);

        let jobs = pipeline.jobs.list_for_file(&file.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.stage, Stage::Completed);
        // The repeated row deduplicated away.
        assert_eq!(job.duplicates.internal_duplicates, 1);
        assert_eq!(job.progress.events_created, 2);
        assert_eq!(job.geocode_summary.successful, 2);
        assert!(!job.schema_validation.requires_approval);

        // A schema version was auto-created.
        let version = pipeline
            .datasets
            .latest_schema(&dataset.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.version, 1);
        assert!(version.schema.fields.contains_key("attendance"));

        // Transformation applied before event creation.
        let events = pipeline.events.ungeocoded_for_job(&job.id).await.unwrap();
        assert!(events.is_empty(), "all events should be geocoded");
    }

    #[tokio::test]
    async fn test_pipeline_suspends_for_approval_and_resumes() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        // Default config: auto-approve off, so any schema change suspends.
        let dataset = Dataset::new("catalog-1".into(), "permits".into());
        pipeline.datasets.create(&dataset).await.unwrap();

        let file = ingest_csv(&pipeline, &dataset, b"kind,street\nfence,5 Elm\n").await;
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let jobs = pipeline.jobs.list_for_file(&file.id).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.stage, Stage::AwaitApproval);
        assert!(job.schema_validation.requires_approval);
        assert!(!job.schema_validation.diff_summary.is_empty());
        assert_eq!(pipeline.queue.pending_count().await.unwrap(), 0);

        // Approval creates the version and resumes the pipeline.
        pipeline.approve_schema(&job.id, "reviewer").await.unwrap();
        worker.run_until_idle().await.unwrap();

        let job = pipeline.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!(job.schema_validation.approved_by.as_deref(), Some("reviewer"));

        let version = pipeline
            .datasets
            .latest_schema(&dataset.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.approved_by.as_deref(), Some("reviewer"));

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejection_fails_job_and_file() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let dataset = Dataset::new("catalog-1".into(), "permits".into());
        pipeline.datasets.create(&dataset).await.unwrap();

        let file = ingest_csv(&pipeline, &dataset, b"kind\nfence\n").await;
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let jobs = pipeline.jobs.list_for_file(&file.id).await.unwrap();
        pipeline.reject_schema(&jobs[0].id, "reviewer").await.unwrap();

        let job = pipeline.jobs.get(&jobs[0].id).await.unwrap().unwrap();
        assert_eq!(job.stage, Stage::Failed);
        assert!(job.error_log[0].contains("rejected by reviewer"));

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Failed);

        // Approving or rejecting again is a caller error.
        assert!(pipeline.approve_schema(&job.id, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_batched_event_creation() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let mut dataset = Dataset::new("catalog-1".into(), "big".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        let mut csv = String::from("id,name\n");
        for i in 0..250 {
            csv.push_str(&format!("{},row {}\n", i, i));
        }
        let file = ingest_csv(&pipeline, &dataset, csv.as_bytes()).await;

        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let jobs = pipeline.jobs.list_for_file(&file.id).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!(job.total_batches, 3);
        assert_eq!(job.batches_completed, 3);
        assert_eq!(job.progress.events_created, 250);
        assert_eq!(
            pipeline.events.count_for_job(&job.id).await.unwrap(),
            250
        );
    }

    #[tokio::test]
    async fn test_rerun_of_same_content_creates_no_new_events() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let mut dataset = Dataset::new("catalog-1".into(), "events".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        let csv = b"name\nFair\nParade\n";
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());

        ingest_csv(&pipeline, &dataset, csv).await;
        worker.run_until_idle().await.unwrap();

        // Second file with identical rows: everything is an external dup.
        let second = ingest_csv(&pipeline, &dataset, csv).await;
        worker.run_until_idle().await.unwrap();

        let jobs = pipeline.jobs.list_for_file(&second.id).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.stage, Stage::Completed);
        assert_eq!(job.duplicates.external_duplicates, 2);
        assert_eq!(job.progress.events_created, 0);
    }

    #[tokio::test]
    async fn test_unparseable_file_fails_cleanly() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let dataset = Dataset::new("catalog-1".into(), "events".into());
        pipeline.datasets.create(&dataset).await.unwrap();

        // Claims to be Excel but is not a workbook.
        let bytes = b"definitely not a spreadsheet";
        let hash = hex::encode(sha2::Sha256::digest(bytes));
        let path = pipeline.store.write(&hash, bytes).await.unwrap();
        let file = ImportFile::new(
            "catalog-1".into(),
            FileOrigin::Upload,
            hash,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".into(),
            bytes.len() as u64,
            path,
        );
        pipeline.files.create(&file).await.unwrap();
        pipeline
            .queue
            .enqueue_now(&Task::DatasetDetection {
                import_file_id: file.id.clone(),
            })
            .await
            .unwrap();

        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Failed);
        assert!(file.error.is_some());
    }

    const FETCH_CSV: &[u8] = b"name,street\nFair,1 Main St\nParade,2 Oak Ave\n";

    #[tokio::test]
    async fn test_scheduled_fetch_runs_to_completion() {
        let (pipeline, _pool, _dir) = build_pipeline().await;

        let mut dataset = Dataset::new("catalog-1".into(), "events".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        let url = spawn_static_server(FETCH_CSV).await;
        let schedule = csv_schedule(url, &dataset.id);
        pipeline.schedules.create(&schedule).await.unwrap();

        trigger_fetch(&pipeline, &schedule.id).await;
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let hash = hex::encode(sha2::Sha256::digest(FETCH_CSV));
        let file = pipeline
            .files
            .find_completed_by_hash("catalog-1", &hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.origin, FileOrigin::Url);
        assert!(!file.is_duplicate);
        assert_eq!(file.metadata.created_by.as_deref(), Some("user-1"));

        let jobs = pipeline.jobs.list_for_file(&file.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].stage, Stage::Completed);
        assert_eq!(jobs[0].progress.events_created, 2);

        let schedule = pipeline.schedules.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(schedule.last_status.as_deref(), Some("completed"));
        assert!(schedule.next_run.is_some());
        assert_eq!(schedule.stats.total_runs, 1);
        assert_eq!(schedule.stats.successful_runs, 1);
    }

    #[tokio::test]
    async fn test_refetch_unchanged_content_reuses_prior_import() {
        let (pipeline, pool, _dir) = build_pipeline().await;

        let mut dataset = Dataset::new("catalog-1".into(), "events".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        let url = spawn_static_server(FETCH_CSV).await;
        let schedule = csv_schedule(url, &dataset.id);
        pipeline.schedules.create(&schedule).await.unwrap();

        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        trigger_fetch(&pipeline, &schedule.id).await;
        worker.run_until_idle().await.unwrap();

        let hash = hex::encode(sha2::Sha256::digest(FETCH_CSV));
        let first = pipeline
            .files
            .find_completed_by_hash("catalog-1", &hash)
            .await
            .unwrap()
            .unwrap();

        // Same bytes again: the first import is reused under its own id,
        // no second ImportFile appears.
        trigger_fetch(&pipeline, &schedule.id).await;
        worker.run_until_idle().await.unwrap();

        assert_eq!(count_files_with_hash(&pool, &hash).await, 1);
        let reused = pipeline.files.get(&first.id).await.unwrap().unwrap();
        assert!(reused.is_duplicate);
        assert_eq!(reused.status, FileStatus::Completed);
        assert_eq!(
            pipeline.events.count_for_job(&pipeline.jobs.list_for_file(&first.id).await.unwrap()[0].id)
                .await
                .unwrap(),
            2
        );

        let schedule = pipeline.schedules.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(schedule.last_status.as_deref(), Some("completed"));
        assert_eq!(schedule.stats.successful_runs, 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_records_failure() {
        let (pipeline, pool, _dir) = build_pipeline().await;

        // Bind a port and release it so the fetch has nothing to talk to.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let schedule = csv_schedule(format!("http://{}/data.csv", addr), "dataset-x");
        pipeline.schedules.create(&schedule).await.unwrap();

        trigger_fetch(&pipeline, &schedule.id).await;
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let schedule = pipeline.schedules.get(&schedule.id).await.unwrap().unwrap();
        assert_eq!(schedule.last_status.as_deref(), Some("failed"));
        assert!(schedule.last_error.is_some());
        assert_eq!(schedule.stats.failed_runs, 1);
        assert!(schedule.next_run.is_some());

        // Nothing was ingested.
        let hash = hex::encode(sha2::Sha256::digest(FETCH_CSV));
        assert_eq!(count_files_with_hash(&pool, &hash).await, 0);
    }

    #[tokio::test]
    async fn test_import_job_quota_refusal_fails_file() {
        let (pipeline, pool, _dir) = build_pipeline_with(TrustLevel::Basic).await;

        let mut dataset = Dataset::new("catalog-1".into(), "events".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        // Exhaust today's import-job allowance for the uploader up front.
        let limit = TrustLevel::Basic.limits().import_jobs_per_day;
        let usage = UsageRepository::new(pool);
        assert!(usage
            .check_and_increment("anonymous", QuotaKind::ImportJob, limit, limit)
            .await
            .unwrap());

        let file = ingest_csv(&pipeline, &dataset, b"name\nFair\n").await;
        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Failed);
        assert!(file.error.unwrap().contains("import-job"));
        assert_eq!(pipeline.jobs.list_for_file(&file.id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_per_import_event_ceiling_fails_file() {
        let (pipeline, _pool, _dir) = build_pipeline_with(TrustLevel::Basic).await;

        let mut dataset = Dataset::new("catalog-1".into(), "big".into());
        dataset.config.auto_approve_non_breaking = true;
        pipeline.datasets.create(&dataset).await.unwrap();

        // One row over the Basic per-import ceiling.
        let rows = TrustLevel::Basic.limits().events_per_import + 1;
        let mut csv = String::from("id\n");
        for i in 0..rows {
            csv.push_str(&format!("{}\n", i));
        }
        let file = ingest_csv(&pipeline, &dataset, csv.as_bytes()).await;

        let worker = Worker::new(pipeline.queue.clone(), pipeline.clone());
        worker.run_until_idle().await.unwrap();

        let file = pipeline.files.get(&file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Failed);
        assert!(file.error.unwrap().contains("per-import"));
    }

    #[tokio::test]
    async fn test_register_schedule_enforces_active_ceiling() {
        let (pipeline, _pool, _dir) = build_pipeline_with(TrustLevel::Basic).await;

        let limit = TrustLevel::Basic.limits().max_active_schedules;
        for i in 0..limit {
            let schedule = csv_schedule(
                format!("https://example.com/feed-{}.csv", i),
                "dataset-x",
            );
            pipeline.register_schedule(&schedule).await.unwrap();
        }

        let over = csv_schedule("https://example.com/one-more.csv".into(), "dataset-x");
        let err = pipeline.register_schedule(&over).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("schedule limit"));

        // A disabled schedule does not consume a slot.
        let mut disabled = csv_schedule("https://example.com/paused.csv".into(), "dataset-x");
        disabled.enabled = false;
        pipeline.register_schedule(&disabled).await.unwrap();
    }
}
