//! Request handlers for the import API.

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ImportError, Result};
use crate::limits::RateLimitDecision;
use crate::models::{FileStatus, ImportFile, ImportJob, Stage};
use crate::queue::Task;

use super::AppState;

fn error_response(err: ImportError) -> Response {
    let status = match &err {
        ImportError::NotFound(_) => StatusCode::NOT_FOUND,
        ImportError::Validation(_) => StatusCode::BAD_REQUEST,
        ImportError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(json!({ "success": false, "message": err.to_string() })),
    )
        .into_response()
}

// ---- POST /webhooks/trigger/{token} ----

pub async fn trigger_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match trigger_inner(&state, &token).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn trigger_inner(state: &AppState, token: &str) -> Result<Response> {
    let schedule = match state.pipeline.schedules.get_by_token(token).await? {
        Some(schedule) => schedule,
        None => {
            return Ok((
                StatusCode::NOT_FOUND,
                Json(json!({ "success": false, "message": "unknown webhook token" })),
            )
                .into_response())
        }
    };
    if !schedule.webhook_enabled {
        return Ok((
            StatusCode::FORBIDDEN,
            Json(json!({
                "success": false,
                "message": "webhook triggering is disabled for this import"
            })),
        )
            .into_response());
    }

    if let RateLimitDecision::Limited {
        limit_type,
        retry_after_secs,
        message,
    } = state.limiter.check(token, Utc::now()).await?
    {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after_secs.to_string())],
            Json(json!({
                "success": false,
                "message": message,
                "limitType": limit_type.as_str(),
                "retryAfter": retry_after_secs,
            })),
        )
            .into_response());
    }

    // The CAS is the idempotency guard: losing it means a run is already
    // in flight, which is a success from the caller's point of view.
    if !state
        .pipeline
        .schedules
        .try_mark_running(&schedule.id, Utc::now())
        .await?
    {
        return Ok((
            StatusCode::OK,
            Json(json!({
                "success": true,
                "status": "skipped",
                "message": "import is already running",
            })),
        )
            .into_response());
    }

    // Only a trigger that actually starts a run consumes quota. A refusal
    // after winning the CAS must release the running state it claimed.
    if let Err(e) = state
        .quota
        .charge_url_fetch(&schedule.created_by, state.trust)
        .await
    {
        state
            .pipeline
            .schedules
            .record_completion(&schedule.id, false, 0, Some(e.to_string()))
            .await?;
        return Err(e);
    }

    let job_id = state
        .pipeline
        .queue
        .enqueue_now(&Task::FetchSource {
            scheduled_import_id: schedule.id.clone(),
        })
        .await?;
    tracing::info!(schedule = %schedule.id, job = %job_id, "webhook trigger accepted");

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "status": "triggered",
            "message": "import triggered",
            "jobId": job_id,
        })),
    )
        .into_response())
}

// ---- POST /import/upload ----

pub async fn upload(State(state): State<AppState>, multipart: Multipart) -> Response {
    match upload_inner(&state, multipart).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn upload_inner(state: &AppState, mut multipart: Multipart) -> Result<Response> {
    let mut catalog_id: Option<String> = None;
    let mut dataset_id: Option<String> = None;
    let mut user_id: Option<String> = None;
    let mut file: Option<(Option<String>, String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ImportError::Validation(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "catalog_id" => catalog_id = Some(read_text(field).await?),
            "dataset_id" => dataset_id = Some(read_text(field).await?),
            "user_id" => user_id = Some(read_text(field).await?),
            "file" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    ImportError::Validation(format!("failed to read upload: {}", e))
                })?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let catalog_id =
        catalog_id.ok_or_else(|| ImportError::Validation("catalog_id is required".into()))?;
    let (filename, content_type, bytes) =
        file.ok_or_else(|| ImportError::Validation("file field is required".into()))?;
    let user_id = user_id.unwrap_or_else(|| "anonymous".to_string());

    state.quota.charge_upload(&user_id, state.trust).await?;
    state.quota.check_file_size(state.trust, bytes.len() as u64)?;

    let file = state
        .pipeline
        .ingest_upload(
            &catalog_id,
            dataset_id.as_deref(),
            filename.as_deref(),
            &content_type,
            &bytes,
            &user_id,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "importId": file.id })),
    )
        .into_response())
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field
        .text()
        .await
        .map_err(|e| ImportError::Validation(format!("malformed multipart field: {}", e)))
}

// ---- GET /import/{id}/progress ----

/// Progress polling accepts either an ImportFile id (as returned by the
/// upload endpoint) or a single ImportJob id.
pub async fn progress(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match progress_inner(&state, &id).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn progress_inner(state: &AppState, id: &str) -> Result<Response> {
    if let Some(file) = state.pipeline.files.get(id).await? {
        let jobs = state.pipeline.jobs.list_for_file(&file.id).await?;
        return Ok(Json(file_progress(&file, &jobs)).into_response());
    }
    if let Some(job) = state.pipeline.jobs.get(id).await? {
        return Ok(Json(job_progress(&job)).into_response());
    }
    Err(ImportError::NotFound(format!("import {}", id)))
}

fn job_progress(job: &ImportJob) -> Value {
    json!({
        "status": match job.stage {
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            _ => "processing",
        },
        "stage": job.stage.as_str(),
        "progress": progress_counters(&[job.clone()]),
        "stageProgress": { "percentage": job.stage.percentage() },
    })
}

/// File-level progress: counters summed over the file's jobs, stage taken
/// from the least-advanced job so multi-sheet files report the slowest sheet.
fn file_progress(file: &ImportFile, jobs: &[ImportJob]) -> Value {
    let (stage, percentage) = jobs
        .iter()
        .map(|job| (job.stage, job.stage.percentage()))
        .min_by_key(|(_, pct)| *pct)
        .unwrap_or_else(|| match file.status {
            FileStatus::Completed | FileStatus::Failed => (Stage::Completed, 100),
            _ => (Stage::DatasetDetection, 0),
        });

    json!({
        "status": file.status.as_str(),
        "stage": stage.as_str(),
        "progress": progress_counters(jobs),
        "stageProgress": { "percentage": percentage },
    })
}

fn progress_counters(jobs: &[ImportJob]) -> Value {
    let mut rows_total = 0u64;
    let mut rows_processed = 0u64;
    let mut events_created = 0u64;
    let mut geocoded_count = 0u64;
    for job in jobs {
        rows_total += job.progress.rows_total;
        rows_processed += job.progress.rows_processed;
        events_created += job.progress.events_created;
        geocoded_count += job.progress.geocoded_count;
    }
    json!({
        "rowsTotal": rows_total,
        "rowsProcessed": rows_processed,
        "eventsCreated": events_created,
        "geocodedCount": geocoded_count,
    })
}

// ---- POST /import/{jobId}/approve | /import/{jobId}/reject ----

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApprovalBody {
    pub actor: Option<String>,
}

pub async fn approve_schema(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<ApprovalBody>>,
) -> Response {
    let actor = actor_from(body);
    match state.pipeline.approve_schema(&job_id, &actor).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "status": "approved" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn reject_schema(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<ApprovalBody>>,
) -> Response {
    let actor = actor_from(body);
    match state.pipeline.reject_schema(&job_id, &actor).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "status": "rejected" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn actor_from(body: Option<Json<ApprovalBody>>) -> String {
    body.and_then(|Json(body)| body.actor)
        .unwrap_or_else(|| "api".to_string())
}
