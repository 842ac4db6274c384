//! Route table for the import API.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/trigger/:token", post(handlers::trigger_webhook))
        .route("/import/upload", post(handlers::upload))
        .route("/import/:id/progress", get(handlers::progress))
        .route("/import/:id/approve", post(handlers::approve_schema))
        .route("/import/:id/reject", post(handlers::reject_schema))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::error::Result;
    use crate::fetch::FetchClient;
    use crate::geocode::{GeocodingProvider, GeocodingService};
    use crate::models::{Frequency, GeocodeResult, QuotaKind, Schedule, ScheduledImport, TrustLevel};
    use crate::pipeline::Pipeline;
    use crate::repository::test_support::setup_test_db;
    use crate::repository::{LocationCacheRepository, SqlitePool, UsageRepository};
    use crate::server::AppState;
    use crate::storage::BlobStore;

    struct NoopProvider;

    #[async_trait]
    impl GeocodingProvider for NoopProvider {
        fn name(&self) -> &str {
            "noop"
        }

        fn min_delay(&self) -> Duration {
            Duration::ZERO
        }

        async fn geocode(&self, _address: &str) -> Result<Option<GeocodeResult>> {
            Ok(None)
        }
    }

    async fn build_app() -> (Router, AppState, SqlitePool, tempfile::TempDir) {
        let (pool, dir) = setup_test_db().await;
        let store = BlobStore::new(dir.path().join("data"));
        let geocoder = GeocodingService::new(
            LocationCacheRepository::new(pool.clone()),
            vec![Arc::new(NoopProvider)],
        );
        let fetcher = FetchClient::new(Duration::from_secs(5)).unwrap();
        let pipeline = Arc::new(Pipeline::new(pool.clone(), store, geocoder, fetcher));
        let state = AppState::new(pipeline, pool.clone());
        (super::create_router(state.clone()), state, pool, dir)
    }

    fn schedule() -> ScheduledImport {
        ScheduledImport::new(
            "nightly".into(),
            "https://example.com/data.csv".into(),
            Schedule::Frequency {
                frequency: Frequency::Daily,
            },
            "catalog-1".into(),
            "user-1".into(),
        )
    }

    async fn post(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_webhook_unknown_token_is_404() {
        let (app, _state, _pool, _dir) = build_app().await;
        let (status, body) = post(&app, "/webhooks/trigger/no-such-token").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_webhook_disabled_is_403() {
        let (app, state, _pool, _dir) = build_app().await;
        let mut import = schedule();
        import.webhook_enabled = false;
        state.pipeline.schedules.create(&import).await.unwrap();

        let uri = format!("/webhooks/trigger/{}", import.webhook_token);
        let (status, _) = post(&app, &uri).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_webhook_wrong_method_is_405() {
        let (app, _state, _pool, _dir) = build_app().await;
        let (status, _) = get(&app, "/webhooks/trigger/some-token").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_webhook_triggers_then_burst_limits() {
        let (app, state, pool, _dir) = build_app().await;
        let import = schedule();
        state.pipeline.schedules.create(&import).await.unwrap();

        let uri = format!("/webhooks/trigger/{}", import.webhook_token);
        let (status, body) = post(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "triggered");
        assert!(body["jobId"].is_string());
        assert_eq!(state.pipeline.queue.pending_count().await.unwrap(), 1);
        // The accepted trigger charged exactly one fetch to the owner.
        assert_eq!(
            UsageRepository::new(pool)
                .current("user-1", QuotaKind::UrlFetch)
                .await
                .unwrap(),
            1
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response
            .headers()
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after <= 10);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["limitType"], "burst");
    }

    #[tokio::test]
    async fn test_webhook_skips_running_import() {
        let (app, state, pool, _dir) = build_app().await;
        let import = schedule();
        state.pipeline.schedules.create(&import).await.unwrap();
        assert!(state
            .pipeline
            .schedules
            .try_mark_running(&import.id, chrono::Utc::now())
            .await
            .unwrap());

        let uri = format!("/webhooks/trigger/{}", import.webhook_token);
        let (status, body) = post(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
        assert_eq!(state.pipeline.queue.pending_count().await.unwrap(), 0);
        // A skipped trigger starts nothing and charges nothing.
        assert_eq!(
            UsageRepository::new(pool)
                .current("user-1", QuotaKind::UrlFetch)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_webhook_quota_refusal_releases_claimed_run() {
        let (app, state, pool, _dir) = build_app().await;
        let import = schedule();
        state.pipeline.schedules.create(&import).await.unwrap();

        // Exhaust today's fetch allowance for the schedule owner.
        let limit = TrustLevel::Member.limits().url_fetches_per_day;
        let usage = UsageRepository::new(pool);
        assert!(usage
            .check_and_increment("user-1", QuotaKind::UrlFetch, limit, limit)
            .await
            .unwrap());

        let uri = format!("/webhooks/trigger/{}", import.webhook_token);
        let (status, body) = post(&app, &uri).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["success"], false);
        assert_eq!(state.pipeline.queue.pending_count().await.unwrap(), 0);

        // The refused trigger released the running state it claimed, so the
        // schedule is not wedged for the scheduler or later triggers.
        let fetched = state.pipeline.schedules.get(&import.id).await.unwrap().unwrap();
        assert_eq!(fetched.last_status.as_deref(), Some("failed"));
        assert!(state
            .pipeline
            .schedules
            .try_mark_running(&import.id, chrono::Utc::now())
            .await
            .unwrap());
    }

    fn multipart_request(uri: &str, content_type: &str, csv: &str) -> Request<Body> {
        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"catalog_id\"\r\n\r\ncatalog-1\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"data.csv\"\r\n\
             Content-Type: {ct}\r\n\r\n{csv}\r\n--{b}--\r\n",
            b = boundary,
            ct = content_type,
            csv = csv,
        );
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_accepts_csv_and_reports_progress() {
        let (app, state, _pool, _dir) = build_app().await;

        let request = multipart_request("/import/upload", "text/csv", "name,value\na,1\n");
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        let import_id = body["importId"].as_str().unwrap().to_string();
        assert_eq!(state.pipeline.queue.pending_count().await.unwrap(), 1);

        let (status, progress) = get(&app, &format!("/import/{}/progress", import_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["status"], "pending");
        assert_eq!(progress["stageProgress"]["percentage"], 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_unsupported_mime() {
        let (app, state, _pool, _dir) = build_app().await;

        let request = multipart_request("/import/upload", "application/pdf", "%PDF-1.4");
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.pipeline.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_unknown_id_is_404() {
        let (app, _state, _pool, _dir) = build_app().await;
        let (status, _) = get(&app, "/import/no-such-import/progress").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
