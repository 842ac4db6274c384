//! JSON API for triggering, uploading, and monitoring imports.
//!
//! Entry points mirror the pipeline's triggers:
//! - webhook triggers for scheduled imports, rate-limited per token
//! - multipart file uploads
//! - progress polling and schema approval for in-flight imports

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::limits::{QuotaGuard, WebhookRateLimiter};
use crate::models::TrustLevel;
use crate::pipeline::Pipeline;
use crate::repository::{ScheduledImportRepository, SqlitePool, UsageRepository};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub limiter: WebhookRateLimiter,
    pub quota: QuotaGuard,
    /// Trust level applied to API callers. Per-caller tiers arrive with
    /// the authentication layer, which lives outside this crate.
    pub trust: TrustLevel,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, pool: SqlitePool) -> Self {
        Self {
            pipeline,
            limiter: WebhookRateLimiter::new(pool.clone()),
            quota: QuotaGuard::new(
                UsageRepository::new(pool.clone()),
                ScheduledImportRepository::new(pool),
            ),
            trust: TrustLevel::Member,
        }
    }
}

/// Start the web server.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
