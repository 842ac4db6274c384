//! Error taxonomy for the import pipeline.
//!
//! Errors that block an action before any work is queued (validation, quota)
//! are distinguished from errors that fail an in-flight import (fetch, stage
//! failures). Per-item problems (one bad row, one unresolvable address) are
//! never surfaced through this type; they are absorbed into per-item records.

use thiserror::Error;

/// Errors produced by the import pipeline and its entry points.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Bad input at creation time (invalid cron expression, URL, schema).
    /// Rejected synchronously; never queued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network or HTTP failure while fetching source content, after retries
    /// were exhausted.
    #[error("fetch failed for {url}: {message} (after {attempts} attempts)")]
    Fetch {
        url: String,
        message: String,
        attempts: u32,
    },

    /// The fetched body exceeded the configured size ceiling.
    #[error("content exceeds size limit: {received} bytes received, limit {limit}")]
    ContentTooLarge { received: u64, limit: u64 },

    /// A per-actor quota ceiling was hit. Blocks the triggering action
    /// before anything is queued.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Source bytes could not be parsed as CSV or Excel.
    #[error("parse error: {0}")]
    Parse(String),

    /// Unhandled failure inside a pipeline stage handler. Marks the
    /// ImportJob and its ImportFile failed; not retried.
    #[error("stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    /// Whether this error should be reported as a caller mistake rather
    /// than an import failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ImportError::Validation(_) | ImportError::QuotaExceeded(_) | ImportError::NotFound(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(ImportError::Validation("bad cron".into()).is_rejection());
        assert!(ImportError::QuotaExceeded("uploads".into()).is_rejection());
        assert!(!ImportError::Fetch {
            url: "https://example.com".into(),
            message: "timeout".into(),
            attempts: 3,
        }
        .is_rejection());
    }

    #[test]
    fn test_fetch_error_display() {
        let err = ImportError::Fetch {
            url: "https://example.com/data.csv".into(),
            message: "connection refused".into(),
            attempts: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("example.com"));
        assert!(msg.contains("4 attempts"));
    }
}
