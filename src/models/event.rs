//! Materialized event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Validation state of an [`Event`]'s data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Transformed,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Transformed => "transformed",
            ValidationStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<ValidationStatus> {
        match s {
            "pending" => Some(ValidationStatus::Pending),
            "transformed" => Some(ValidationStatus::Transformed),
            "rejected" => Some(ValidationStatus::Rejected),
            _ => None,
        }
    }
}

/// Provenance of one applied (or attempted) field transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformNote {
    pub field: String,
    pub rule: String,
    pub from: serde_json::Value,
    pub to: serde_json::Value,
    pub applied: bool,
}

/// A resolved geocode attached to an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    /// Provider-reported match confidence in `[0, 1]`.
    pub confidence: f64,
    pub provider: String,
    pub normalized_address: String,
}

/// A materialized data row. One source row yields exactly one event, or
/// zero when deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub dataset_id: String,
    pub import_file_id: String,
    pub import_job_id: String,
    /// Structured payload following the dataset schema.
    pub data: serde_json::Map<String, serde_json::Value>,
    pub validation_status: ValidationStatus,
    pub transform_notes: Vec<TransformNote>,
    /// Deduplication key derived by the dataset's identity strategy.
    pub row_hash: String,
    /// Free-text address extracted for geocoding, if the dataset maps one.
    pub address: Option<String>,
    pub geocode: Option<GeocodeResult>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        dataset_id: String,
        import_file_id: String,
        import_job_id: String,
        data: serde_json::Map<String, serde_json::Value>,
        row_hash: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dataset_id,
            import_file_id,
            import_job_id,
            data,
            validation_status: ValidationStatus::Pending,
            transform_notes: Vec::new(),
            row_hash,
            address: None,
            geocode: None,
            created_at: Utc::now(),
        }
    }
}
