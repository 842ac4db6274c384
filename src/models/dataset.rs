//! Datasets, schema governance, and transformation rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structural type inferred for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    /// Mixed or unresolvable samples.
    Mixed,
}

/// One field in a dataset schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub field_type: FieldType,
    /// A field observed in every sampled row is required.
    pub required: bool,
}

/// A structural schema: field name to definition, ordered for stable diffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    pub fields: BTreeMap<String, FieldDef>,
}

/// Immutable approved snapshot of a dataset's field structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub dataset_id: String,
    pub version: u32,
    pub schema: DataSchema,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How a row's deduplication key is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IdentityStrategy {
    /// A source-provided unique id field.
    ExternalId { field: String },
    /// SHA-256 of the normalized full row.
    ComputedHash,
    /// External id when the field is present, content hash otherwise.
    Hybrid { field: String },
}

impl Default for IdentityStrategy {
    fn default() -> Self {
        IdentityStrategy::ComputedHash
    }
}

/// A declared field-level type coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    ToNumber,
    ToDate,
    ToBoolean,
    ToString,
    Trim,
}

/// Field transformation rule applied before event creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformRule {
    pub field: String,
    pub kind: TransformKind,
}

/// Schema governance configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// A locked dataset always requires manual approval for any change.
    pub locked: bool,
    /// Allow the schema to grow with new fields.
    pub auto_grow: bool,
    /// Auto-approve non-breaking diffs on unlocked datasets.
    pub auto_approve_non_breaking: bool,
}

/// Schema governance unit owning events and their identity rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub catalog_id: String,
    pub name: String,
    pub config: SchemaConfig,
    pub id_strategy: IdentityStrategy,
    pub transformations: Vec<TransformRule>,
    /// Row field holding a free-text address to geocode, if any.
    pub address_field: Option<String>,
    /// Current approved schema version number; `None` before first approval.
    pub current_schema_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dataset {
    pub fn new(catalog_id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            catalog_id,
            name,
            config: SchemaConfig::default(),
            id_strategy: IdentityStrategy::default(),
            transformations: Vec::new(),
            address_field: None,
            current_schema_version: None,
            created_at: now,
            updated_at: now,
        }
    }
}
