//! Row deduplication.
//!
//! Identity keys are deterministic and independent of field order, so
//! re-running the same file always classifies rows the same way. Internal
//! duplicates repeat a key within the file; external duplicates match an
//! event already imported into the dataset.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{DuplicateSummary, IdentityStrategy};

/// Classification of one parsed sheet against itself and the stored events.
#[derive(Debug, Clone)]
pub struct DedupeOutcome {
    pub summary: DuplicateSummary,
    /// Identity key per input row, index-aligned.
    pub keys: Vec<String>,
    /// Indices of rows that survive deduplication (first occurrence of a
    /// key, not previously imported).
    pub unique_indices: Vec<usize>,
}

impl DedupeOutcome {
    pub fn is_unique(&self, index: usize) -> bool {
        self.unique_indices.binary_search(&index).is_ok()
    }
}

/// Compute the identity key for one row under a strategy.
///
/// `ExternalId` trusts the id field alone: the same id means the same row
/// even when the content changed. `Hybrid` combines the id with the content
/// hash, so a re-sent row with the same id but edited fields counts as new.
/// Both fall back to the content hash when the id field is absent, so rows
/// without an id still deduplicate by content.
pub fn row_identity(strategy: &IdentityStrategy, row: &Map<String, Value>) -> String {
    match strategy {
        IdentityStrategy::ExternalId { field } => match row.get(field) {
            Some(value) if !value.is_null() => format!("id:{}", value_to_key(value)),
            _ => content_hash(row),
        },
        IdentityStrategy::Hybrid { field } => match row.get(field) {
            Some(value) if !value.is_null() => {
                format!("id:{}:{}", value_to_key(value), content_hash(row))
            }
            _ => content_hash(row),
        },
        IdentityStrategy::ComputedHash => content_hash(row),
    }
}

/// SHA-256 over the row serialized with sorted keys and canonical scalar
/// text, hex encoded.
fn content_hash(row: &Map<String, Value>) -> String {
    let normalized: BTreeMap<&str, String> = row
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.as_str(), value_to_key(v)))
        .collect();

    let mut hasher = Sha256::new();
    for (key, value) in &normalized {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Run both deduplication phases over a parsed sheet.
pub fn analyze(
    strategy: &IdentityStrategy,
    rows: &[Map<String, Value>],
    existing: &HashSet<String>,
) -> DedupeOutcome {
    let keys: Vec<String> = rows.iter().map(|row| row_identity(strategy, row)).collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut unique_indices = Vec::new();
    let mut internal = 0u64;
    let mut external = 0u64;

    for (index, key) in keys.iter().enumerate() {
        if !seen.insert(key) {
            internal += 1;
            continue;
        }
        if existing.contains(key) {
            external += 1;
            continue;
        }
        unique_indices.push(index);
    }

    DedupeOutcome {
        summary: DuplicateSummary {
            total_rows: rows.len() as u64,
            unique_rows: unique_indices.len() as u64,
            internal_duplicates: internal,
            external_duplicates: external,
        },
        keys,
        unique_indices,
    }
}
