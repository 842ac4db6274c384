//! Fetched or uploaded source artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an [`ImportFile`]'s bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOrigin {
    Upload,
    Url,
    Webhook,
}

impl FileOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOrigin::Upload => "upload",
            FileOrigin::Url => "url",
            FileOrigin::Webhook => "webhook",
        }
    }

    pub fn from_str(s: &str) -> Option<FileOrigin> {
        match s {
            "upload" => Some(FileOrigin::Upload),
            "url" => Some(FileOrigin::Url),
            "webhook" => Some(FileOrigin::Webhook),
            _ => None,
        }
    }
}

/// Lifecycle of an [`ImportFile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Parsing,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Parsing => "parsing",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<FileStatus> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "parsing" => Some(FileStatus::Parsing),
            "processing" => Some(FileStatus::Processing),
            "completed" => Some(FileStatus::Completed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }
}

/// Free-form audit metadata carried by an [`ImportFile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Fetch attempts made, including the successful one.
    #[serde(default)]
    pub fetch_attempts: u32,
    /// Auth kind used for the fetch (label only, never credentials).
    #[serde(default)]
    pub auth_kind: Option<String>,
    /// Original filename for uploads.
    #[serde(default)]
    pub original_filename: Option<String>,
    /// Actor charged for quota accounting; the schedule owner for fetches,
    /// the uploading user otherwise.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Sheet name to dataset id mapping configured for multi-sheet sources.
    #[serde(default)]
    pub sheet_mapping: std::collections::HashMap<String, String>,
}

/// One fetched or uploaded source artifact.
///
/// Created at fetch time, mutated by pipeline stages, immutable once
/// terminal except for audit fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFile {
    pub id: String,
    pub catalog_id: String,
    pub origin: FileOrigin,
    pub status: FileStatus,
    /// SHA-256 of the raw bytes, hex-encoded. Content address for dedup.
    pub content_hash: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Path of the stored blob under the data directory.
    pub storage_path: String,
    /// The ScheduledImport that produced this file, if any.
    pub scheduled_import_id: Option<String>,
    /// Set when a prior completed import with the same content hash was
    /// reused instead of processing this fetch.
    pub is_duplicate: bool,
    pub metadata: FileMetadata,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportFile {
    pub fn new(
        catalog_id: String,
        origin: FileOrigin,
        content_hash: String,
        mime_type: String,
        size_bytes: u64,
        storage_path: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            catalog_id,
            origin,
            status: FileStatus::Pending,
            content_hash,
            mime_type,
            size_bytes,
            storage_path,
            scheduled_import_id: None,
            is_duplicate: false,
            metadata: FileMetadata::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Parsing,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Failed,
        ] {
            assert_eq!(FileStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_new_file_is_pending() {
        let file = ImportFile::new(
            "catalog-1".into(),
            FileOrigin::Upload,
            "abc123".into(),
            "text/csv".into(),
            42,
            "blobs/abc123".into(),
        );
        assert_eq!(file.status, FileStatus::Pending);
        assert!(!file.is_duplicate);
        assert!(!file.status.is_terminal());
    }
}
