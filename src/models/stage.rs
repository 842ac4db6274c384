//! Pipeline stage state machine.
//!
//! Stages are a closed enum with a static transition table. Every stage
//! handler must enqueue its successor before returning; modelling the
//! successor as an exhaustive match makes a forgotten hand-off a visible
//! gap instead of a silent pipeline stall.

use serde::{Deserialize, Serialize};

/// Position of an [`crate::models::ImportJob`] in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    DatasetDetection,
    AnalyzeDuplicates,
    DetectSchema,
    ValidateSchema,
    /// Suspend state: the job stops auto-advancing until an external actor
    /// approves or rejects the schema change.
    AwaitApproval,
    CreateEvents,
    GeocodeBatch,
    Completed,
    Failed,
}

impl Stage {
    /// Stable string form used for persistence and queue task names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DatasetDetection => "dataset-detection",
            Stage::AnalyzeDuplicates => "analyze-duplicates",
            Stage::DetectSchema => "detect-schema",
            Stage::ValidateSchema => "validate-schema",
            Stage::AwaitApproval => "await-approval",
            Stage::CreateEvents => "create-events",
            Stage::GeocodeBatch => "geocode-batch",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    /// Parse the persisted string form.
    pub fn from_str(s: &str) -> Option<Stage> {
        match s {
            "dataset-detection" => Some(Stage::DatasetDetection),
            "analyze-duplicates" => Some(Stage::AnalyzeDuplicates),
            "detect-schema" => Some(Stage::DetectSchema),
            "validate-schema" => Some(Stage::ValidateSchema),
            "await-approval" => Some(Stage::AwaitApproval),
            "create-events" => Some(Stage::CreateEvents),
            "geocode-batch" => Some(Stage::GeocodeBatch),
            "completed" => Some(Stage::Completed),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }

    /// The stage enqueued when this stage completes normally.
    ///
    /// `ValidateSchema` returns `CreateEvents`: the await-approval detour is
    /// decided by the schema engine, not by the transition table.
    /// `AwaitApproval` also resumes at `CreateEvents` once approved.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::DatasetDetection => Some(Stage::AnalyzeDuplicates),
            Stage::AnalyzeDuplicates => Some(Stage::DetectSchema),
            Stage::DetectSchema => Some(Stage::ValidateSchema),
            Stage::ValidateSchema => Some(Stage::CreateEvents),
            Stage::AwaitApproval => Some(Stage::CreateEvents),
            Stage::CreateEvents => Some(Stage::GeocodeBatch),
            Stage::GeocodeBatch => Some(Stage::Completed),
            Stage::Completed => None,
            Stage::Failed => None,
        }
    }

    /// Whether the job is finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Rough progress percentage for UI polling.
    pub fn percentage(&self) -> u8 {
        match self {
            Stage::DatasetDetection => 10,
            Stage::AnalyzeDuplicates => 25,
            Stage::DetectSchema => 35,
            Stage::ValidateSchema => 45,
            Stage::AwaitApproval => 50,
            Stage::CreateEvents => 70,
            Stage::GeocodeBatch => 90,
            Stage::Completed => 100,
            Stage::Failed => 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[Stage] = &[
        Stage::DatasetDetection,
        Stage::AnalyzeDuplicates,
        Stage::DetectSchema,
        Stage::ValidateSchema,
        Stage::AwaitApproval,
        Stage::CreateEvents,
        Stage::GeocodeBatch,
        Stage::Completed,
        Stage::Failed,
    ];

    #[test]
    fn test_string_round_trip() {
        for stage in ALL {
            assert_eq!(Stage::from_str(stage.as_str()), Some(*stage));
        }
        assert_eq!(Stage::from_str("no-such-stage"), None);
    }

    #[test]
    fn test_chain_reaches_completed() {
        let mut stage = Stage::DatasetDetection;
        let mut hops = 0;
        while let Some(next) = stage.successor() {
            stage = next;
            hops += 1;
            assert!(hops < 10, "transition table loops");
        }
        assert_eq!(stage, Stage::Completed);
    }

    #[test]
    fn test_terminal_stages_have_no_successor() {
        assert_eq!(Stage::Completed.successor(), None);
        assert_eq!(Stage::Failed.successor(), None);
        assert!(Stage::Completed.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::AwaitApproval.is_terminal());
    }

    #[test]
    fn test_approval_resumes_at_create_events() {
        assert_eq!(Stage::AwaitApproval.successor(), Some(Stage::CreateEvents));
    }
}
