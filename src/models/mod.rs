//! Domain models for the import pipeline.

mod auth;
mod dataset;
mod event;
mod import_file;
mod import_job;
mod quota;
mod scheduled_import;
mod stage;

pub use auth::AuthConfig;
pub use dataset::{
    DataSchema, Dataset, FieldDef, FieldType, IdentityStrategy, SchemaConfig, SchemaVersion,
    TransformKind, TransformRule,
};
pub use event::{Event, GeocodeResult, TransformNote, ValidationStatus};
pub use import_file::{FileMetadata, FileOrigin, FileStatus, ImportFile};
pub use import_job::{
    DuplicateSummary, GeocodeSummary, ImportJob, JobProgress, SchemaValidation, DEFAULT_BATCH_SIZE,
};
pub use quota::{QuotaKind, QuotaLimits, TrustLevel, UNLIMITED};
pub use scheduled_import::{
    ExecutionRecord, Frequency, RetryConfig, Schedule, ScheduleStats, ScheduledImport,
    EXECUTION_HISTORY_CAP,
};
pub use stage::Stage;
