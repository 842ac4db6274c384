//! Recurring fetch definitions.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::AuthConfig;
use crate::error::ImportError;

/// Maximum execution history entries retained per schedule.
pub const EXECUTION_HISTORY_CAP: usize = 10;

/// Named trigger frequencies for schedules that do not use cron.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }

    pub fn from_str(s: &str) -> Option<Frequency> {
        match s {
            "hourly" => Some(Frequency::Hourly),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            _ => None,
        }
    }

    /// Interval between runs. Months are treated as 30 days.
    pub fn interval(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
            Frequency::Monthly => Duration::days(30),
        }
    }
}

/// When a schedule fires. Exactly one variant exists per schedule; the
/// one-of cron/frequency invariant is carried by the type itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Cron { expression: String },
    Frequency { frequency: Frequency },
}

impl Schedule {
    /// Validate a cron expression, accepting standard five-field crontab
    /// syntax by prepending a seconds field.
    pub fn cron(expression: &str) -> Result<Schedule, ImportError> {
        let normalized = normalize_cron(expression);
        cron::Schedule::from_str(&normalized)
            .map_err(|e| ImportError::Validation(format!("invalid cron expression: {}", e)))?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
        })
    }

    /// Whether this schedule is due at `now`, given the previous run.
    ///
    /// Frequency schedules fire once `now >= last_run + interval`. Cron
    /// schedules fire once the first occurrence after `last_run` has passed.
    /// A schedule that has never run is due immediately.
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let last_run = match last_run {
            Some(t) => t,
            None => return true,
        };
        match self.next_after(last_run) {
            Some(next) => now >= next,
            None => false,
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Frequency { frequency } => Some(after + frequency.interval()),
            Schedule::Cron { expression } => {
                let parsed = cron::Schedule::from_str(&normalize_cron(expression)).ok()?;
                parsed.after(&after).next()
            }
        }
    }
}

/// Cron expressions are evaluated with a seconds field; plain crontab
/// five-field expressions get a zero-seconds prefix.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

/// Retry policy for source fetching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    /// Exponential backoff when true, fixed delay otherwise.
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1_000,
            exponential: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let ms = if self.exponential {
            self.delay_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        } else {
            self.delay_ms
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Outcome of a single scheduled run, newest first in the history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub started_at: DateTime<Utc>,
    pub status: String,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Aggregate run statistics for a schedule.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScheduleStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Running average duration of completed runs.
    pub average_duration_ms: u64,
}

impl ScheduleStats {
    /// Fold one run into the totals and the running average.
    pub fn record_run(&mut self, success: bool, duration_ms: u64) {
        let prior = self.total_runs;
        self.total_runs += 1;
        if success {
            self.successful_runs += 1;
        } else {
            self.failed_runs += 1;
        }
        self.average_duration_ms =
            (self.average_duration_ms * prior + duration_ms) / self.total_runs;
    }
}

/// A recurring fetch definition with a cron or frequency trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledImport {
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub auth: AuthConfig,
    pub schedule: Schedule,
    /// Opaque per-schedule secret enabling external HTTP triggering.
    pub webhook_token: String,
    pub webhook_enabled: bool,
    pub enabled: bool,
    pub catalog_id: String,
    /// Target dataset; `None` lets dataset-detection map sheets.
    pub dataset_id: Option<String>,
    /// Actor charged for quota accounting.
    pub created_by: String,
    pub retry: RetryConfig,
    /// Skip the content-hash duplicate short-circuit for this schedule.
    pub skip_duplicate_check: bool,
    /// Honor generic server content types by overriding with this MIME type.
    pub expected_content_type: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    /// Most-recent-first, capped at [`EXECUTION_HISTORY_CAP`].
    pub execution_history: Vec<ExecutionRecord>,
    pub stats: ScheduleStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledImport {
    pub fn new(
        name: String,
        source_url: String,
        schedule: Schedule,
        catalog_id: String,
        created_by: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            source_url,
            auth: AuthConfig::None,
            schedule,
            webhook_token: Uuid::new_v4().simple().to_string(),
            webhook_enabled: true,
            enabled: true,
            catalog_id,
            dataset_id: None,
            created_by,
            retry: RetryConfig::default(),
            skip_duplicate_check: false,
            expected_content_type: None,
            last_run: None,
            last_status: None,
            last_error: None,
            next_run: None,
            execution_history: Vec::new(),
            stats: ScheduleStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Prepend an execution record, evicting the oldest past the cap.
    pub fn push_history(&mut self, record: ExecutionRecord) {
        self.execution_history.insert(0, record);
        self.execution_history.truncate(EXECUTION_HISTORY_CAP);
    }

    /// Validate fields that cannot be enforced by the type system.
    pub fn validate(&self) -> Result<(), ImportError> {
        url::Url::parse(&self.source_url)
            .map_err(|e| ImportError::Validation(format!("invalid source URL: {}", e)))?;
        if let Schedule::Cron { expression } = &self.schedule {
            Schedule::cron(expression)?;
        }
        if self.name.trim().is_empty() {
            return Err(ImportError::Validation("schedule name is empty".into()));
        }
        Ok(())
    }
}
