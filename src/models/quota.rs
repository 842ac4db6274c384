//! Per-user quota ceilings by trust level.

use serde::{Deserialize, Serialize};

/// Sentinel for "no limit".
pub const UNLIMITED: i64 = -1;

/// User tier controlling quota ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Basic,
    Member,
    Power,
    /// Admin tier bypasses all checks.
    Unlimited,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Basic => "basic",
            TrustLevel::Member => "member",
            TrustLevel::Power => "power",
            TrustLevel::Unlimited => "unlimited",
        }
    }

    pub fn from_str(s: &str) -> Option<TrustLevel> {
        match s {
            "basic" => Some(TrustLevel::Basic),
            "member" => Some(TrustLevel::Member),
            "power" => Some(TrustLevel::Power),
            "unlimited" => Some(TrustLevel::Unlimited),
            _ => None,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        match self {
            TrustLevel::Basic => QuotaLimits {
                max_active_schedules: 2,
                url_fetches_per_day: 10,
                uploads_per_day: 5,
                events_per_import: 5_000,
                total_events: 50_000,
                import_jobs_per_day: 20,
                max_file_size_bytes: 10 * 1024 * 1024,
            },
            TrustLevel::Member => QuotaLimits {
                max_active_schedules: 10,
                url_fetches_per_day: 50,
                uploads_per_day: 25,
                events_per_import: 25_000,
                total_events: 500_000,
                import_jobs_per_day: 100,
                max_file_size_bytes: 50 * 1024 * 1024,
            },
            TrustLevel::Power => QuotaLimits {
                max_active_schedules: 50,
                url_fetches_per_day: 250,
                uploads_per_day: 100,
                events_per_import: 100_000,
                total_events: 5_000_000,
                import_jobs_per_day: 500,
                max_file_size_bytes: 200 * 1024 * 1024,
            },
            TrustLevel::Unlimited => QuotaLimits::unlimited(),
        }
    }
}

/// Numeric ceilings; `-1` means unlimited. Daily counters reset by date
/// key, lifetime totals never reset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_active_schedules: i64,
    pub url_fetches_per_day: i64,
    pub uploads_per_day: i64,
    pub events_per_import: i64,
    pub total_events: i64,
    pub import_jobs_per_day: i64,
    pub max_file_size_bytes: i64,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self {
            max_active_schedules: UNLIMITED,
            url_fetches_per_day: UNLIMITED,
            uploads_per_day: UNLIMITED,
            events_per_import: UNLIMITED,
            total_events: UNLIMITED,
            import_jobs_per_day: UNLIMITED,
            max_file_size_bytes: UNLIMITED,
        }
    }
}

/// The countable actions quotas track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    UrlFetch,
    Upload,
    ImportJob,
    /// Lifetime total, not reset daily.
    TotalEvents,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::UrlFetch => "url-fetch",
            QuotaKind::Upload => "upload",
            QuotaKind::ImportJob => "import-job",
            QuotaKind::TotalEvents => "total-events",
        }
    }

    /// Daily counters get a date key; lifetime counters share one bucket.
    pub fn resets_daily(&self) -> bool {
        !matches!(self, QuotaKind::TotalEvents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_tier_uses_sentinel() {
        let limits = TrustLevel::Unlimited.limits();
        assert_eq!(limits.uploads_per_day, UNLIMITED);
        assert_eq!(limits.total_events, UNLIMITED);
    }

    #[test]
    fn test_tiers_increase() {
        assert!(
            TrustLevel::Basic.limits().uploads_per_day
                < TrustLevel::Member.limits().uploads_per_day
        );
        assert!(
            TrustLevel::Member.limits().url_fetches_per_day
                < TrustLevel::Power.limits().url_fetches_per_day
        );
    }

    #[test]
    fn test_total_events_is_lifetime() {
        assert!(!QuotaKind::TotalEvents.resets_daily());
        assert!(QuotaKind::Upload.resets_daily());
    }
}
