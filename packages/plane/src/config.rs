//! Plane configuration: one timezone and one cron expression per job,
//! applied uniformly to CSV parsing, ingestion defaults, period bounds,
//! and the scheduler.

use chrono_tz::Tz;
use std::time::Duration;

use carbonplane_pipeline::WorkerConfig;

/// Environment variable overriding the configured timezone.
const TZ_ENV: &str = "CARBONPLANE_TIMEZONE";

/// Configuration of a `CarbonPlane`.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    /// The single timezone everything runs in
    pub timezone: Tz,
    /// Monthly aggregation schedule
    pub monthly_aggregation_cron: String,
    /// Overdue detection schedule
    pub overdue_cron: String,
    /// Summary refresh schedule
    pub summary_cron: String,
    /// Abort window for scheduled jobs
    pub job_window: Duration,
    /// Calculation worker tuning
    pub worker: WorkerConfig,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            monthly_aggregation_cron: "30 0 1 * *".to_string(),
            overdue_cron: "0 9 * * *".to_string(),
            summary_cron: "0 2 1 * *".to_string(),
            job_window: Duration::from_secs(3600),
            worker: WorkerConfig::default(),
        }
    }
}

impl PlaneConfig {
    /// Defaults, with the timezone taken from `CARBONPLANE_TIMEZONE`
    /// when set and valid.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(TZ_ENV) {
            match raw.parse::<Tz>() {
                Ok(tz) => config.timezone = tz,
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring unparseable {}", TZ_ENV);
                }
            }
        }
        config
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_job_window(mut self, window: Duration) -> Self {
        self.job_window = window;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = PlaneConfig::default();
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.monthly_aggregation_cron, "30 0 1 * *");
        assert_eq!(config.overdue_cron, "0 9 * * *");
        assert_eq!(config.summary_cron, "0 2 1 * *");
    }

    #[test]
    fn test_builder_overrides() {
        let config = PlaneConfig::default()
            .with_timezone(chrono_tz::Asia::Kolkata)
            .with_job_window(Duration::from_secs(60));
        assert_eq!(config.timezone, chrono_tz::Asia::Kolkata);
        assert_eq!(config.job_window, Duration::from_secs(60));
    }
}
