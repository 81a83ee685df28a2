//! Five-field cron expressions evaluated against wall-clock time in an
//! IANA timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Cron expression errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CronSpecError {
    #[error("expected 5 cron fields (minute hour day-of-month month day-of-week), got {got}")]
    FieldCount { got: usize },

    #[error("unparseable cron expression {expr:?}: {reason}")]
    Unparseable { expr: String, reason: String },
}

/// A parsed schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
    expr: String,
}

impl CronSchedule {
    /// Parse a standard 5-field expression
    /// (`minute hour day-of-month month day-of-week`).
    pub fn parse(expr: &str, timezone: Tz) -> Result<Self, CronSpecError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronSpecError::FieldCount { got: fields.len() });
        }

        // The cron crate wants a seconds field in front
        let full = format!("0 {}", fields.join(" "));
        let schedule = cron::Schedule::from_str(&full).map_err(|e| CronSpecError::Unparseable {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            schedule,
            timezone,
            expr: expr.to_string(),
        })
    }

    /// The expression as configured.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Next fire instant strictly after `now`, in UTC.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.timezone))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_monthly_default_fires_first_of_month() {
        let schedule = CronSchedule::parse("30 0 1 * *", chrono_tz::UTC).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 4, 1, 0, 30, 0).unwrap());
    }

    #[test]
    fn test_timezone_applied_to_wall_clock() {
        // 09:00 IST is 03:30 UTC
        let schedule = CronSchedule::parse("0 9 * * *", chrono_tz::Asia::Kolkata).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 15, 3, 30, 0).unwrap());
    }

    #[test]
    fn test_rejects_wrong_field_count() {
        assert!(matches!(
            CronSchedule::parse("0 9 * *", chrono_tz::UTC),
            Err(CronSpecError::FieldCount { got: 4 })
        ));
        assert!(matches!(
            CronSchedule::parse("not a cron at all", chrono_tz::UTC),
            Err(CronSpecError::Unparseable { .. })
        ));
    }
}
