//! Entry date/time parsing in the configured ingestion timezone.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Timestamp parse failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimeParseError {
    #[error("unparseable date {value:?} (expected DD/MM/YYYY or YYYY-MM-DD)")]
    BadDate { value: String },

    #[error("unparseable time {value:?} (expected HH:mm:ss)")]
    BadTime { value: String },

    #[error("local time {value} does not exist in timezone {tz}")]
    NonexistentLocalTime { value: String, tz: String },
}

/// Parse an entry's date and time, defaulting either to "now" in the
/// configured timezone, and return the naive components plus the UTC
/// instant. Ambiguous local times (DST fold) take the earlier instant.
pub fn parse_entry_timestamp(
    date: Option<&str>,
    time: Option<&str>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<(NaiveDate, NaiveTime, DateTime<Utc>), TimeParseError> {
    let local_now = now.with_timezone(&tz);

    let date = match date.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_date(raw)?,
        None => local_now.date_naive(),
    };

    let time = match time.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .map_err(|_| TimeParseError::BadTime {
                value: raw.to_string(),
            })?,
        None => local_now.time(),
    };

    let naive = date.and_time(time);
    let timestamp = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| TimeParseError::NonexistentLocalTime {
            value: naive.to_string(),
            tz: tz.name().to_string(),
        })?
        .with_timezone(&Utc);

    Ok((date, time, timestamp))
}

fn parse_date(raw: &str) -> Result<NaiveDate, TimeParseError> {
    NaiveDate::parse_from_str(raw, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .map_err(|_| TimeParseError::BadDate {
            value: raw.to_string(),
        })
}
