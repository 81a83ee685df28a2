//! Summary documents: periods, axis totals, trends.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use carbonplane_factors::GasVector;

use crate::reduction_summary::ReductionSummary;

/// Tolerance below which two totals compare equal.
pub const SAME_TOLERANCE: f64 = 1e-6;

/// A summary period. Weeks are ISO-8601 week-dates; the weekly key is
/// `(iso year, iso week)` and the bounds run Monday through Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Period {
    Daily { date: NaiveDate },
    Weekly { iso_year: i32, iso_week: u32 },
    Monthly { year: i32, month: u32 },
    Yearly { year: i32 },
    #[serde(rename = "all-time")]
    AllTime,
}

impl Period {
    /// The five periods containing an instant, evaluated in `tz`.
    pub fn containing(timestamp: DateTime<Utc>, tz: Tz) -> [Period; 5] {
        let local = timestamp.with_timezone(&tz);
        let date = local.date_naive();
        let iso = date.iso_week();
        [
            Period::Daily { date },
            Period::Weekly {
                iso_year: iso.year(),
                iso_week: iso.week(),
            },
            Period::Monthly {
                year: date.year(),
                month: date.month(),
            },
            Period::Yearly { year: date.year() },
            Period::AllTime,
        ]
    }

    /// Local start date of the period.
    fn start_date(&self) -> Option<NaiveDate> {
        match self {
            Period::Daily { date } => Some(*date),
            Period::Weekly { iso_year, iso_week } => {
                NaiveDate::from_isoywd_opt(*iso_year, *iso_week, Weekday::Mon)
            }
            Period::Monthly { year, month } => NaiveDate::from_ymd_opt(*year, *month, 1),
            Period::Yearly { year } => NaiveDate::from_ymd_opt(*year, 1, 1),
            Period::AllTime => None,
        }
    }

    /// Local end date (exclusive) of the period.
    fn end_date(&self) -> Option<NaiveDate> {
        match self {
            Period::Daily { date } => date.succ_opt(),
            Period::Weekly { .. } => self.start_date().map(|d| d + Duration::weeks(1)),
            Period::Monthly { year, month } => {
                let (next_year, next_month) = if *month == 12 {
                    (*year + 1, 1)
                } else {
                    (*year, *month + 1)
                };
                NaiveDate::from_ymd_opt(next_year, next_month, 1)
            }
            Period::Yearly { year } => NaiveDate::from_ymd_opt(*year + 1, 1, 1),
            Period::AllTime => None,
        }
    }

    /// UTC bounds `[from, to)` of the period in `tz`. All-time spans the
    /// representable range.
    pub fn bounds(&self, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
        let to_utc = |date: NaiveDate| {
            tz.from_local_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };

        match (self.start_date(), self.end_date()) {
            (Some(start), Some(end)) => (to_utc(start), to_utc(end)),
            _ => (
                DateTime::<Utc>::MIN_UTC,
                DateTime::<Utc>::MAX_UTC,
            ),
        }
    }

    /// The equal-length period immediately preceding this one.
    pub fn preceding(&self) -> Option<Period> {
        match self {
            Period::Daily { date } => date.pred_opt().map(|date| Period::Daily { date }),
            Period::Weekly { .. } => {
                let start = self.start_date()?;
                let prev = start - Duration::weeks(1);
                let iso = prev.iso_week();
                Some(Period::Weekly {
                    iso_year: iso.year(),
                    iso_week: iso.week(),
                })
            }
            Period::Monthly { year, month } => Some(if *month == 1 {
                Period::Monthly {
                    year: year - 1,
                    month: 12,
                }
            } else {
                Period::Monthly {
                    year: *year,
                    month: month - 1,
                }
            }),
            Period::Yearly { year } => Some(Period::Yearly { year: year - 1 }),
            Period::AllTime => None,
        }
    }

    /// Stable storage key.
    pub fn key(&self) -> String {
        match self {
            Period::Daily { date } => format!("daily:{}", date),
            Period::Weekly { iso_year, iso_week } => {
                format!("weekly:{}-W{:02}", iso_year, iso_week)
            }
            Period::Monthly { year, month } => format!("monthly:{:04}-{:02}", year, month),
            Period::Yearly { year } => format!("yearly:{:04}", year),
            Period::AllTime => "all-time".to_string(),
        }
    }
}

/// Per-axis aggregate: per-gas masses plus the count of contributing
/// entries. Uncertainty is the summed absolute CO2e uncertainty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisTotals {
    pub co2e: f64,
    pub co2: f64,
    pub ch4: f64,
    pub n2o: f64,
    pub uncertainty: f64,
    pub data_point_count: u64,
}

impl AxisTotals {
    /// Fold one entry's vector into the axis.
    pub fn fold(&mut self, gases: &GasVector) {
        self.co2e += gases.co2e;
        self.co2 += gases.co2;
        self.ch4 += gases.ch4;
        self.n2o += gases.n2o;
        self.uncertainty += gases.uncertainty;
        self.data_point_count += 1;
    }
}

/// Category axis entry with its nested activity breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub totals: AxisTotals,
    pub activities: HashMap<String, AxisTotals>,
}

/// Direction of a period-over-period delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Same,
}

/// A period-over-period delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub value: f64,
    pub percentage: f64,
    pub direction: TrendDirection,
}

impl Default for Trend {
    fn default() -> Self {
        Self {
            value: 0.0,
            percentage: 0.0,
            direction: TrendDirection::Same,
        }
    }
}

/// Compare a current total against the preceding period's.
pub fn trend(current: f64, previous: f64) -> Trend {
    let value = current - previous;
    if value.abs() < SAME_TOLERANCE {
        return Trend {
            value,
            percentage: 0.0,
            direction: TrendDirection::Same,
        };
    }
    let percentage = if previous.abs() < SAME_TOLERANCE {
        100.0
    } else {
        value / previous * 100.0
    };
    Trend {
        value,
        percentage,
        direction: if value > 0.0 {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        },
    }
}

/// Period-over-period trends per axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trends {
    pub total_co2e: Trend,
    pub data_point_count: Trend,
    pub by_scope: HashMap<String, Trend>,
    pub by_category: HashMap<String, Trend>,
}

/// The process-filtered mirror: only scopes appearing in the process
/// flowchart, with the allocation split applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessEmissionSummary {
    /// Sum of allocated shares across process nodes
    pub totals: AxisTotals,
    pub by_node: HashMap<String, AxisTotals>,
    pub by_scope: HashMap<String, AxisTotals>,
    /// Residual not attributed to any process node, including emissions
    /// of scopes absent from the process chart entirely
    pub unallocated: AxisTotals,
    pub shared_scope_count: u64,
    pub allocation_warnings: Vec<String>,
}

/// Summary lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub last_calculated: DateTime<Utc>,
    /// Imported from another system; protected from auto recompute
    pub migrated_data: bool,
    /// Hard protection bit: only explicit force calls may overwrite
    pub prevent_auto_recalculation: bool,
    /// Processed entries folded in
    pub entry_count: u64,
    /// Entries whose scope identifier was absent from the active chart
    /// and fell back to "Unknown" dimensions - a loss signal
    pub unknown_scope_count: u64,
}

impl Default for SummaryMetadata {
    fn default() -> Self {
        Self {
            last_calculated: Utc::now(),
            migrated_data: false,
            prevent_auto_recalculation: false,
            entry_count: 0,
            unknown_scope_count: 0,
        }
    }
}

/// One summary document per (client, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionSummary {
    pub summary_id: Uuid,
    pub client_id: String,
    pub period: Period,
    pub totals: AxisTotals,
    pub by_scope: HashMap<String, AxisTotals>,
    pub by_category: HashMap<String, CategoryTotals>,
    pub by_activity: HashMap<String, AxisTotals>,
    pub by_node: HashMap<String, AxisTotals>,
    pub by_department: HashMap<String, AxisTotals>,
    pub by_location: HashMap<String, AxisTotals>,
    pub by_input_type: HashMap<String, AxisTotals>,
    pub by_emission_factor: HashMap<String, AxisTotals>,
    pub trends: Trends,
    pub process: ProcessEmissionSummary,
    pub reduction: Option<ReductionSummary>,
    pub metadata: SummaryMetadata,
}

impl EmissionSummary {
    pub fn empty(client_id: impl Into<String>, period: Period) -> Self {
        Self {
            summary_id: Uuid::new_v4(),
            client_id: client_id.into(),
            period,
            totals: AxisTotals::default(),
            by_scope: HashMap::new(),
            by_category: HashMap::new(),
            by_activity: HashMap::new(),
            by_node: HashMap::new(),
            by_department: HashMap::new(),
            by_location: HashMap::new(),
            by_input_type: HashMap::new(),
            by_emission_factor: HashMap::new(),
            trends: Trends::default(),
            process: ProcessEmissionSummary::default(),
            reduction: None,
            metadata: SummaryMetadata::default(),
        }
    }

    /// Protected summaries are skipped by the automatic recompute path.
    pub fn is_protected(&self) -> bool {
        self.metadata.prevent_auto_recalculation || self.metadata.migrated_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_containing_periods_use_iso_week() {
        // 2024-01-01 is a Monday in ISO week 1 of 2024
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let periods = Period::containing(ts, chrono_tz::UTC);
        assert!(periods.contains(&Period::Weekly {
            iso_year: 2024,
            iso_week: 1
        }));

        // 2023-01-01 is a Sunday belonging to ISO week 52 of 2022
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap();
        let periods = Period::containing(ts, chrono_tz::UTC);
        assert!(periods.contains(&Period::Weekly {
            iso_year: 2022,
            iso_week: 52
        }));
    }

    #[test]
    fn test_timezone_shifts_daily_period() {
        // 2024-03-01 23:30 UTC is already March 2nd in IST
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        let periods = Period::containing(ts, chrono_tz::Asia::Kolkata);
        assert!(periods.contains(&Period::Daily {
            date: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()
        }));
    }

    #[test]
    fn test_monthly_bounds_and_preceding() {
        let period = Period::Monthly { year: 2024, month: 1 };
        let (from, to) = period.bounds(chrono_tz::UTC);
        assert_eq!(from, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(
            period.preceding(),
            Some(Period::Monthly { year: 2023, month: 12 })
        );
    }

    #[test]
    fn test_weekly_preceding_crosses_year() {
        let period = Period::Weekly { iso_year: 2024, iso_week: 1 };
        assert_eq!(
            period.preceding(),
            Some(Period::Weekly { iso_year: 2023, iso_week: 52 })
        );
    }

    #[test]
    fn test_trend_directions() {
        assert_eq!(trend(10.0, 5.0).direction, TrendDirection::Up);
        assert_eq!(trend(10.0, 5.0).percentage, 100.0);
        assert_eq!(trend(5.0, 10.0).direction, TrendDirection::Down);
        assert_eq!(trend(5.0, 5.0).direction, TrendDirection::Same);
        // Within tolerance counts as same
        assert_eq!(trend(5.0, 5.0 + 1e-9).direction, TrendDirection::Same);
        // From zero
        assert_eq!(trend(5.0, 0.0).percentage, 100.0);
    }

    #[test]
    fn test_axis_fold_counts_points() {
        let mut axis = AxisTotals::default();
        axis.fold(&GasVector::co2e_only(100.0));
        axis.fold(&GasVector::co2e_only(50.0));
        assert_eq!(axis.co2e, 150.0);
        assert_eq!(axis.data_point_count, 2);
    }

    #[test]
    fn test_period_keys_are_stable() {
        assert_eq!(
            Period::Monthly { year: 2024, month: 3 }.key(),
            "monthly:2024-03"
        );
        assert_eq!(
            Period::Weekly { iso_year: 2024, iso_week: 9 }.key(),
            "weekly:2024-W09"
        );
        assert_eq!(Period::AllTime.key(), "all-time");
    }
}
