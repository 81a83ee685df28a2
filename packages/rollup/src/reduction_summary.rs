//! Reduction summariser: per-period aggregates of the reduction ledger,
//! embedded into the corresponding emission summary.

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::reduction::{Mechanism, ReductionEntry, ReductionError, ReductionProject};
use crate::store::ReductionStore;
use crate::summary::{trend, Period, Trend};

/// One point of a trend series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub label: String,
    pub value: f64,
}

/// Reduction-vs-removal split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MechanismSplit {
    pub reduction: f64,
    pub removal: f64,
}

/// A top contributing project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopSource {
    pub project_id: String,
    pub name: String,
    pub total: f64,
}

/// A category ranked by contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPriority {
    pub category: String,
    pub total: f64,
    pub share_pct: f64,
}

/// Extended analytics attached to a reduction summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculationSummary {
    pub monthly_trend: Vec<TrendPoint>,
    pub quarterly_trend: Vec<TrendPoint>,
    pub yearly_trend: Vec<TrendPoint>,
    pub mechanism_split: MechanismSplit,
    pub top_sources: Vec<TopSource>,
    pub period_comparison: Trend,
    /// Share of registered projects with at least one entry this period
    pub data_completeness_pct: f64,
    pub category_priorities: Vec<CategoryPriority>,
    /// Net reduction this year against the summed annual targets
    pub achievement_pct: Option<f64>,
}

/// Per-period reduction aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReductionSummary {
    pub total_net_reduction: f64,
    pub by_project: HashMap<String, f64>,
    pub by_category: HashMap<String, f64>,
    pub by_scope: HashMap<String, f64>,
    pub by_location: HashMap<String, f64>,
    pub by_activity: HashMap<String, f64>,
    pub by_methodology: HashMap<String, f64>,
    pub entry_count: u64,
    pub calculation: Option<CalculationSummary>,
}

/// Builds reduction summaries from the ledger's store.
pub struct ReductionSummariser {
    store: Arc<dyn ReductionStore>,
    timezone: Tz,
}

impl ReductionSummariser {
    pub fn new(store: Arc<dyn ReductionStore>, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    /// Summarise a client's reductions for one period. Returns `None`
    /// when the client has neither projects nor entries.
    pub async fn summarise(
        &self,
        client_id: &str,
        period: &Period,
    ) -> Result<Option<ReductionSummary>, ReductionError> {
        let projects = self.store.projects(client_id).await?;
        let (from, to) = period.bounds(self.timezone);
        let entries = self.entries_between(client_id, from, to).await?;

        if projects.is_empty() && entries.is_empty() {
            return Ok(None);
        }

        let by_project_meta: HashMap<&str, &ReductionProject> = projects
            .iter()
            .map(|p| (p.project_id.as_str(), p))
            .collect();

        let mut summary = ReductionSummary::default();
        let mut split = MechanismSplit::default();

        for entry in &entries {
            summary.total_net_reduction += entry.net_reduction;
            summary.entry_count += 1;
            *summary
                .by_project
                .entry(entry.project_id.clone())
                .or_insert(0.0) += entry.net_reduction;
            *summary
                .by_methodology
                .entry(entry.methodology.as_str().to_string())
                .or_insert(0.0) += entry.net_reduction;

            if let Some(project) = by_project_meta.get(entry.project_id.as_str()) {
                *summary
                    .by_category
                    .entry(project.category.clone())
                    .or_insert(0.0) += entry.net_reduction;
                if let Some(scope) = project.scope_type {
                    *summary
                        .by_scope
                        .entry(scope.as_str().to_string())
                        .or_insert(0.0) += entry.net_reduction;
                }
                if let Some(location) = &project.location {
                    *summary.by_location.entry(location.clone()).or_insert(0.0) +=
                        entry.net_reduction;
                }
                if let Some(activity) = &project.activity {
                    *summary.by_activity.entry(activity.clone()).or_insert(0.0) +=
                        entry.net_reduction;
                }
                match project.mechanism {
                    Mechanism::Reduction => split.reduction += entry.net_reduction,
                    Mechanism::Removal => split.removal += entry.net_reduction,
                }
            }
        }

        summary.calculation = Some(
            self.calculation_summary(client_id, period, &projects, &entries, &summary, split)
                .await?,
        );
        Ok(Some(summary))
    }

    async fn calculation_summary(
        &self,
        client_id: &str,
        period: &Period,
        projects: &[ReductionProject],
        entries: &[ReductionEntry],
        summary: &ReductionSummary,
        mechanism_split: MechanismSplit,
    ) -> Result<CalculationSummary, ReductionError> {
        let anchor = self.anchor_month(period);

        let mut monthly_trend = Vec::with_capacity(12);
        for offset in (0..12).rev() {
            let (year, month) = shift_month(anchor, -(offset as i32));
            let total = self
                .month_total(client_id, year, month)
                .await?;
            monthly_trend.push(TrendPoint {
                label: format!("{:04}-{:02}", year, month),
                value: total,
            });
        }

        let mut quarterly_trend = Vec::with_capacity(4);
        for offset in (0..4).rev() {
            let (year, end_month) = shift_month(anchor, -(offset as i32) * 3);
            let quarter = (end_month - 1) / 3 + 1;
            let mut total = 0.0;
            for m in 0..3 {
                let (y, mth) = shift_month((year, end_month), -(m as i32));
                total += self.month_total(client_id, y, mth).await?;
            }
            quarterly_trend.push(TrendPoint {
                label: format!("{:04}-Q{}", year, quarter),
                value: total,
            });
        }

        let mut yearly_trend = Vec::with_capacity(3);
        for offset in (0..3).rev() {
            let year = anchor.0 - offset;
            let total = self.year_total(client_id, year).await?;
            yearly_trend.push(TrendPoint {
                label: format!("{:04}", year),
                value: total,
            });
        }

        let previous_total = match period.preceding() {
            Some(prev) => {
                let (from, to) = prev.bounds(self.timezone);
                self.entries_between(client_id, from, to)
                    .await?
                    .iter()
                    .map(|e| e.net_reduction)
                    .sum()
            }
            None => 0.0,
        };

        let active_projects = entries
            .iter()
            .map(|e| e.project_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let data_completeness_pct = if projects.is_empty() {
            0.0
        } else {
            active_projects as f64 / projects.len() as f64 * 100.0
        };

        let mut top_sources: Vec<TopSource> = summary
            .by_project
            .iter()
            .map(|(project_id, total)| TopSource {
                project_id: project_id.clone(),
                name: projects
                    .iter()
                    .find(|p| &p.project_id == project_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| project_id.clone()),
                total: *total,
            })
            .collect();
        top_sources.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));
        top_sources.truncate(5);

        let grand_total = summary.total_net_reduction;
        let mut category_priorities: Vec<CategoryPriority> = summary
            .by_category
            .iter()
            .map(|(category, total)| CategoryPriority {
                category: category.clone(),
                total: *total,
                share_pct: if grand_total.abs() > f64::EPSILON {
                    total / grand_total * 100.0
                } else {
                    0.0
                },
            })
            .collect();
        category_priorities
            .sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));

        let target_sum: f64 = projects.iter().filter_map(|p| p.annual_target).sum();
        let achievement_pct = if target_sum > 0.0 {
            let year_total = self.year_total(client_id, anchor.0).await?;
            Some(year_total / target_sum * 100.0)
        } else {
            None
        };

        Ok(CalculationSummary {
            monthly_trend,
            quarterly_trend,
            yearly_trend,
            mechanism_split,
            top_sources,
            period_comparison: trend(summary.total_net_reduction, previous_total),
            data_completeness_pct,
            category_priorities,
            achievement_pct,
        })
    }

    fn anchor_month(&self, period: &Period) -> (i32, u32) {
        match period {
            Period::Daily { date } => (date.year(), date.month()),
            Period::Weekly { .. } | Period::AllTime => {
                let now = Utc::now().with_timezone(&self.timezone).date_naive();
                (now.year(), now.month())
            }
            Period::Monthly { year, month } => (*year, *month),
            Period::Yearly { year } => (*year, 12),
        }
    }

    async fn month_total(&self, client_id: &str, year: i32, month: u32) -> Result<f64, ReductionError> {
        let period = Period::Monthly { year, month };
        let (from, to) = period.bounds(self.timezone);
        Ok(self
            .entries_between(client_id, from, to)
            .await?
            .iter()
            .map(|e| e.net_reduction)
            .sum())
    }

    async fn year_total(&self, client_id: &str, year: i32) -> Result<f64, ReductionError> {
        let period = Period::Yearly { year };
        let (from, to) = period.bounds(self.timezone);
        Ok(self
            .entries_between(client_id, from, to)
            .await?
            .iter()
            .map(|e| e.net_reduction)
            .sum())
    }

    async fn entries_between(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to_exclusive: DateTime<Utc>,
    ) -> Result<Vec<ReductionEntry>, ReductionError> {
        let to = to_exclusive - Duration::nanoseconds(1);
        Ok(self
            .store
            .client_entries_in_range(client_id, from, to)
            .await?)
    }
}

/// Shift a (year, month) pair by a signed number of months.
fn shift_month((year, month): (i32, u32), offset: i32) -> (i32, u32) {
    let zero_based = year * 12 + month as i32 - 1 + offset;
    (zero_based.div_euclid(12), (zero_based.rem_euclid(12) + 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::{Methodology, ReductionInput, ReductionLedger};
    use crate::store::InMemoryReductionStore;
    use carbonplane_bus::BroadcastBus;
    use chrono::TimeZone;

    #[test]
    fn test_shift_month_wraps_years() {
        assert_eq!(shift_month((2024, 1), -1), (2023, 12));
        assert_eq!(shift_month((2024, 12), 1), (2025, 1));
        assert_eq!(shift_month((2024, 6), -18), (2022, 12));
    }

    async fn seeded() -> (Arc<InMemoryReductionStore>, ReductionLedger) {
        let store = Arc::new(InMemoryReductionStore::new());
        let ledger = ReductionLedger::new(
            Arc::clone(&store) as Arc<dyn ReductionStore>,
            Arc::new(BroadcastBus::new()),
        );
        ledger
            .register_project(
                "acme",
                ReductionProject::new("solar-1", "Rooftop solar", "renewables")
                    .with_location("Pune")
                    .with_target(10_000.0),
            )
            .await
            .unwrap();
        ledger
            .register_project(
                "acme",
                ReductionProject::new("forest-1", "Afforestation", "nature")
                    .with_mechanism(Mechanism::Removal),
            )
            .await
            .unwrap();
        (store, ledger)
    }

    #[tokio::test]
    async fn test_summarise_breaks_down_by_axes() {
        let (store, ledger) = seeded().await;
        let march = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        ledger
            .append("acme", "solar-1", ReductionInput::M2 { net_reduction: 800.0 }, Some(march), None)
            .await
            .unwrap();
        ledger
            .append("acme", "forest-1", ReductionInput::M2 { net_reduction: 200.0 }, Some(march), None)
            .await
            .unwrap();

        let summariser = ReductionSummariser::new(store, chrono_tz::UTC);
        let summary = summariser
            .summarise("acme", &Period::Monthly { year: 2024, month: 3 })
            .await
            .unwrap()
            .unwrap();

        assert!((summary.total_net_reduction - 1000.0).abs() < 1e-9);
        assert_eq!(summary.by_project.len(), 2);
        assert!((summary.by_category["renewables"] - 800.0).abs() < 1e-9);
        assert!((summary.by_location["Pune"] - 800.0).abs() < 1e-9);
        assert!((summary.by_methodology["M2"] - 1000.0).abs() < 1e-9);

        let calc = summary.calculation.unwrap();
        assert!((calc.mechanism_split.reduction - 800.0).abs() < 1e-9);
        assert!((calc.mechanism_split.removal - 200.0).abs() < 1e-9);
        assert_eq!(calc.data_completeness_pct, 100.0);
        assert_eq!(calc.top_sources[0].project_id, "solar-1");
        assert_eq!(calc.monthly_trend.len(), 12);
        // 800 of the 10,000 annual target
        assert!((calc.achievement_pct.unwrap() - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_projects_no_entries_is_none() {
        let store = Arc::new(InMemoryReductionStore::new());
        let summariser =
            ReductionSummariser::new(store as Arc<dyn ReductionStore>, chrono_tz::UTC);
        let result = summariser
            .summarise("ghost", &Period::AllTime)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_methodology_stream_isolated() {
        let (store, ledger) = seeded().await;
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        ledger
            .append(
                "acme",
                "solar-1",
                ReductionInput::M1 { input_value: 100.0, emission_reduction_rate: 2.0 },
                Some(t),
                None,
            )
            .await
            .unwrap();

        let m1 = store.stream("acme", "solar-1", Methodology::M1).await.unwrap();
        let m2 = store.stream("acme", "solar-1", Methodology::M2).await.unwrap();
        assert_eq!(m1.len(), 1);
        assert!(m2.is_empty());
    }
}
