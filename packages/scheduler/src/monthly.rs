//! Monthly aggregation: for every active client and manual scope, build
//! the prior month's summary row and delete the month's raw entries in
//! one atomic swap. Missed months are detected from the oldest raw entry
//! and filled month by month; existing summaries are never recreated.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use carbonplane_bus::{ChangeEvent, EventBus, EventKind};
use carbonplane_factors::GasVector;
use carbonplane_pipeline::{
    resequence, CalculatedEmissions, EntryStore, MeasurementEntry, ProcessingStatus, StreamKey,
    StreamLocks, SummaryPeriod,
};
use carbonplane_registry::{ChartKind, ClientStore, FlowchartRegistry, InputType};
use carbonplane_rollup::{Materialiser, Period};

use crate::jobs::{Job, JobError, JobReport};

/// The monthly aggregation job.
pub struct MonthlyAggregationJob {
    clients: Arc<dyn ClientStore>,
    registry: Arc<FlowchartRegistry>,
    entries: Arc<dyn EntryStore>,
    materialiser: Arc<Materialiser>,
    bus: Arc<dyn EventBus>,
    locks: StreamLocks,
    timezone: Tz,
}

impl MonthlyAggregationJob {
    pub fn new(
        clients: Arc<dyn ClientStore>,
        registry: Arc<FlowchartRegistry>,
        entries: Arc<dyn EntryStore>,
        materialiser: Arc<Materialiser>,
        bus: Arc<dyn EventBus>,
        locks: StreamLocks,
        timezone: Tz,
    ) -> Self {
        Self {
            clients,
            registry,
            entries,
            materialiser,
            bus,
            locks,
            timezone,
        }
    }

    /// Archive every completed month of one stream. Returns the periods
    /// archived.
    pub async fn archive_stream(&self, key: &StreamKey) -> Result<Vec<SummaryPeriod>, JobError> {
        let lock = self.locks.for_stream(key);
        let _guard = lock.lock().await;

        let Some(oldest) = self
            .entries
            .oldest_raw_entry(key)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?
        else {
            return Ok(Vec::new());
        };

        let now_local = Utc::now().with_timezone(&self.timezone).date_naive();
        let current = (now_local.year(), now_local.month());
        let oldest_local = oldest.with_timezone(&self.timezone).date_naive();
        let mut cursor = (oldest_local.year(), oldest_local.month());

        let mut archived = Vec::new();
        while cursor < current {
            let period = SummaryPeriod {
                month: cursor.1,
                year: cursor.0,
            };

            let exists = self
                .entries
                .has_month_summary(key, period)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?;
            if !exists {
                if let Some(summary) = self.archive_month(key, period).await? {
                    archived.push(period);

                    let event = ChangeEvent::new(
                        key.client_id.clone(),
                        EventKind::MonthlySummaryCreated,
                        serde_json::json!({
                            "nodeId": key.node_id,
                            "scopeIdentifier": key.scope_identifier,
                            "month": period.month,
                            "year": period.year,
                            "totalCo2e": summary
                                .calculated_emissions
                                .as_ref()
                                .map(|c| c.incoming.co2e)
                                .unwrap_or(0.0),
                        }),
                    );
                    self.bus.publish(&event.topic(), event).await;
                }
            }

            cursor = if cursor.1 == 12 {
                (cursor.0 + 1, 1)
            } else {
                (cursor.0, cursor.1 + 1)
            };
        }
        Ok(archived)
    }

    /// Build the summary row for one month and swap it in. Returns `None`
    /// when the month has no raw entries.
    async fn archive_month(
        &self,
        key: &StreamKey,
        period: SummaryPeriod,
    ) -> Result<Option<MeasurementEntry>, JobError> {
        let monthly = Period::Monthly {
            year: period.year,
            month: period.month,
        };
        let (from, to) = monthly.bounds(self.timezone);

        let stream = self
            .entries
            .stream_entries(key)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;
        let month_entries: Vec<&MeasurementEntry> = stream
            .iter()
            .filter(|e| !e.is_summary && e.timestamp >= from && e.timestamp < to)
            .collect();
        if month_entries.is_empty() {
            return Ok(None);
        }

        // Month totals per payload field
        let mut totals: HashMap<String, f64> = HashMap::new();
        let mut gases = GasVector::default();
        let mut any_processed = false;
        for entry in &month_entries {
            for (field, value) in &entry.data_values {
                *totals.entry(field.clone()).or_insert(0.0) += value;
            }
            if entry.processing_status == ProcessingStatus::Processed {
                if let Some(calc) = &entry.calculated_emissions {
                    gases = gases.add(&calc.incoming);
                    any_processed = true;
                }
            }
        }

        let last = month_entries
            .last()
            .map(|e| e.timestamp)
            .unwrap_or_else(Utc::now);
        let template = month_entries[month_entries.len() - 1];

        let summary = MeasurementEntry {
            entry_id: Uuid::new_v4(),
            client_id: key.client_id.clone(),
            node_id: key.node_id.clone(),
            scope_identifier: key.scope_identifier.clone(),
            scope_type: template.scope_type,
            input_type: template.input_type,
            date: last.with_timezone(&self.timezone).date_naive(),
            time: last.with_timezone(&self.timezone).time(),
            timestamp: last,
            data_values: totals,
            emission_factor: template.emission_factor,
            source_details: Some("monthly-aggregation".to_string()),
            is_editable: false,
            processing_status: if any_processed {
                ProcessingStatus::Processed
            } else {
                ProcessingStatus::Pending
            },
            failure_reason: None,
            calculated_emissions: any_processed.then(|| CalculatedEmissions {
                incoming: gases,
                cumulative: gases,
                total_ghg_emission: Some(gases.co2e),
                factor_citation: None,
                calculated_at: Utc::now(),
            }),
            cumulative_values: HashMap::new(),
            high_data: HashMap::new(),
            low_data: HashMap::new(),
            last_entered_data: HashMap::new(),
            is_summary: true,
            summary_period: Some(period),
        };

        self.entries
            .archive_month(key, from, to, summary.clone())
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        // Rebuild running aggregates over the compacted stream
        let mut compacted = self
            .entries
            .stream_entries(key)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;
        resequence(&mut compacted);
        self.entries
            .replace_stream(key, compacted)
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        tracing::info!(
            stream = %key,
            month = period.month,
            year = period.year,
            raw_entries = month_entries.len(),
            "Month archived into summary row"
        );
        Ok(Some(summary))
    }
}

#[async_trait]
impl Job for MonthlyAggregationJob {
    fn name(&self) -> &'static str {
        "monthly-aggregation"
    }

    async fn run(&self) -> Result<JobReport, JobError> {
        let clients = self
            .clients
            .active_clients()
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        let mut archived_total = 0;
        for client in clients {
            let chart = self
                .registry
                .get_flowchart(&client.client_id, ChartKind::Organisation)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?;
            let Some(chart) = chart else { continue };

            let mut touched: Vec<DateTime<Utc>> = Vec::new();
            for node in &chart.nodes {
                for scope in &node.scopes {
                    if scope.input_type != InputType::Manual {
                        continue;
                    }
                    let key = StreamKey::new(
                        client.client_id.clone(),
                        node.node_id.clone(),
                        scope.scope_identifier.clone(),
                    );
                    let archived = self.archive_stream(&key).await?;
                    archived_total += archived.len();
                    for period in archived {
                        if let Some(mid) = mid_month(period, self.timezone) {
                            touched.push(mid);
                        }
                    }
                }
            }

            // Change propagation: recompute the summaries the evictions hit
            for timestamp in touched {
                self.materialiser
                    .on_entry_changed(&client.client_id, timestamp)
                    .await
                    .map_err(|e| JobError::Failed(e.to_string()))?;
            }
        }

        Ok(JobReport {
            items_processed: archived_total,
        })
    }
}

fn mid_month(period: SummaryPeriod, tz: Tz) -> Option<DateTime<Utc>> {
    tz.with_ymd_and_hms(period.year, period.month, 15, 12, 0, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
