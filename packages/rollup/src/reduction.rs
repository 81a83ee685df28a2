//! Offset/reduction ledger: an append-only stream per
//! `(client, project, methodology)` with the same running-aggregate
//! discipline as measurement streams.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use carbonplane_bus::{ChangeEvent, EventBus, EventKind};
use carbonplane_factors::ScopeType;
use carbonplane_registry::StoreError;

use crate::store::ReductionStore;

/// Calculation methodology of a reduction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Methodology {
    M1,
    M2,
    M3,
}

impl Methodology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
        }
    }
}

/// Whether a project reduces emissions or removes carbon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    Reduction,
    Removal,
}

/// Itemised methodology-3 breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct M3Breakdown {
    pub baseline: Vec<f64>,
    pub project: Vec<f64>,
    pub leakage: Vec<f64>,
    pub be_total: f64,
    pub pe_total: f64,
    pub le_total: f64,
    pub buffer_percent: f64,
    pub net_with_uncertainty: f64,
}

/// An offset/removal project reduction entries attach to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionProject {
    pub project_id: String,
    pub name: String,
    pub category: String,
    pub scope_type: Option<ScopeType>,
    pub location: Option<String>,
    pub activity: Option<String>,
    pub mechanism: Mechanism,
    /// Annual decarbonisation target in kg CO2e, drives achievement
    pub annual_target: Option<f64>,
}

impl ReductionProject {
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            category: category.into(),
            scope_type: None,
            location: None,
            activity: None,
            mechanism: Mechanism::Reduction,
            annual_target: None,
        }
    }

    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.annual_target = Some(target);
        self
    }
}

/// One appended reduction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReductionEntry {
    pub entry_id: Uuid,
    pub client_id: String,
    pub project_id: String,
    pub methodology: Methodology,
    pub input_value: f64,
    pub emission_reduction_rate: f64,
    pub net_reduction: f64,
    pub cumulative_net_reduction: f64,
    pub high_net_reduction: f64,
    pub low_net_reduction: f64,
    pub breakdown: Option<M3Breakdown>,
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
}

/// Methodology-specific input.
#[derive(Debug, Clone)]
pub enum ReductionInput {
    /// `net = input x rate`
    M1 {
        input_value: f64,
        emission_reduction_rate: f64,
    },
    /// Caller supplies the methodology-2 result
    M2 { net_reduction: f64 },
    /// Caller supplies the result plus the itemised breakdown
    M3 {
        net_reduction: f64,
        breakdown: M3Breakdown,
    },
}

impl ReductionInput {
    fn methodology(&self) -> Methodology {
        match self {
            Self::M1 { .. } => Methodology::M1,
            Self::M2 { .. } => Methodology::M2,
            Self::M3 { .. } => Methodology::M3,
        }
    }
}

/// Reduction ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum ReductionError {
    #[error("project {project_id} is not registered for client {client_id}")]
    UnknownProject {
        client_id: String,
        project_id: String,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// The reduction ledger.
pub struct ReductionLedger {
    store: Arc<dyn ReductionStore>,
    bus: Arc<dyn EventBus>,
    locks: Mutex<HashMap<(String, String, Methodology), Arc<tokio::sync::Mutex<()>>>>,
}

impl ReductionLedger {
    pub fn new(store: Arc<dyn ReductionStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn ReductionStore> {
        Arc::clone(&self.store)
    }

    /// Register (or replace) a project definition.
    pub async fn register_project(
        &self,
        client_id: &str,
        project: ReductionProject,
    ) -> Result<(), ReductionError> {
        self.store.upsert_project(client_id, project).await?;
        Ok(())
    }

    /// Append a reduction entry under the stream's critical section.
    pub async fn append(
        &self,
        client_id: &str,
        project_id: &str,
        input: ReductionInput,
        timestamp: Option<DateTime<Utc>>,
        source: Option<String>,
    ) -> Result<ReductionEntry, ReductionError> {
        let projects = self.store.projects(client_id).await?;
        if !projects.iter().any(|p| p.project_id == project_id) {
            return Err(ReductionError::UnknownProject {
                client_id: client_id.to_string(),
                project_id: project_id.to_string(),
            });
        }

        let methodology = input.methodology();
        let (input_value, rate, net, breakdown) = match input {
            ReductionInput::M1 {
                input_value,
                emission_reduction_rate,
            } => (
                input_value,
                emission_reduction_rate,
                input_value * emission_reduction_rate,
                None,
            ),
            ReductionInput::M2 { net_reduction } => (0.0, 0.0, net_reduction, None),
            ReductionInput::M3 {
                net_reduction,
                breakdown,
            } => (0.0, 0.0, net_reduction, Some(breakdown)),
        };

        let key = (
            client_id.to_string(),
            project_id.to_string(),
            methodology,
        );
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key).or_default())
        };
        let _guard = lock.lock().await;

        let entry = ReductionEntry {
            entry_id: Uuid::new_v4(),
            client_id: client_id.to_string(),
            project_id: project_id.to_string(),
            methodology,
            input_value,
            emission_reduction_rate: rate,
            net_reduction: net,
            cumulative_net_reduction: 0.0,
            high_net_reduction: 0.0,
            low_net_reduction: 0.0,
            breakdown,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            source,
        };
        let entry_id = entry.entry_id;

        let mut stream = self
            .store
            .stream(client_id, project_id, methodology)
            .await?;
        stream.push(entry);
        resequence_reductions(&mut stream);
        self.store
            .replace_stream(client_id, project_id, methodology, stream.clone())
            .await?;

        let saved = stream
            .into_iter()
            .find(|e| e.entry_id == entry_id)
            .ok_or_else(|| StoreError::Corruption("appended reduction entry vanished".into()))?;

        let event = ChangeEvent::new(
            client_id,
            EventKind::ReductionEntrySaved,
            serde_json::json!({
                "projectId": project_id,
                "methodology": methodology.as_str(),
                "netReduction": saved.net_reduction,
            }),
        );
        self.bus.publish(&event.topic(), event).await;

        tracing::info!(
            client_id = %client_id,
            project_id = %project_id,
            methodology = %methodology.as_str(),
            net = saved.net_reduction,
            "Reduction entry saved"
        );
        Ok(saved)
    }
}

/// Rebuild cumulative/high/low over timestamp order.
fn resequence_reductions(entries: &mut [ReductionEntry]) {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.entry_id.cmp(&b.entry_id)));
    let mut cumulative = 0.0;
    let mut high = f64::NEG_INFINITY;
    let mut low = f64::INFINITY;
    for entry in entries.iter_mut() {
        cumulative += entry.net_reduction;
        high = high.max(entry.net_reduction);
        low = low.min(entry.net_reduction);
        entry.cumulative_net_reduction = cumulative;
        entry.high_net_reduction = high;
        entry.low_net_reduction = low;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryReductionStore;
    use carbonplane_bus::BroadcastBus;
    use chrono::TimeZone;

    async fn ledger() -> ReductionLedger {
        let ledger = ReductionLedger::new(
            Arc::new(InMemoryReductionStore::new()),
            Arc::new(BroadcastBus::new()),
        );
        ledger
            .register_project("acme", ReductionProject::new("solar-1", "Rooftop solar", "renewables"))
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_m1_computes_net() {
        let ledger = ledger().await;
        let entry = ledger
            .append(
                "acme",
                "solar-1",
                ReductionInput::M1 {
                    input_value: 1000.0,
                    emission_reduction_rate: 0.82,
                },
                None,
                None,
            )
            .await
            .unwrap();

        assert!((entry.net_reduction - 820.0).abs() < 1e-9);
        assert!((entry.cumulative_net_reduction - 820.0).abs() < 1e-9);
        assert_eq!(entry.high_net_reduction, entry.low_net_reduction);
    }

    #[tokio::test]
    async fn test_running_aggregates_across_appends() {
        let ledger = ledger().await;
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        ledger
            .append("acme", "solar-1", ReductionInput::M2 { net_reduction: 500.0 }, Some(t1), None)
            .await
            .unwrap();
        let second = ledger
            .append("acme", "solar-1", ReductionInput::M2 { net_reduction: 200.0 }, Some(t2), None)
            .await
            .unwrap();

        assert!((second.cumulative_net_reduction - 700.0).abs() < 1e-9);
        assert_eq!(second.high_net_reduction, 500.0);
        assert_eq!(second.low_net_reduction, 200.0);
    }

    #[tokio::test]
    async fn test_out_of_order_append_resequences() {
        let ledger = ledger().await;
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        ledger
            .append("acme", "solar-1", ReductionInput::M2 { net_reduction: 200.0 }, Some(t2), None)
            .await
            .unwrap();
        ledger
            .append("acme", "solar-1", ReductionInput::M2 { net_reduction: 500.0 }, Some(t1), None)
            .await
            .unwrap();

        let stream = ledger
            .store
            .stream("acme", "solar-1", Methodology::M2)
            .await
            .unwrap();
        assert!((stream[0].cumulative_net_reduction - 500.0).abs() < 1e-9);
        assert!((stream[1].cumulative_net_reduction - 700.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_project_rejected() {
        let ledger = ledger().await;
        let err = ledger
            .append("acme", "ghost", ReductionInput::M2 { net_reduction: 1.0 }, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReductionError::UnknownProject { .. }));
    }

    #[tokio::test]
    async fn test_m3_carries_breakdown() {
        let ledger = ledger().await;
        let entry = ledger
            .append(
                "acme",
                "solar-1",
                ReductionInput::M3 {
                    net_reduction: 300.0,
                    breakdown: M3Breakdown {
                        baseline: vec![400.0],
                        project: vec![80.0],
                        leakage: vec![20.0],
                        be_total: 400.0,
                        pe_total: 80.0,
                        le_total: 20.0,
                        buffer_percent: 5.0,
                        net_with_uncertainty: 285.0,
                    },
                },
                None,
                None,
            )
            .await
            .unwrap();

        let breakdown = entry.breakdown.unwrap();
        assert_eq!(breakdown.be_total, 400.0);
        assert_eq!(breakdown.buffer_percent, 5.0);
    }
}
