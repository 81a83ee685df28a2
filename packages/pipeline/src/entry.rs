//! Measurement entries and their per-stream running aggregates.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use carbonplane_factors::{FactorSource, GasVector, ScopeType};
use carbonplane_registry::{ClientId, InputType, NodeId};

/// Identity of a measurement stream. Ingestion is serialised per stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub client_id: ClientId,
    pub node_id: NodeId,
    pub scope_identifier: String,
}

impl StreamKey {
    pub fn new(
        client_id: impl Into<ClientId>,
        node_id: impl Into<NodeId>,
        scope_identifier: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            node_id: node_id.into(),
            scope_identifier: scope_identifier.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.client_id, self.node_id, self.scope_identifier)
    }
}

/// Lifecycle of an entry through the calculation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Failed,
}

/// Month/year tag of a monthly summary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryPeriod {
    pub month: u32,
    pub year: i32,
}

/// Calculated per-gas results attached after processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatedEmissions {
    /// This entry's own contribution
    pub incoming: GasVector,
    /// Running per-gas total for the stream at this entry
    pub cumulative: GasVector,
    /// Preferred extraction value for summarisation (kg CO2e)
    pub total_ghg_emission: Option<f64>,
    /// Citation of the factor the result was computed with
    pub factor_citation: Option<String>,
    pub calculated_at: DateTime<Utc>,
}

/// An immutable measurement record.
///
/// Running aggregates (`cumulative_values`, `high_data`, `low_data`,
/// `last_entered_data`) are maintained under the stream's critical section
/// and always reflect timestamp order, even when entries arrive out of
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementEntry {
    pub entry_id: Uuid,
    pub client_id: ClientId,
    pub node_id: NodeId,
    pub scope_identifier: String,
    pub scope_type: ScopeType,
    pub input_type: InputType,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub timestamp: DateTime<Utc>,
    /// Canonical numeric payload for the scope's activity
    pub data_values: HashMap<String, f64>,
    pub emission_factor: FactorSource,
    pub source_details: Option<String>,
    /// Manual entries stay editable; API/IoT entries are sealed
    pub is_editable: bool,
    pub processing_status: ProcessingStatus,
    pub failure_reason: Option<String>,
    pub calculated_emissions: Option<CalculatedEmissions>,
    pub cumulative_values: HashMap<String, f64>,
    pub high_data: HashMap<String, f64>,
    pub low_data: HashMap<String, f64>,
    pub last_entered_data: HashMap<String, f64>,
    /// Monthly summary rows replace their raw entries
    pub is_summary: bool,
    pub summary_period: Option<SummaryPeriod>,
}

impl MeasurementEntry {
    pub fn key(&self) -> StreamKey {
        StreamKey {
            client_id: self.client_id.clone(),
            node_id: self.node_id.clone(),
            scope_identifier: self.scope_identifier.clone(),
        }
    }

    /// The CO2e mass summarisation should count for this entry.
    ///
    /// Preference order: `total_ghg_emission`, then the incoming vector,
    /// then the cumulative vector. Unprocessed entries contribute zero.
    pub fn extract_co2e(&self) -> f64 {
        let Some(calc) = &self.calculated_emissions else {
            return 0.0;
        };
        if let Some(total) = calc.total_ghg_emission {
            return total;
        }
        if !calc.incoming.is_zero() {
            return calc.incoming.co2e;
        }
        calc.cumulative.co2e
    }

    /// The per-gas vector summarisation should fold for this entry.
    pub fn extract_gases(&self) -> GasVector {
        let Some(calc) = &self.calculated_emissions else {
            return GasVector::default();
        };
        if !calc.incoming.is_zero() {
            return calc.incoming;
        }
        calc.cumulative
    }
}

/// Recompute the running aggregates of a stream in place.
///
/// `entries` must belong to one stream; they are sorted by timestamp and
/// each entry's aggregates are rebuilt as the prefix over its
/// predecessors. Cumulative calculated emissions are rebuilt the same way
/// over processed entries, so an out-of-order arrival repairs every
/// downstream entry. Monthly summary rows seed the aggregates but are not
/// re-derived.
pub fn resequence(entries: &mut [MeasurementEntry]) {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.entry_id.cmp(&b.entry_id)));

    let mut cumulative: HashMap<String, f64> = HashMap::new();
    let mut high: HashMap<String, f64> = HashMap::new();
    let mut low: HashMap<String, f64> = HashMap::new();
    let mut gas_cumulative = GasVector::default();

    for entry in entries.iter_mut() {
        for (field, &value) in &entry.data_values {
            let total = cumulative.entry(field.clone()).or_insert(0.0);
            *total += value;
            high.entry(field.clone())
                .and_modify(|h| *h = h.max(value))
                .or_insert(value);
            low.entry(field.clone())
                .and_modify(|l| *l = l.min(value))
                .or_insert(value);
        }

        entry.cumulative_values = cumulative.clone();
        entry.high_data = high.clone();
        entry.low_data = low.clone();
        entry.last_entered_data = entry.data_values.clone();

        if entry.processing_status == ProcessingStatus::Processed {
            if let Some(calc) = entry.calculated_emissions.as_mut() {
                gas_cumulative = gas_cumulative.add(&calc.incoming);
                calc.cumulative = gas_cumulative;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn entry_at(ts: DateTime<Utc>, value: f64) -> MeasurementEntry {
        MeasurementEntry {
            entry_id: Uuid::new_v4(),
            client_id: "acme".to_string(),
            node_id: "n1".to_string(),
            scope_identifier: "DIESEL_GEN".to_string(),
            scope_type: ScopeType::Scope1,
            input_type: InputType::Manual,
            date: ts.date_naive(),
            time: ts.time(),
            timestamp: ts,
            data_values: HashMap::from([("fuelConsumption".to_string(), value)]),
            emission_factor: FactorSource::Defra,
            source_details: None,
            is_editable: true,
            processing_status: ProcessingStatus::Pending,
            failure_reason: None,
            calculated_emissions: None,
            cumulative_values: HashMap::new(),
            high_data: HashMap::new(),
            low_data: HashMap::new(),
            last_entered_data: HashMap::new(),
            is_summary: false,
            summary_period: None,
        }
    }

    #[test]
    fn test_resequence_prefix_sum() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
        // Arrives out of order: t2 first
        let mut entries = vec![entry_at(t2, 50.0), entry_at(t1, 100.0)];

        resequence(&mut entries);

        assert_eq!(entries[0].timestamp, t1);
        assert_eq!(entries[0].cumulative_values["fuelConsumption"], 100.0);
        assert_eq!(entries[1].cumulative_values["fuelConsumption"], 150.0);
        assert_eq!(entries[1].last_entered_data["fuelConsumption"], 50.0);
        assert_eq!(entries[1].high_data["fuelConsumption"], 100.0);
        assert_eq!(entries[1].low_data["fuelConsumption"], 50.0);
    }

    #[test]
    fn test_single_entry_high_low_last_equal() {
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut entries = vec![entry_at(t1, 42.0)];
        resequence(&mut entries);

        let e = &entries[0];
        assert_eq!(e.cumulative_values["fuelConsumption"], 42.0);
        assert_eq!(e.high_data["fuelConsumption"], 42.0);
        assert_eq!(e.low_data["fuelConsumption"], 42.0);
        assert_eq!(e.last_entered_data["fuelConsumption"], 42.0);
    }

    #[test]
    fn test_resequence_rebuilds_gas_cumulative() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();

        let mut early = entry_at(t1, 100.0);
        early.processing_status = ProcessingStatus::Processed;
        early.calculated_emissions = Some(CalculatedEmissions {
            incoming: GasVector::co2e_only(268.0),
            cumulative: GasVector::default(),
            total_ghg_emission: Some(268.0),
            factor_citation: None,
            calculated_at: t1,
        });
        let mut late = entry_at(t2, 50.0);
        late.processing_status = ProcessingStatus::Processed;
        late.calculated_emissions = Some(CalculatedEmissions {
            incoming: GasVector::co2e_only(134.0),
            cumulative: GasVector::default(),
            total_ghg_emission: Some(134.0),
            factor_citation: None,
            calculated_at: t2,
        });

        let mut entries = vec![late, early];
        resequence(&mut entries);

        let cum0 = entries[0].calculated_emissions.as_ref().unwrap().cumulative;
        let cum1 = entries[1].calculated_emissions.as_ref().unwrap().cumulative;
        assert!((cum0.co2e - 268.0).abs() < 1e-9);
        assert!((cum1.co2e - 402.0).abs() < 1e-9);
    }

    #[test]
    fn test_extract_preference_order() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut e = entry_at(t, 1.0);
        assert_eq!(e.extract_co2e(), 0.0);

        e.calculated_emissions = Some(CalculatedEmissions {
            incoming: GasVector::co2e_only(5.0),
            cumulative: GasVector::co2e_only(12.0),
            total_ghg_emission: None,
            factor_citation: None,
            calculated_at: t,
        });
        assert_eq!(e.extract_co2e(), 5.0);

        e.calculated_emissions.as_mut().unwrap().total_ghg_emission = Some(4.5);
        assert_eq!(e.extract_co2e(), 4.5);

        e.calculated_emissions.as_mut().unwrap().total_ghg_emission = None;
        e.calculated_emissions.as_mut().unwrap().incoming = GasVector::default();
        assert_eq!(e.extract_co2e(), 12.0);
    }
}
