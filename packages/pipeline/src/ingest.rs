//! Ingestion pipeline: validate, normalise, deduplicate, persist.
//!
//! All writes to one `(client, node, scope)` stream pass through that
//! stream's async mutex, which is what keeps the cumulative/high/low/last
//! running aggregates a true prefix over timestamp order even when entries
//! arrive out of order or concurrently across sources.

use chrono::Utc;
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use carbonplane_bus::{ChangeEvent, EventBus, EventKind};
use carbonplane_factors::{FactorCatalogue, FactorError};
use carbonplane_registry::{
    ChartKind, FlowchartRegistry, InputType, RegistryError, ScopeDescriptor, StoreError,
};

use crate::csvio::{parse_csv, CsvError};
use crate::entry::{resequence, MeasurementEntry, ProcessingStatus, StreamKey};
use crate::normalize::{normalize_payload, ActivityKind};
use crate::store::EntryStore;
use crate::timeparse::{parse_entry_timestamp, TimeParseError};

/// A single not-yet-normalised measurement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEntry {
    pub date: Option<String>,
    pub time: Option<String>,
    pub values: HashMap<String, f64>,
    pub source_details: Option<String>,
}

impl RawEntry {
    /// Decode an API/IoT payload: a JSON object (or array of objects)
    /// with optional `date`/`time` strings and numeric fields. Numeric
    /// strings are accepted; anything else is dropped here and again by
    /// payload normalisation.
    pub fn from_json(payload: &serde_json::Value) -> Result<Vec<RawEntry>, IngestError> {
        let objects: Vec<&serde_json::Map<String, serde_json::Value>> = match payload {
            serde_json::Value::Object(map) => vec![map],
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_object().ok_or_else(|| IngestError::BadPayload {
                        reason: "array items must be objects".to_string(),
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(IngestError::BadPayload {
                    reason: "payload must be a JSON object or array".to_string(),
                })
            }
        };

        let mut entries = Vec::with_capacity(objects.len());
        for map in objects {
            // A nested "data" object carries the fields when present
            let fields = map
                .get("data")
                .and_then(|d| d.as_object())
                .unwrap_or(map);

            let mut raw = RawEntry {
                date: map.get("date").and_then(|v| v.as_str()).map(str::to_string),
                time: map.get("time").and_then(|v| v.as_str()).map(str::to_string),
                source_details: map
                    .get("source")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                ..RawEntry::default()
            };

            for (key, value) in fields {
                if matches!(key.as_str(), "date" | "time" | "source") {
                    continue;
                }
                let number = match value {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => s.parse::<f64>().ok(),
                    _ => None,
                };
                if let Some(n) = number {
                    raw.values.insert(key.clone(), n);
                }
            }
            entries.push(raw);
        }
        Ok(entries)
    }
}

/// The variants `ingest` accepts.
#[derive(Debug, Clone)]
pub enum IngestInput {
    Manual(RawEntry),
    ManualBatch(Vec<RawEntry>),
    CsvUpload(Vec<u8>),
    ApiPoll(serde_json::Value),
    IotPush(serde_json::Value),
}

impl IngestInput {
    /// Input type the target scope must be configured with.
    pub fn expected_input_type(&self) -> InputType {
        match self {
            Self::Manual(_) | Self::ManualBatch(_) | Self::CsvUpload(_) => InputType::Manual,
            Self::ApiPoll(_) => InputType::Api,
            Self::IotPush(_) => InputType::Iot,
        }
    }

    fn event_kind(&self) -> EventKind {
        match self {
            Self::Manual(_) | Self::ManualBatch(_) => EventKind::ManualDataSaved,
            Self::CsvUpload(_) => EventKind::CsvDataUploaded,
            Self::ApiPoll(_) => EventKind::ApiDataSaved,
            Self::IotPush(_) => EventKind::IotDataSaved,
        }
    }
}

/// Per-row rejection inside a partially successful batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFailure {
    /// 1-indexed row within the submitted batch
    pub row: usize,
    pub reason: String,
}

/// Outcome of an ingest call (207-equivalent for batches).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<RowFailure>,
}

impl IngestReport {
    /// Some rows saved, some rejected.
    pub fn is_partial(&self) -> bool {
        !self.accepted.is_empty() && !self.rejected.is_empty()
    }
}

/// Ingestion errors. Per-row problems inside a batch are reported through
/// `IngestReport::rejected` instead; these errors fail the whole request.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("client {client_id} has no active organisation flowchart")]
    NoActiveFlowchart { client_id: String },

    #[error("scope {scope_identifier} not found on node {node_id}")]
    UnknownScope {
        node_id: String,
        scope_identifier: String,
    },

    #[error("scope {scope_identifier} is configured as {expected}, got {got} input")]
    InputTypeMismatch {
        scope_identifier: String,
        expected: InputType,
        got: InputType,
    },

    #[error(transparent)]
    Factor(#[from] FactorError),

    #[error("no calculator for {category}/{activity}")]
    UnsupportedActivity { category: String, activity: String },

    #[error(transparent)]
    Csv(#[from] CsvError),

    #[error("bad payload: {reason}")]
    BadPayload { reason: String },

    #[error("entry {entry_id} is not editable")]
    NotEditable { entry_id: Uuid },

    #[error("entry {entry_id} not found")]
    UnknownEntry { entry_id: Uuid },

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(String),
}

impl From<RegistryError> for IngestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Storage(e) => IngestError::Storage(e),
            other => IngestError::Registry(other.to_string()),
        }
    }
}

/// Lazily created per-stream async mutexes. Shared between the ingestor,
/// the calculation worker, and the archival job so every mutation of a
/// stream is serialised.
#[derive(Clone, Default)]
pub struct StreamLocks {
    inner: Arc<Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl StreamLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_stream(&self, key: &StreamKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

/// The ingestion pipeline.
pub struct Ingestor {
    registry: Arc<FlowchartRegistry>,
    catalogue: Arc<FactorCatalogue>,
    store: Arc<dyn EntryStore>,
    bus: Arc<dyn EventBus>,
    locks: StreamLocks,
    timezone: Tz,
    calc_tx: mpsc::UnboundedSender<StreamKey>,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FlowchartRegistry>,
        catalogue: Arc<FactorCatalogue>,
        store: Arc<dyn EntryStore>,
        bus: Arc<dyn EventBus>,
        locks: StreamLocks,
        timezone: Tz,
        calc_tx: mpsc::UnboundedSender<StreamKey>,
    ) -> Self {
        Self {
            registry,
            catalogue,
            store,
            bus,
            locks,
            timezone,
            calc_tx,
        }
    }

    pub fn locks(&self) -> StreamLocks {
        self.locks.clone()
    }

    /// Ingest one input against a stream.
    pub async fn ingest(
        &self,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
        input: IngestInput,
    ) -> Result<IngestReport, IngestError> {
        // 1. Prerequisites: scope exists, input type matches, factor resolves
        let scope = self.resolve_scope(client_id, node_id, scope_identifier).await?;

        let expected = scope.input_type;
        let got = input.expected_input_type();
        if expected != got {
            return Err(IngestError::InputTypeMismatch {
                scope_identifier: scope.scope_identifier.clone(),
                expected,
                got,
            });
        }

        self.catalogue.resolve(&scope.factor_query(), Utc::now())?;

        let kind = ActivityKind::resolve(
            scope.scope_type,
            &scope.category_name,
            &scope.activity,
            scope.calculation_model,
        )
        .ok_or_else(|| IngestError::UnsupportedActivity {
            category: scope.category_name.clone(),
            activity: scope.activity.clone(),
        })?;

        // 2. Expand the input into raw rows
        let event_kind = input.event_kind();
        let mut report = IngestReport::default();
        let raws = self.expand_input(input, &mut report)?;

        // 3. Normalise and timestamp each row
        let mut candidates = Vec::with_capacity(raws.len());
        for (row, raw) in raws {
            match parse_entry_timestamp(
                raw.date.as_deref(),
                raw.time.as_deref(),
                self.timezone,
                Utc::now(),
            ) {
                Ok((date, time, timestamp)) => {
                    let values = normalize_payload(kind, &raw.values);
                    candidates.push((row, raw, date, time, timestamp, values));
                }
                Err(e @ TimeParseError::BadDate { .. })
                | Err(e @ TimeParseError::BadTime { .. })
                | Err(e @ TimeParseError::NonexistentLocalTime { .. }) => {
                    report.rejected.push(RowFailure {
                        row,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Duplicate (date, time) tuples within the batch reject as a group
        let mut tuple_counts: HashMap<(chrono::NaiveDate, chrono::NaiveTime), usize> =
            HashMap::new();
        for (_, _, date, time, _, _) in &candidates {
            *tuple_counts.entry((*date, *time)).or_insert(0) += 1;
        }
        let (candidates, duplicates): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(_, _, date, time, _, _)| tuple_counts[&(*date, *time)] == 1);
        for (row, _, date, time, _, _) in duplicates {
            report.rejected.push(RowFailure {
                row,
                reason: format!("duplicate (date, time) tuple {} {} in batch", date, time),
            });
        }

        // CSV batches process in ascending timestamp order
        let mut candidates = candidates;
        candidates.sort_by_key(|(_, _, _, _, timestamp, _)| *timestamp);

        // 4. Persist under the stream's critical section
        let key = StreamKey::new(client_id, node_id, &scope.scope_identifier);
        let lock = self.locks.for_stream(&key);
        let _guard = lock.lock().await;

        let mut stream = self.store.stream_entries(&key).await?;
        let mut existing: HashSet<(chrono::NaiveDate, chrono::NaiveTime)> = stream
            .iter()
            .filter(|e| !e.is_summary)
            .map(|e| (e.date, e.time))
            .collect();

        for (row, raw, date, time, timestamp, values) in candidates {
            if !existing.insert((date, time)) {
                report.rejected.push(RowFailure {
                    row,
                    reason: format!("entry at {} {} already exists in stream", date, time),
                });
                continue;
            }

            let entry = MeasurementEntry {
                entry_id: Uuid::new_v4(),
                client_id: client_id.to_string(),
                node_id: node_id.to_string(),
                scope_identifier: scope.scope_identifier.clone(),
                scope_type: scope.scope_type,
                input_type: scope.input_type,
                date,
                time,
                timestamp,
                data_values: values,
                emission_factor: scope.emission_factor,
                source_details: raw.source_details,
                is_editable: scope.input_type == InputType::Manual,
                processing_status: ProcessingStatus::Pending,
                failure_reason: None,
                calculated_emissions: None,
                cumulative_values: HashMap::new(),
                high_data: HashMap::new(),
                low_data: HashMap::new(),
                last_entered_data: HashMap::new(),
                is_summary: false,
                summary_period: None,
            };
            report.accepted.push(entry.entry_id);
            stream.push(entry);
        }

        if !report.accepted.is_empty() {
            resequence(&mut stream);
            self.store.replace_stream(&key, stream).await?;

            // 5. Enqueue for the calculation engine
            let _ = self.calc_tx.send(key.clone());

            // 6. Typed event on the bus
            let event = ChangeEvent::new(
                client_id,
                event_kind,
                serde_json::json!({
                    "nodeId": key.node_id,
                    "scopeIdentifier": key.scope_identifier,
                    "accepted": report.accepted.len(),
                    "rejected": report.rejected.len(),
                }),
            );
            self.bus.publish(&event.topic(), event).await;
        }

        tracing::info!(
            stream = %key,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "Ingest complete"
        );
        Ok(report)
    }

    /// Edit a manual entry in place. The entry reverts to pending and its
    /// stream resequences.
    pub async fn edit_manual(
        &self,
        entry_id: Uuid,
        values: HashMap<String, f64>,
    ) -> Result<(), IngestError> {
        let entry = self
            .store
            .get(entry_id)
            .await?
            .ok_or(IngestError::UnknownEntry { entry_id })?;
        if !entry.is_editable || entry.input_type != InputType::Manual || entry.is_summary {
            return Err(IngestError::NotEditable { entry_id });
        }

        let scope = self
            .resolve_scope(&entry.client_id, &entry.node_id, &entry.scope_identifier)
            .await?;
        let kind = ActivityKind::resolve(
            scope.scope_type,
            &scope.category_name,
            &scope.activity,
            scope.calculation_model,
        )
        .ok_or_else(|| IngestError::UnsupportedActivity {
            category: scope.category_name.clone(),
            activity: scope.activity.clone(),
        })?;

        let key = entry.key();
        let lock = self.locks.for_stream(&key);
        let _guard = lock.lock().await;

        let mut stream = self.store.stream_entries(&key).await?;
        let slot = stream
            .iter_mut()
            .find(|e| e.entry_id == entry_id)
            .ok_or(IngestError::UnknownEntry { entry_id })?;
        slot.data_values = normalize_payload(kind, &values);
        slot.processing_status = ProcessingStatus::Pending;
        slot.failure_reason = None;
        slot.calculated_emissions = None;

        resequence(&mut stream);
        self.store.replace_stream(&key, stream).await?;
        let _ = self.calc_tx.send(key.clone());

        let event = ChangeEvent::new(
            key.client_id.clone(),
            EventKind::ManualDataEdited,
            serde_json::json!({ "entryId": entry_id, "scopeIdentifier": key.scope_identifier }),
        );
        self.bus.publish(&event.topic(), event).await;
        Ok(())
    }

    /// Delete a manual entry and resequence its stream.
    pub async fn delete_manual(&self, entry_id: Uuid) -> Result<(), IngestError> {
        let entry = self
            .store
            .get(entry_id)
            .await?
            .ok_or(IngestError::UnknownEntry { entry_id })?;
        if !entry.is_editable || entry.input_type != InputType::Manual || entry.is_summary {
            return Err(IngestError::NotEditable { entry_id });
        }

        let key = entry.key();
        let lock = self.locks.for_stream(&key);
        let _guard = lock.lock().await;

        let mut stream = self.store.stream_entries(&key).await?;
        stream.retain(|e| e.entry_id != entry_id);
        resequence(&mut stream);
        self.store.replace_stream(&key, stream).await?;

        let event = ChangeEvent::new(
            key.client_id.clone(),
            EventKind::ManualDataDeleted,
            serde_json::json!({ "entryId": entry_id, "scopeIdentifier": key.scope_identifier }),
        );
        self.bus.publish(&event.topic(), event).await;
        Ok(())
    }

    /// Resolve a stream's scope descriptor through the active organisation
    /// chart, following rename aliases.
    pub(crate) async fn resolve_scope(
        &self,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
    ) -> Result<ScopeDescriptor, IngestError> {
        let chart = self
            .registry
            .get_flowchart(client_id, ChartKind::Organisation)
            .await?
            .ok_or_else(|| IngestError::NoActiveFlowchart {
                client_id: client_id.to_string(),
            })?;

        let metadata = self.registry.metadata_for(client_id).await?;
        let current = metadata
            .lookup(scope_identifier)
            .map(|meta| meta.scope_identifier.clone())
            .unwrap_or_else(|| scope_identifier.to_string());

        chart
            .node(node_id)
            .and_then(|node| {
                node.scopes
                    .iter()
                    .find(|s| s.scope_identifier == current)
                    .cloned()
            })
            .ok_or_else(|| IngestError::UnknownScope {
                node_id: node_id.to_string(),
                scope_identifier: scope_identifier.to_string(),
            })
    }

    fn expand_input(
        &self,
        input: IngestInput,
        report: &mut IngestReport,
    ) -> Result<Vec<(usize, RawEntry)>, IngestError> {
        let raws = match input {
            IngestInput::Manual(raw) => vec![raw],
            IngestInput::ManualBatch(raws) => raws,
            IngestInput::CsvUpload(bytes) => {
                let parsed = parse_csv(&bytes)?;
                for (row, reason) in parsed.failures {
                    report.rejected.push(RowFailure { row, reason });
                }
                return Ok(parsed
                    .rows
                    .into_iter()
                    .map(|r| {
                        (
                            r.row,
                            RawEntry {
                                date: r.date,
                                time: r.time,
                                values: r.values,
                                source_details: None,
                            },
                        )
                    })
                    .collect());
            }
            IngestInput::ApiPoll(payload) | IngestInput::IotPush(payload) => {
                RawEntry::from_json(&payload)?
            }
        };
        Ok(raws.into_iter().enumerate().map(|(i, r)| (i + 1, r)).collect())
    }
}
