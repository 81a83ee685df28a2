//! Storage collaborator contract for measurement entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use carbonplane_registry::StoreError;

use crate::entry::{MeasurementEntry, StreamKey, SummaryPeriod};

/// Measurement persistence contract.
///
/// Backed by a document store with compound indexes on
/// `(client, node, scope, timestamp)`; the in-memory implementation keeps
/// streams timestamp-sorted to the same effect.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn insert(&self, entry: MeasurementEntry) -> Result<(), StoreError>;

    /// Replace an entry by id.
    async fn update(&self, entry: MeasurementEntry) -> Result<(), StoreError>;

    /// Remove an entry by id, returning it.
    async fn remove(&self, entry_id: Uuid) -> Result<Option<MeasurementEntry>, StoreError>;

    async fn get(&self, entry_id: Uuid) -> Result<Option<MeasurementEntry>, StoreError>;

    /// All entries of a stream, ascending by timestamp.
    async fn stream_entries(&self, key: &StreamKey) -> Result<Vec<MeasurementEntry>, StoreError>;

    /// Atomically replace a whole stream (used after resequencing).
    async fn replace_stream(
        &self,
        key: &StreamKey,
        entries: Vec<MeasurementEntry>,
    ) -> Result<(), StoreError>;

    /// Range scan over one client's entries, `from..=to`, ascending.
    async fn client_entries_in_range(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeasurementEntry>, StoreError>;

    /// Every stream a client has written to.
    async fn streams_for_client(&self, client_id: &str) -> Result<Vec<StreamKey>, StoreError>;

    /// Latest entry of a stream, by timestamp.
    async fn last_entry(&self, key: &StreamKey) -> Result<Option<MeasurementEntry>, StoreError>;

    /// Timestamp of the oldest raw (non-summary) entry of a stream.
    async fn oldest_raw_entry(&self, key: &StreamKey)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Whether a monthly summary row already exists for the period.
    async fn has_month_summary(
        &self,
        key: &StreamKey,
        period: SummaryPeriod,
    ) -> Result<bool, StoreError>;

    /// Atomic monthly archival: delete every raw entry with
    /// `from <= timestamp < to` and insert the summary row in one step.
    /// Partial states are unobservable. Returns the number of raw entries
    /// removed.
    async fn archive_month(
        &self,
        key: &StreamKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        summary: MeasurementEntry,
    ) -> Result<usize, StoreError>;
}

/// In-memory entry store: streams kept timestamp-sorted under one lock so
/// the archival swap is a single critical section.
#[derive(Default)]
pub struct InMemoryEntryStore {
    streams: RwLock<HashMap<StreamKey, Vec<MeasurementEntry>>>,
}

impl InMemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort(entries: &mut Vec<MeasurementEntry>) {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.entry_id.cmp(&b.entry_id)));
    }
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
    async fn insert(&self, entry: MeasurementEntry) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(entry.key()).or_default();
        stream.push(entry);
        Self::sort(stream);
        Ok(())
    }

    async fn update(&self, entry: MeasurementEntry) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(entry.key()).or_default();
        match stream.iter_mut().find(|e| e.entry_id == entry.entry_id) {
            Some(slot) => *slot = entry,
            None => stream.push(entry),
        }
        Self::sort(stream);
        Ok(())
    }

    async fn remove(&self, entry_id: Uuid) -> Result<Option<MeasurementEntry>, StoreError> {
        let mut streams = self.streams.write().await;
        for stream in streams.values_mut() {
            if let Some(pos) = stream.iter().position(|e| e.entry_id == entry_id) {
                return Ok(Some(stream.remove(pos)));
            }
        }
        Ok(None)
    }

    async fn get(&self, entry_id: Uuid) -> Result<Option<MeasurementEntry>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .values()
            .flat_map(|s| s.iter())
            .find(|e| e.entry_id == entry_id)
            .cloned())
    }

    async fn stream_entries(&self, key: &StreamKey) -> Result<Vec<MeasurementEntry>, StoreError> {
        Ok(self.streams.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn replace_stream(
        &self,
        key: &StreamKey,
        mut entries: Vec<MeasurementEntry>,
    ) -> Result<(), StoreError> {
        Self::sort(&mut entries);
        self.streams.write().await.insert(key.clone(), entries);
        Ok(())
    }

    async fn client_entries_in_range(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeasurementEntry>, StoreError> {
        let streams = self.streams.read().await;
        let mut entries: Vec<MeasurementEntry> = streams
            .iter()
            .filter(|(key, _)| key.client_id == client_id)
            .flat_map(|(_, stream)| stream.iter())
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    async fn streams_for_client(&self, client_id: &str) -> Result<Vec<StreamKey>, StoreError> {
        let streams = self.streams.read().await;
        let mut keys: Vec<StreamKey> = streams
            .keys()
            .filter(|k| k.client_id == client_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            (a.node_id.as_str(), a.scope_identifier.as_str())
                .cmp(&(b.node_id.as_str(), b.scope_identifier.as_str()))
        });
        Ok(keys)
    }

    async fn last_entry(&self, key: &StreamKey) -> Result<Option<MeasurementEntry>, StoreError> {
        Ok(self
            .streams
            .read()
            .await
            .get(key)
            .and_then(|s| s.last())
            .cloned())
    }

    async fn oldest_raw_entry(
        &self,
        key: &StreamKey,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .streams
            .read()
            .await
            .get(key)
            .and_then(|s| s.iter().find(|e| !e.is_summary))
            .map(|e| e.timestamp))
    }

    async fn has_month_summary(
        &self,
        key: &StreamKey,
        period: SummaryPeriod,
    ) -> Result<bool, StoreError> {
        Ok(self
            .streams
            .read()
            .await
            .get(key)
            .map(|s| {
                s.iter()
                    .any(|e| e.is_summary && e.summary_period == Some(period))
            })
            .unwrap_or(false))
    }

    async fn archive_month(
        &self,
        key: &StreamKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        summary: MeasurementEntry,
    ) -> Result<usize, StoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams.entry(key.clone()).or_default();

        let before = stream.len();
        stream.retain(|e| e.is_summary || e.timestamp < from || e.timestamp >= to);
        let removed = before - stream.len();

        stream.push(summary);
        Self::sort(stream);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ProcessingStatus;
    use carbonplane_factors::{FactorSource, ScopeType};
    use carbonplane_registry::InputType;
    use chrono::TimeZone;

    fn entry(ts: DateTime<Utc>) -> MeasurementEntry {
        MeasurementEntry {
            entry_id: Uuid::new_v4(),
            client_id: "acme".to_string(),
            node_id: "n1".to_string(),
            scope_identifier: "DIESEL".to_string(),
            scope_type: ScopeType::Scope1,
            input_type: InputType::Manual,
            date: ts.date_naive(),
            time: ts.time(),
            timestamp: ts,
            data_values: HashMap::new(),
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

    #[tokio::test]
    async fn test_stream_entries_sorted_by_timestamp() {
        let store = InMemoryEntryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        store.insert(entry(t2)).await.unwrap();
        store.insert(entry(t1)).await.unwrap();

        let key = StreamKey::new("acme", "n1", "DIESEL");
        let entries = store.stream_entries(&key).await.unwrap();
        assert_eq!(entries[0].timestamp, t1);
        assert_eq!(entries[1].timestamp, t2);
    }

    #[tokio::test]
    async fn test_archive_month_is_a_single_swap() {
        let store = InMemoryEntryStore::new();
        let key = StreamKey::new("acme", "n1", "DIESEL");
        for day in 1..=5 {
            store
                .insert(entry(Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()))
                .await
                .unwrap();
        }
        // One entry outside the month must survive
        let april = Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).unwrap();
        store.insert(entry(april)).await.unwrap();

        let mut summary = entry(Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap());
        summary.is_summary = true;
        summary.summary_period = Some(SummaryPeriod { month: 3, year: 2024 });

        let from = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let removed = store.archive_month(&key, from, to, summary).await.unwrap();
        assert_eq!(removed, 5);

        let entries = store.stream_entries(&key).await.unwrap();
        let raw_march: Vec<_> = entries
            .iter()
            .filter(|e| !e.is_summary && e.timestamp < to)
            .collect();
        assert!(raw_march.is_empty());
        assert!(store
            .has_month_summary(&key, SummaryPeriod { month: 3, year: 2024 })
            .await
            .unwrap());
        assert_eq!(entries.iter().filter(|e| !e.is_summary).count(), 1);
    }

    #[tokio::test]
    async fn test_range_scan_is_inclusive() {
        let store = InMemoryEntryStore::new();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        store.insert(entry(t1)).await.unwrap();
        store.insert(entry(t2)).await.unwrap();

        let entries = store
            .client_entries_in_range("acme", t1, t2)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }
}
