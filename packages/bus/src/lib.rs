//! CarbonPlane: Change-Notification Bus
//!
//! Typed events emitted by the data plane whenever raw data, allocation
//! configuration, or summaries change. Topics are keyed per client and
//! delivery to push collaborators is at-least-once; the core never waits
//! for an acknowledgement.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A manual measurement entry was saved
    ManualDataSaved,
    /// An API-sourced measurement entry was saved
    ApiDataSaved,
    /// An IoT-sourced measurement entry was saved
    IotDataSaved,
    /// A CSV batch finished uploading
    CsvDataUploaded,
    /// A manual entry was edited in place
    ManualDataEdited,
    /// A manual entry was deleted
    ManualDataDeleted,
    /// A monthly summary entry replaced its raw entries
    MonthlySummaryCreated,
    /// Allocation percentages changed on a scope
    AllocationUpdated,
    /// A reduction-ledger entry was saved
    ReductionEntrySaved,
    /// A collection stream went overdue
    CollectionOverdue,
}

impl EventKind {
    /// Wire name of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualDataSaved => "manual-data-saved",
            Self::ApiDataSaved => "api-data-saved",
            Self::IotDataSaved => "iot-data-saved",
            Self::CsvDataUploaded => "csv-data-uploaded",
            Self::ManualDataEdited => "manual-data-edited",
            Self::ManualDataDeleted => "manual-data-deleted",
            Self::MonthlySummaryCreated => "monthly-summary-created",
            Self::AllocationUpdated => "allocation-updated",
            Self::ReductionEntrySaved => "reduction-entry-saved",
            Self::CollectionOverdue => "collection-overdue",
        }
    }
}

/// A change event delivered to push collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event ID
    pub id: Uuid,
    /// Client whose data changed
    pub client_id: String,
    /// Kind of change
    pub kind: EventKind,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload
    pub payload: serde_json::Value,
}

impl ChangeEvent {
    /// Create a new event stamped with the current time.
    pub fn new(client_id: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Topic this event is published on.
    pub fn topic(&self) -> String {
        client_topic(&self.client_id)
    }
}

/// Topic name for a client's event stream.
pub fn client_topic(client_id: &str) -> String {
    format!("client:{}", client_id)
}

/// Push collaborator contract.
///
/// Implementations deliver events to whatever real-time channel the
/// deployment uses. Delivery is fire-and-forget from the core's side.
#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event on a topic.
    async fn publish(&self, topic: &str, event: ChangeEvent);
}

/// In-process bus over tokio broadcast channels, one channel per topic.
///
/// Events published to a topic with no live subscribers are dropped,
/// which matches the no-acknowledgement contract.
pub struct BroadcastBus {
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: 1024,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<ChangeEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, event: ChangeEvent) {
        let sender = self.sender(topic);
        let delivered = sender.send(event.clone()).unwrap_or(0);

        tracing::debug!(
            topic = %topic,
            kind = %event.kind.as_str(),
            client_id = %event.client_id,
            delivered = delivered,
            "Change event published"
        );
    }
}

/// Shared handle type used across the plane.
pub type SharedBus = Arc<dyn EventBus>;
