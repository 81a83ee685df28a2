//! Overdue detection: flags streams whose expected collection cadence has
//! lapsed and raises at most one alert per overdue window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use carbonplane_bus::{ChangeEvent, EventBus, EventKind};
use carbonplane_pipeline::{EntryStore, StreamKey};
use carbonplane_registry::{
    ChartKind, ClientStore, CollectionFrequency, FlowchartRegistry, StoreError,
};

use crate::jobs::{Job, JobError, JobReport};

/// Per-stream collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub key: StreamKey,
    pub frequency: CollectionFrequency,
    pub last_collected: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
    /// Due instant the last alert was raised for; alerts fire at most
    /// once per overdue window
    pub last_alerted_due: Option<DateTime<Utc>>,
}

impl CollectionConfig {
    pub fn new(key: StreamKey, frequency: CollectionFrequency) -> Self {
        Self {
            key,
            frequency,
            last_collected: None,
            next_due: None,
            last_alerted_due: None,
        }
    }
}

/// Collection-config persistence contract.
#[async_trait]
pub trait CollectionConfigStore: Send + Sync {
    async fn get(&self, key: &StreamKey) -> Result<Option<CollectionConfig>, StoreError>;
    async fn upsert(&self, config: CollectionConfig) -> Result<(), StoreError>;
    async fn all(&self) -> Result<Vec<CollectionConfig>, StoreError>;
}

/// In-memory collection-config store.
#[derive(Default)]
pub struct InMemoryCollectionConfigStore {
    configs: RwLock<HashMap<StreamKey, CollectionConfig>>,
}

impl InMemoryCollectionConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollectionConfigStore for InMemoryCollectionConfigStore {
    async fn get(&self, key: &StreamKey) -> Result<Option<CollectionConfig>, StoreError> {
        Ok(self.configs.read().await.get(key).cloned())
    }

    async fn upsert(&self, config: CollectionConfig) -> Result<(), StoreError> {
        self.configs
            .write()
            .await
            .insert(config.key.clone(), config);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<CollectionConfig>, StoreError> {
        let configs = self.configs.read().await;
        let mut all: Vec<CollectionConfig> = configs.values().cloned().collect();
        all.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        Ok(all)
    }
}

/// The daily overdue-detection job.
pub struct OverdueJob {
    clients: Arc<dyn ClientStore>,
    registry: Arc<FlowchartRegistry>,
    entries: Arc<dyn EntryStore>,
    configs: Arc<dyn CollectionConfigStore>,
    bus: Arc<dyn EventBus>,
}

impl OverdueJob {
    pub fn new(
        clients: Arc<dyn ClientStore>,
        registry: Arc<FlowchartRegistry>,
        entries: Arc<dyn EntryStore>,
        configs: Arc<dyn CollectionConfigStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            clients,
            registry,
            entries,
            configs,
            bus,
        }
    }

    /// Seed configs from flowchart scopes that declare a cadence, then
    /// check every config against the stream's latest entry.
    pub async fn detect(&self, now: DateTime<Utc>) -> Result<usize, JobError> {
        self.seed_configs().await?;

        let mut alerts = 0;
        for mut config in self
            .configs
            .all()
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?
        {
            let last = self
                .entries
                .last_entry(&config.key)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?
                .map(|e| e.timestamp)
                .or(config.last_collected);

            let Some(last) = last else {
                // Nothing collected yet: nothing to measure the cadence from
                continue;
            };

            let due = last + config.frequency.cadence();
            config.last_collected = Some(last);
            config.next_due = Some(due);

            if now > due && config.last_alerted_due != Some(due) {
                config.last_alerted_due = Some(due);
                alerts += 1;

                let event = ChangeEvent::new(
                    config.key.client_id.clone(),
                    EventKind::CollectionOverdue,
                    serde_json::json!({
                        "nodeId": config.key.node_id,
                        "scopeIdentifier": config.key.scope_identifier,
                        "lastCollected": last.to_rfc3339(),
                        "dueSince": due.to_rfc3339(),
                    }),
                );
                self.bus.publish(&event.topic(), event).await;

                tracing::warn!(
                    stream = %config.key,
                    due = %due,
                    "Collection overdue"
                );
            }

            self.configs
                .upsert(config)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?;
        }
        Ok(alerts)
    }

    async fn seed_configs(&self) -> Result<(), JobError> {
        let clients = self
            .clients
            .active_clients()
            .await
            .map_err(|e| JobError::Failed(e.to_string()))?;

        for client in clients {
            let chart = self
                .registry
                .get_flowchart(&client.client_id, ChartKind::Organisation)
                .await
                .map_err(|e| JobError::Failed(e.to_string()))?;
            let Some(chart) = chart else { continue };

            for node in &chart.nodes {
                for scope in &node.scopes {
                    let Some(frequency) = scope.collection_frequency else {
                        continue;
                    };
                    let key = StreamKey::new(
                        client.client_id.clone(),
                        node.node_id.clone(),
                        scope.scope_identifier.clone(),
                    );
                    let existing = self
                        .configs
                        .get(&key)
                        .await
                        .map_err(|e| JobError::Failed(e.to_string()))?;
                    match existing {
                        Some(mut config) if config.frequency != frequency => {
                            config.frequency = frequency;
                            self.configs
                                .upsert(config)
                                .await
                                .map_err(|e| JobError::Failed(e.to_string()))?;
                        }
                        Some(_) => {}
                        None => {
                            self.configs
                                .upsert(CollectionConfig::new(key, frequency))
                                .await
                                .map_err(|e| JobError::Failed(e.to_string()))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for OverdueJob {
    fn name(&self) -> &'static str {
        "overdue-detection"
    }

    async fn run(&self) -> Result<JobReport, JobError> {
        let alerts = self.detect(Utc::now()).await?;
        Ok(JobReport {
            items_processed: alerts,
        })
    }
}
