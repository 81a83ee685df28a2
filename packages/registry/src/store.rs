//! Storage collaborator contract for flowcharts.
//!
//! The real deployment backs this with a document store; the in-memory
//! implementation serves tests and single-process runs.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::flowchart::{ChartKind, Flowchart};
use crate::types::ClientId;

/// Storage-layer failures, shared by every store trait in the plane.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Transient: retry with backoff
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Optimistic-version conflict on conditional update
    #[error("version conflict on {0}")]
    VersionConflict(String),

    /// Fatal: stored state violates an invariant
    #[error("storage corruption: {0}")]
    Corruption(String),
}

/// Flowchart persistence contract.
#[async_trait]
pub trait FlowchartStore: Send + Sync {
    /// The active (non-deleted) chart for a client, if any.
    async fn get_active(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, StoreError>;

    /// Replace the active chart. The caller is responsible for version
    /// monotonicity; the store rejects writes that move the version
    /// backwards.
    async fn put_active(&self, chart: Flowchart) -> Result<(), StoreError>;

    /// Move the active chart onto the soft-deleted stack.
    async fn soft_delete(&self, client_id: &str, kind: ChartKind)
        -> Result<Option<Flowchart>, StoreError>;

    /// Pop the most recently soft-deleted chart, if any.
    async fn pop_deleted(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, StoreError>;

    /// Clients that currently have an active chart of the given kind.
    async fn clients_with_active(&self, kind: ChartKind) -> Result<Vec<ClientId>, StoreError>;
}

type ChartKey = (ClientId, ChartKind);

/// In-memory flowchart store.
#[derive(Default)]
pub struct InMemoryFlowchartStore {
    active: RwLock<HashMap<ChartKey, Flowchart>>,
    deleted: RwLock<HashMap<ChartKey, Vec<Flowchart>>>,
}

impl InMemoryFlowchartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowchartStore for InMemoryFlowchartStore {
    async fn get_active(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, StoreError> {
        Ok(self
            .active
            .read()
            .await
            .get(&(client_id.to_string(), kind))
            .cloned())
    }

    async fn put_active(&self, chart: Flowchart) -> Result<(), StoreError> {
        let key = (chart.client_id.clone(), chart.kind);
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(&key) {
            if chart.version < existing.version {
                return Err(StoreError::VersionConflict(format!(
                    "flowchart {}:{:?} v{} behind stored v{}",
                    chart.client_id, chart.kind, chart.version, existing.version
                )));
            }
        }
        active.insert(key, chart);
        Ok(())
    }

    async fn soft_delete(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, StoreError> {
        let key = (client_id.to_string(), kind);
        let mut active = self.active.write().await;
        let Some(mut chart) = active.remove(&key) else {
            return Ok(None);
        };
        chart.deleted = true;
        self.deleted
            .write()
            .await
            .entry(key)
            .or_default()
            .push(chart.clone());
        Ok(Some(chart))
    }

    async fn pop_deleted(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, StoreError> {
        let key = (client_id.to_string(), kind);
        Ok(self
            .deleted
            .write()
            .await
            .get_mut(&key)
            .and_then(|stack| stack.pop()))
    }

    async fn clients_with_active(&self, kind: ChartKind) -> Result<Vec<ClientId>, StoreError> {
        let mut ids: Vec<ClientId> = self
            .active
            .read()
            .await
            .keys()
            .filter(|(_, k)| *k == kind)
            .map(|(c, _)| c.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_rejects_version_regression() {
        let store = InMemoryFlowchartStore::new();
        let mut chart = Flowchart::new("acme", ChartKind::Organisation);
        chart.version = 3;
        store.put_active(chart.clone()).await.unwrap();

        chart.version = 2;
        assert!(matches!(
            store.put_active(chart).await,
            Err(StoreError::VersionConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_and_pop() {
        let store = InMemoryFlowchartStore::new();
        store
            .put_active(Flowchart::new("acme", ChartKind::Organisation))
            .await
            .unwrap();

        let deleted = store
            .soft_delete("acme", ChartKind::Organisation)
            .await
            .unwrap()
            .unwrap();
        assert!(deleted.deleted);
        assert!(store
            .get_active("acme", ChartKind::Organisation)
            .await
            .unwrap()
            .is_none());

        let restored = store
            .pop_deleted("acme", ChartKind::Organisation)
            .await
            .unwrap();
        assert!(restored.is_some());
    }
}
