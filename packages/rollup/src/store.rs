//! Storage collaborator contracts for summaries and reduction streams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use carbonplane_registry::StoreError;

use crate::reduction::{Methodology, ReductionEntry, ReductionProject};
use crate::summary::{EmissionSummary, Period};

/// Summary persistence contract: at most one document per
/// (client, period).
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn get(
        &self,
        client_id: &str,
        period: &Period,
    ) -> Result<Option<EmissionSummary>, StoreError>;

    async fn put(&self, summary: EmissionSummary) -> Result<(), StoreError>;

    /// Every summary of a client.
    async fn all_for_client(&self, client_id: &str) -> Result<Vec<EmissionSummary>, StoreError>;

    /// Delete all summaries of a client, returning how many were removed.
    async fn delete_all(&self, client_id: &str) -> Result<usize, StoreError>;

    /// Clients with at least one summary.
    async fn clients(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory summary store.
#[derive(Default)]
pub struct InMemorySummaryStore {
    summaries: RwLock<HashMap<(String, Period), EmissionSummary>>,
}

impl InMemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SummaryStore for InMemorySummaryStore {
    async fn get(
        &self,
        client_id: &str,
        period: &Period,
    ) -> Result<Option<EmissionSummary>, StoreError> {
        Ok(self
            .summaries
            .read()
            .await
            .get(&(client_id.to_string(), *period))
            .cloned())
    }

    async fn put(&self, summary: EmissionSummary) -> Result<(), StoreError> {
        self.summaries
            .write()
            .await
            .insert((summary.client_id.clone(), summary.period), summary);
        Ok(())
    }

    async fn all_for_client(&self, client_id: &str) -> Result<Vec<EmissionSummary>, StoreError> {
        let summaries = self.summaries.read().await;
        let mut result: Vec<EmissionSummary> = summaries
            .iter()
            .filter(|((client, _), _)| client == client_id)
            .map(|(_, summary)| summary.clone())
            .collect();
        result.sort_by_key(|s| s.period.key());
        Ok(result)
    }

    async fn delete_all(&self, client_id: &str) -> Result<usize, StoreError> {
        let mut summaries = self.summaries.write().await;
        let before = summaries.len();
        summaries.retain(|(client, _), _| client != client_id);
        Ok(before - summaries.len())
    }

    async fn clients(&self) -> Result<Vec<String>, StoreError> {
        let summaries = self.summaries.read().await;
        let mut clients: Vec<String> = summaries.keys().map(|(c, _)| c.clone()).collect();
        clients.sort();
        clients.dedup();
        Ok(clients)
    }
}

/// Reduction persistence contract.
#[async_trait]
pub trait ReductionStore: Send + Sync {
    async fn upsert_project(
        &self,
        client_id: &str,
        project: ReductionProject,
    ) -> Result<(), StoreError>;

    async fn projects(&self, client_id: &str) -> Result<Vec<ReductionProject>, StoreError>;

    /// One (project, methodology) stream, ascending by timestamp.
    async fn stream(
        &self,
        client_id: &str,
        project_id: &str,
        methodology: Methodology,
    ) -> Result<Vec<ReductionEntry>, StoreError>;

    /// Atomically replace one stream (used after resequencing).
    async fn replace_stream(
        &self,
        client_id: &str,
        project_id: &str,
        methodology: Methodology,
        entries: Vec<ReductionEntry>,
    ) -> Result<(), StoreError>;

    /// Range scan over all of a client's reduction entries.
    async fn client_entries_in_range(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReductionEntry>, StoreError>;
}

type ReductionKey = (String, String, Methodology);

/// In-memory reduction store.
#[derive(Default)]
pub struct InMemoryReductionStore {
    streams: RwLock<HashMap<ReductionKey, Vec<ReductionEntry>>>,
    projects: RwLock<HashMap<String, Vec<ReductionProject>>>,
}

impl InMemoryReductionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReductionStore for InMemoryReductionStore {
    async fn upsert_project(
        &self,
        client_id: &str,
        project: ReductionProject,
    ) -> Result<(), StoreError> {
        let mut projects = self.projects.write().await;
        let list = projects.entry(client_id.to_string()).or_default();
        list.retain(|p| p.project_id != project.project_id);
        list.push(project);
        Ok(())
    }

    async fn projects(&self, client_id: &str) -> Result<Vec<ReductionProject>, StoreError> {
        Ok(self
            .projects
            .read()
            .await
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stream(
        &self,
        client_id: &str,
        project_id: &str,
        methodology: Methodology,
    ) -> Result<Vec<ReductionEntry>, StoreError> {
        Ok(self
            .streams
            .read()
            .await
            .get(&(client_id.to_string(), project_id.to_string(), methodology))
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_stream(
        &self,
        client_id: &str,
        project_id: &str,
        methodology: Methodology,
        mut entries: Vec<ReductionEntry>,
    ) -> Result<(), StoreError> {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.entry_id.cmp(&b.entry_id)));
        self.streams.write().await.insert(
            (client_id.to_string(), project_id.to_string(), methodology),
            entries,
        );
        Ok(())
    }

    async fn client_entries_in_range(
        &self,
        client_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReductionEntry>, StoreError> {
        let streams = self.streams.read().await;
        let mut entries: Vec<ReductionEntry> = streams
            .iter()
            .filter(|((client, _, _), _)| client == client_id)
            .flat_map(|(_, stream)| stream.iter())
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }
}
