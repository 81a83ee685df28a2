//! Calculation worker: drains pending entries stream by stream.
//!
//! Within a stream, entries transition `pending -> processed|failed` in
//! timestamp order under the stream's mutex. Transient storage failures
//! retry with jittered exponential backoff; a deadline overrun leaves
//! every entry of the batch pending, never half-processed, because the
//! write-back happens once at the end.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use carbonplane_factors::GasVector;
use carbonplane_registry::{FlowchartRegistry, StoreError};

use crate::calc::{CalcError, CalculationEngine};
use crate::entry::{resequence, CalculatedEmissions, ProcessingStatus, StreamKey};
use crate::ingest::{IngestError, StreamLocks};
use crate::store::EntryStore;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Attempts against a transiently failing store before giving up
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt with jitter
    pub base_backoff: Duration,
    /// Ambient deadline per stream batch; entries stay pending on expiry
    pub deadline: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            deadline: None,
        }
    }
}

/// The calculation worker.
pub struct CalcWorker {
    engine: CalculationEngine,
    registry: Arc<FlowchartRegistry>,
    store: Arc<dyn EntryStore>,
    locks: StreamLocks,
    config: WorkerConfig,
}

impl CalcWorker {
    pub fn new(
        engine: CalculationEngine,
        registry: Arc<FlowchartRegistry>,
        store: Arc<dyn EntryStore>,
        locks: StreamLocks,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            store,
            locks,
            config,
        }
    }

    /// Drain stream notifications until the channel closes.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<StreamKey>) {
        while let Some(key) = rx.recv().await {
            match self.process_stream(&key).await {
                Ok(0) => {}
                Ok(processed) => {
                    tracing::debug!(stream = %key, processed = processed, "Stream processed")
                }
                Err(e) => tracing::error!(stream = %key, error = %e, "Stream processing failed"),
            }
        }
    }

    /// Process every pending entry of one stream. Returns how many
    /// entries reached a terminal status.
    pub async fn process_stream(&self, key: &StreamKey) -> Result<usize, IngestError> {
        match self.config.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.process_stream_inner(key)).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(stream = %key, "Calculation deadline expired; entries stay pending");
                        Ok(0)
                    }
                }
            }
            None => self.process_stream_inner(key).await,
        }
    }

    async fn process_stream_inner(&self, key: &StreamKey) -> Result<usize, IngestError> {
        let lock = self.locks.for_stream(key);
        let _guard = lock.lock().await;

        let mut stream = self
            .with_retry(|| self.store.stream_entries(key))
            .await?;
        if !stream
            .iter()
            .any(|e| e.processing_status == ProcessingStatus::Pending && !e.is_summary)
        {
            return Ok(0);
        }

        // The scope may have been removed since ingestion: leave pending
        let chart = self
            .registry
            .get_flowchart(&key.client_id, carbonplane_registry::ChartKind::Organisation)
            .await?;
        let metadata = self.registry.metadata_for(&key.client_id).await?;
        let current = metadata
            .lookup(&key.scope_identifier)
            .map(|m| m.scope_identifier.clone())
            .unwrap_or_else(|| key.scope_identifier.clone());
        let Some(scope) = chart
            .as_ref()
            .and_then(|c| c.scope(&current))
            .map(|(_, s)| s.clone())
        else {
            tracing::warn!(stream = %key, "Scope missing from active flowchart; entries stay pending");
            return Ok(0);
        };

        let mut terminal = 0;
        for entry in stream.iter_mut() {
            if entry.is_summary || entry.processing_status != ProcessingStatus::Pending {
                continue;
            }

            match self
                .engine
                .calculate(&scope, entry.timestamp, &entry.data_values)
            {
                Ok((incoming, factor)) => {
                    entry.processing_status = ProcessingStatus::Processed;
                    entry.failure_reason = None;
                    entry.calculated_emissions = Some(CalculatedEmissions {
                        incoming,
                        cumulative: GasVector::default(),
                        total_ghg_emission: Some(incoming.co2e),
                        factor_citation: Some(factor.citation),
                        calculated_at: Utc::now(),
                    });
                    terminal += 1;
                }
                Err(CalcError::Factor(e)) => {
                    // Prerequisite failure: leave the whole tail pending
                    // for retry once configuration is fixed
                    tracing::warn!(stream = %key, error = %e, "Factor unresolved; entries stay pending");
                    break;
                }
                Err(e @ CalcError::UnsupportedActivity { .. }) => {
                    entry.processing_status = ProcessingStatus::Failed;
                    entry.failure_reason = Some(e.to_string());
                    terminal += 1;
                }
            }
        }

        // Rebuild cumulative emissions over the repaired stream
        resequence(&mut stream);
        self.with_retry(|| self.store.replace_stream(key, stream.clone()))
            .await?;
        Ok(terminal)
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, IngestError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Unavailable(reason)) if attempt + 1 < self.config.max_attempts => {
                    attempt += 1;
                    let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                    let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
                    let delay = backoff + Duration::from_millis(jitter);
                    tracing::warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Transient storage failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
