//! CarbonPlane: the assembled multi-tenant carbon-accounting data plane.
//!
//! Wires the write path (ingestion -> calculation -> allocation ->
//! summaries -> events) and the configuration path (registry/catalogue
//! edits -> targeted recomputation -> events) behind one value. Every
//! public operation receives a pre-authorised [`Principal`]; the plane
//! enforces client isolation only - a principal bound to client X can
//! touch only client X's streams and summaries.

pub mod config;
pub mod telemetry;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use carbonplane_bus::{BroadcastBus, ChangeEvent, EventBus, EventKind};
use carbonplane_factors::FactorCatalogue;
use carbonplane_pipeline::{
    ApiPoller, CalcWorker, CalculationEngine, EntryStore, InMemoryEntryStore, IngestError,
    IngestInput, IngestReport, Ingestor, PollOutcome, ProcessingStatus, StreamKey, StreamLocks,
};
use carbonplane_registry::{
    AllocationOutcome, ChartKind, Client, ClientStore, Flowchart, FlowchartRegistry,
    InMemoryClientStore, InMemoryFlowchartStore, NodeUpdate, Principal, RegistryError,
    UpsertOutcome,
};
use carbonplane_rollup::{
    Backup, BackupError, BackupService, EmissionSummary, InMemoryReductionStore,
    InMemorySummaryStore, MaterialiseError, Materialiser, Period, ReductionEntry, ReductionError,
    ReductionInput, ReductionLedger, ReductionProject, ReductionSummariser,
};
use carbonplane_scheduler::{
    CronSchedule, CronSpecError, InMemoryCollectionConfigStore, JobRunner,
    MonthlyAggregationJob, OverdueJob, SummaryRefreshJob,
};

pub use carbonplane_bus as bus;
pub use carbonplane_factors as factors;
pub use carbonplane_pipeline as pipeline;
pub use carbonplane_registry as registry;
pub use carbonplane_rollup as rollup;
pub use carbonplane_scheduler as scheduler;

pub use config::PlaneConfig;
pub use telemetry::init_telemetry;

/// Plane-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PlaneError {
    #[error("principal {principal} may not access client {client_id}")]
    Forbidden {
        principal: String,
        client_id: String,
    },

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Materialise(#[from] MaterialiseError),

    #[error(transparent)]
    Reduction(#[from] ReductionError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Cron(#[from] CronSpecError),

    #[error("scheduled job failed: {0}")]
    Job(String),
}

/// The assembled data plane.
pub struct CarbonPlane {
    config: PlaneConfig,
    catalogue: Arc<FactorCatalogue>,
    registry: Arc<FlowchartRegistry>,
    clients: Arc<dyn ClientStore>,
    entries: Arc<dyn EntryStore>,
    bus: Arc<BroadcastBus>,
    ingestor: Arc<Ingestor>,
    worker: Arc<CalcWorker>,
    materialiser: Arc<Materialiser>,
    ledger: Arc<ReductionLedger>,
    backup: BackupService,
    locks: StreamLocks,
    configs: Arc<InMemoryCollectionConfigStore>,
    calc_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamKey>>>,
}

impl CarbonPlane {
    /// Assemble a plane over in-memory stores with the default seeded
    /// factor catalogue.
    pub fn new(config: PlaneConfig) -> Self {
        Self::with_catalogue(config, Arc::new(FactorCatalogue::with_defaults()))
    }

    /// Assemble a plane with an explicit catalogue version.
    pub fn with_catalogue(config: PlaneConfig, catalogue: Arc<FactorCatalogue>) -> Self {
        let registry = Arc::new(FlowchartRegistry::new(
            Arc::new(InMemoryFlowchartStore::new()),
            Arc::clone(&catalogue),
        ));
        let clients: Arc<dyn ClientStore> = Arc::new(InMemoryClientStore::new());
        let entries: Arc<dyn EntryStore> = Arc::new(InMemoryEntryStore::new());
        let bus = Arc::new(BroadcastBus::new());
        let locks = StreamLocks::new();
        let (calc_tx, calc_rx) = mpsc::unbounded_channel();

        let ingestor = Arc::new(Ingestor::new(
            Arc::clone(&registry),
            Arc::clone(&catalogue),
            Arc::clone(&entries),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            locks.clone(),
            config.timezone,
            calc_tx,
        ));

        let worker = Arc::new(CalcWorker::new(
            CalculationEngine::new(Arc::clone(&catalogue)),
            Arc::clone(&registry),
            Arc::clone(&entries),
            locks.clone(),
            config.worker.clone(),
        ));

        let reduction_store = Arc::new(InMemoryReductionStore::new());
        let ledger = Arc::new(ReductionLedger::new(
            Arc::clone(&reduction_store) as Arc<dyn carbonplane_rollup::ReductionStore>,
            Arc::clone(&bus) as Arc<dyn EventBus>,
        ));

        let summaries = Arc::new(InMemorySummaryStore::new());
        let materialiser = Arc::new(Materialiser::new(
            Arc::clone(&registry),
            Arc::clone(&entries),
            Arc::clone(&summaries) as Arc<dyn carbonplane_rollup::SummaryStore>,
            ReductionSummariser::new(
                reduction_store as Arc<dyn carbonplane_rollup::ReductionStore>,
                config.timezone,
            ),
            config.timezone,
        ));

        let backup = BackupService::new(summaries as Arc<dyn carbonplane_rollup::SummaryStore>);

        Self {
            config,
            catalogue,
            registry,
            clients,
            entries,
            bus,
            ingestor,
            worker,
            materialiser,
            ledger,
            backup,
            locks,
            configs: Arc::new(InMemoryCollectionConfigStore::new()),
            calc_rx: Mutex::new(Some(calc_rx)),
        }
    }

    pub fn config(&self) -> &PlaneConfig {
        &self.config
    }

    pub fn catalogue(&self) -> Arc<FactorCatalogue> {
        Arc::clone(&self.catalogue)
    }

    /// Subscribe to a client's change events.
    pub fn subscribe(&self, client_id: &str) -> tokio::sync::broadcast::Receiver<ChangeEvent> {
        self.bus.subscribe(&carbonplane_bus::client_topic(client_id))
    }

    fn authorize(&self, principal: &Principal, client_id: &str) -> Result<(), PlaneError> {
        if principal.can_access(client_id) {
            Ok(())
        } else {
            Err(PlaneError::Forbidden {
                principal: principal.id.clone(),
                client_id: client_id.to_string(),
            })
        }
    }

    // ============================================================================
    // CLIENTS & REGISTRY
    // ============================================================================

    pub async fn register_client(
        &self,
        principal: &Principal,
        client: Client,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, &client.client_id)?;
        self.clients
            .upsert(client)
            .await
            .map_err(RegistryError::Storage)?;
        Ok(())
    }

    pub async fn upsert_flowchart(
        &self,
        principal: &Principal,
        chart: Flowchart,
    ) -> Result<UpsertOutcome, PlaneError> {
        self.authorize(principal, &chart.client_id)?;
        Ok(self.registry.upsert_flowchart(chart).await?)
    }

    pub async fn get_flowchart(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.registry.get_flowchart(client_id, kind).await?)
    }

    pub async fn soft_delete_flowchart(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.registry.soft_delete(client_id, kind).await?)
    }

    pub async fn restore_flowchart(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Flowchart, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.registry.restore(client_id, kind).await?)
    }

    pub async fn update_node(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
        update: NodeUpdate,
    ) -> Result<UpsertOutcome, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .registry
            .update_node(client_id, kind, node_id, update)
            .await?)
    }

    pub async fn delete_node(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
    ) -> Result<UpsertOutcome, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.registry.delete_node(client_id, kind, node_id).await?)
    }

    pub async fn assign_head(
        &self,
        principal: &Principal,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
        head: Option<String>,
    ) -> Result<UpsertOutcome, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .registry
            .assign_head(client_id, kind, node_id, head)
            .await?)
    }

    /// Edit an allocation percentage, emit `allocation-updated`, and run
    /// the targeted recomputation of the client's existing summaries.
    pub async fn set_allocation(
        &self,
        principal: &Principal,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
        pct: rust_decimal::Decimal,
    ) -> Result<AllocationOutcome, PlaneError> {
        self.authorize(principal, client_id)?;
        let outcome = self
            .registry
            .set_allocation(client_id, node_id, scope_identifier, pct)
            .await?;

        let event = ChangeEvent::new(
            client_id,
            EventKind::AllocationUpdated,
            serde_json::json!({
                "nodeId": node_id,
                "scopeIdentifier": scope_identifier,
                "totalPct": outcome.total_pct,
                "unallocatedPct": outcome.unallocated_pct,
                "warning": outcome.warning,
            }),
        );
        self.bus.publish(&event.topic(), event).await;

        self.recompute_existing_summaries(client_id).await?;
        Ok(outcome)
    }

    async fn recompute_existing_summaries(&self, client_id: &str) -> Result<(), PlaneError> {
        let periods: Vec<Period> = self
            .materialiser
            .summaries()
            .all_for_client(client_id)
            .await
            .map_err(MaterialiseError::Storage)?
            .into_iter()
            .map(|s| s.period)
            .collect();
        for period in periods {
            self.materialiser.recalculate(client_id, period).await?;
        }
        Ok(())
    }

    // ============================================================================
    // INGESTION & CALCULATION
    // ============================================================================

    pub async fn ingest(
        &self,
        principal: &Principal,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
        input: IngestInput,
    ) -> Result<IngestReport, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .ingestor
            .ingest(client_id, node_id, scope_identifier, input)
            .await?)
    }

    pub async fn edit_manual_entry(
        &self,
        principal: &Principal,
        client_id: &str,
        entry_id: Uuid,
        values: std::collections::HashMap<String, f64>,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, client_id)?;
        self.ingestor.edit_manual(entry_id, values).await?;
        Ok(())
    }

    pub async fn delete_manual_entry(
        &self,
        principal: &Principal,
        client_id: &str,
        entry_id: Uuid,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, client_id)?;
        let timestamp = self
            .entries
            .get(entry_id)
            .await
            .map_err(IngestError::Storage)?
            .map(|e| e.timestamp);
        self.ingestor.delete_manual(entry_id).await?;
        if let Some(timestamp) = timestamp {
            self.materialiser.on_entry_changed(client_id, timestamp).await?;
        }
        Ok(())
    }

    /// Drive the calculation engine over every stream of a client, then
    /// rematerialise the summaries the processed entries touch. The
    /// background worker does the same continuously; this is the
    /// synchronous path.
    pub async fn process_pending(
        &self,
        principal: &Principal,
        client_id: &str,
    ) -> Result<usize, PlaneError> {
        self.authorize(principal, client_id)?;

        let streams = self
            .entries
            .streams_for_client(client_id)
            .await
            .map_err(IngestError::Storage)?;

        let mut processed_total = 0;
        let mut touched: HashSet<DateTime<Utc>> = HashSet::new();

        for key in streams {
            let pending: Vec<DateTime<Utc>> = self
                .entries
                .stream_entries(&key)
                .await
                .map_err(IngestError::Storage)?
                .iter()
                .filter(|e| e.processing_status == ProcessingStatus::Pending && !e.is_summary)
                .map(|e| e.timestamp)
                .collect();
            if pending.is_empty() {
                continue;
            }

            processed_total += self.worker.process_stream(&key).await?;
            touched.extend(pending);
        }

        for timestamp in touched {
            self.materialiser.on_entry_changed(client_id, timestamp).await?;
        }
        Ok(processed_total)
    }

    /// Poll every configured API endpoint of a client.
    pub async fn poll_api(
        &self,
        principal: &Principal,
        client_id: &str,
    ) -> Result<Vec<PollOutcome>, PlaneError> {
        self.authorize(principal, client_id)?;
        let poller = ApiPoller::new(Arc::clone(&self.registry), Arc::clone(&self.ingestor));
        Ok(poller.poll_client(client_id).await)
    }

    // ============================================================================
    // SUMMARIES
    // ============================================================================

    pub async fn summary(
        &self,
        principal: &Principal,
        client_id: &str,
        period: Period,
    ) -> Result<Option<EmissionSummary>, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .materialiser
            .summaries()
            .get(client_id, &period)
            .await
            .map_err(MaterialiseError::Storage)?)
    }

    pub async fn recalculate_summary(
        &self,
        principal: &Principal,
        client_id: &str,
        period: Period,
    ) -> Result<Option<EmissionSummary>, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.materialiser.recalculate(client_id, period).await?)
    }

    pub async fn force_recalculate_summary(
        &self,
        principal: &Principal,
        client_id: &str,
        period: Period,
    ) -> Result<EmissionSummary, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.materialiser.force_recalculate(client_id, period).await?)
    }

    pub async fn protect_summary(
        &self,
        principal: &Principal,
        client_id: &str,
        period: Period,
        prevent_auto_recalculation: bool,
        migrated_data: bool,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .materialiser
            .set_protection(client_id, period, prevent_auto_recalculation, migrated_data)
            .await?)
    }

    // ============================================================================
    // REDUCTIONS
    // ============================================================================

    pub async fn register_reduction_project(
        &self,
        principal: &Principal,
        client_id: &str,
        project: ReductionProject,
    ) -> Result<(), PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.ledger.register_project(client_id, project).await?)
    }

    pub async fn append_reduction(
        &self,
        principal: &Principal,
        client_id: &str,
        project_id: &str,
        input: ReductionInput,
        timestamp: Option<DateTime<Utc>>,
        source: Option<String>,
    ) -> Result<ReductionEntry, PlaneError> {
        self.authorize(principal, client_id)?;
        let entry = self
            .ledger
            .append(client_id, project_id, input, timestamp, source)
            .await?;
        self.materialiser
            .on_entry_changed(client_id, entry.timestamp)
            .await?;
        Ok(entry)
    }

    // ============================================================================
    // BACKUP & RESTORE
    // ============================================================================

    pub async fn full_backup(
        &self,
        principal: &Principal,
        client_id: &str,
    ) -> Result<Backup, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.backup.full_backup(client_id).await?)
    }

    pub async fn incremental_backup(
        &self,
        principal: &Principal,
        client_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Backup, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self.backup.incremental_backup(client_id, since).await?)
    }

    pub async fn restore_backup(
        &self,
        principal: &Principal,
        backup: &Backup,
    ) -> Result<usize, PlaneError> {
        for summary in &backup.data {
            self.authorize(principal, &summary.client_id)?;
        }
        Ok(self.backup.restore(backup).await?)
    }

    pub async fn delete_summaries(
        &self,
        principal: &Principal,
        client_id: &str,
    ) -> Result<usize, PlaneError> {
        self.authorize(principal, client_id)?;
        Ok(self
            .materialiser
            .summaries()
            .delete_all(client_id)
            .await
            .map_err(MaterialiseError::Storage)?)
    }

    // ============================================================================
    // BACKGROUND TASKS
    // ============================================================================

    /// Build the cron runner with the three standard jobs.
    pub fn job_runner(&self) -> Result<JobRunner, PlaneError> {
        let tz = self.config.timezone;

        let monthly = Arc::new(MonthlyAggregationJob::new(
            Arc::clone(&self.clients),
            Arc::clone(&self.registry),
            Arc::clone(&self.entries),
            Arc::clone(&self.materialiser),
            Arc::clone(&self.bus) as Arc<dyn EventBus>,
            self.locks.clone(),
            tz,
        ));
        let overdue = Arc::new(OverdueJob::new(
            Arc::clone(&self.clients),
            Arc::clone(&self.registry),
            Arc::clone(&self.entries),
            Arc::clone(&self.configs) as Arc<dyn carbonplane_scheduler::CollectionConfigStore>,
            Arc::clone(&self.bus) as Arc<dyn EventBus>,
        ));
        let refresh = Arc::new(SummaryRefreshJob::new(
            Arc::clone(&self.clients),
            Arc::clone(&self.materialiser),
            tz,
        ));

        Ok(JobRunner::new()
            .register(
                monthly,
                CronSchedule::parse(&self.config.monthly_aggregation_cron, tz)?,
                self.config.job_window,
            )
            .register(
                overdue,
                CronSchedule::parse(&self.config.overdue_cron, tz)?,
                self.config.job_window,
            )
            .register(
                refresh,
                CronSchedule::parse(&self.config.summary_cron, tz)?,
                self.config.job_window,
            ))
    }

    /// Spawn the calculation worker loop and the cron runner. The worker
    /// can be spawned once; later calls return only the runner handle.
    pub fn spawn_background(&self) -> Result<Vec<JoinHandle<()>>, PlaneError> {
        let mut handles = Vec::new();

        if let Some(rx) = self.calc_rx.lock().take() {
            let worker = Arc::clone(&self.worker);
            handles.push(tokio::spawn(async move {
                worker.run(rx).await;
            }));
        }

        let runner = self.job_runner()?;
        handles.push(tokio::spawn(async move {
            runner.run().await;
        }));
        Ok(handles)
    }

    /// Trigger one scheduled job by name, synchronously.
    pub async fn run_job(&self, name: &str) -> Result<usize, PlaneError> {
        let runner = self.job_runner()?;
        match runner.trigger(name).await {
            Some(Ok(report)) => Ok(report.items_processed),
            Some(Err(e)) => Err(PlaneError::Job(e.to_string())),
            None => Err(PlaneError::Job(format!("no job named {}", name))),
        }
    }
}
