//! Summary materialiser: fold processed entries into the per-period
//! multi-dimensional rollups.
//!
//! Recomputation for a given (client, period) is serialised behind a
//! per-key mutex; an invalidation arriving while a run is in flight waits
//! and recomputes, observing the newer entries. Protected summaries
//! (`prevent_auto_recalculation` or `migrated_data`) are never touched by
//! the automatic path.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use carbonplane_factors::GasVector;
use carbonplane_pipeline::{allocate, EntryStore, MeasurementEntry, ProcessingStatus};
use carbonplane_registry::{
    AllocationShare, FlowchartRegistry, NodeMetadataCache, RegistryError, StoreError,
};

use crate::reduction::ReductionError;
use crate::reduction_summary::ReductionSummariser;
use crate::store::SummaryStore;
use crate::summary::{trend, EmissionSummary, Period, ProcessEmissionSummary, Trends};

/// Dimensional fallback for entries whose scope is absent from the active
/// flowchart. Their appearance is a loss signal, counted in metadata.
const UNKNOWN: &str = "Unknown";

/// Materialisation errors.
#[derive(Debug, thiserror::Error)]
pub enum MaterialiseError {
    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Reduction(#[from] ReductionError),
}

impl From<RegistryError> for MaterialiseError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Storage(e) => MaterialiseError::Storage(e),
            other => MaterialiseError::Registry(other.to_string()),
        }
    }
}

/// The summary materialiser.
pub struct Materialiser {
    registry: Arc<FlowchartRegistry>,
    entries: Arc<dyn EntryStore>,
    summaries: Arc<dyn SummaryStore>,
    reductions: ReductionSummariser,
    timezone: Tz,
    gates: Mutex<HashMap<(String, Period), Arc<tokio::sync::Mutex<()>>>>,
}

impl Materialiser {
    pub fn new(
        registry: Arc<FlowchartRegistry>,
        entries: Arc<dyn EntryStore>,
        summaries: Arc<dyn SummaryStore>,
        reductions: ReductionSummariser,
        timezone: Tz,
    ) -> Self {
        Self {
            registry,
            entries,
            summaries,
            reductions,
            timezone,
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn summaries(&self) -> Arc<dyn SummaryStore> {
        Arc::clone(&self.summaries)
    }

    /// Invalidate and recompute exactly the summaries whose period bounds
    /// contain the changed entry's timestamp.
    pub async fn on_entry_changed(
        &self,
        client_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Period>, MaterialiseError> {
        let mut recomputed = Vec::new();
        for period in Period::containing(timestamp, self.timezone) {
            if self.recalculate(client_id, period).await?.is_some() {
                recomputed.push(period);
            }
        }
        Ok(recomputed)
    }

    /// Automatic recompute. Returns `None` when the summary is protected
    /// and was left untouched.
    pub async fn recalculate(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<Option<EmissionSummary>, MaterialiseError> {
        self.recalc_inner(client_id, period, false).await
    }

    /// Explicit force path: recomputes even protected summaries, keeping
    /// their protection flags.
    pub async fn force_recalculate(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<EmissionSummary, MaterialiseError> {
        let summary = self.recalc_inner(client_id, period, true).await?;
        Ok(summary.unwrap_or_else(|| EmissionSummary::empty(client_id, period)))
    }

    /// Flip the protection bits on a stored summary.
    pub async fn set_protection(
        &self,
        client_id: &str,
        period: Period,
        prevent_auto_recalculation: bool,
        migrated_data: bool,
    ) -> Result<(), MaterialiseError> {
        if let Some(mut summary) = self.summaries.get(client_id, &period).await? {
            summary.metadata.prevent_auto_recalculation = prevent_auto_recalculation;
            summary.metadata.migrated_data = migrated_data;
            self.summaries.put(summary).await?;
        }
        Ok(())
    }

    async fn recalc_inner(
        &self,
        client_id: &str,
        period: Period,
        force: bool,
    ) -> Result<Option<EmissionSummary>, MaterialiseError> {
        let gate = {
            let mut gates = self.gates.lock();
            Arc::clone(gates.entry((client_id.to_string(), period)).or_default())
        };
        let _guard = gate.lock().await;

        let existing = self.summaries.get(client_id, &period).await?;
        if let Some(existing) = &existing {
            if existing.is_protected() && !force {
                tracing::info!(
                    client_id = %client_id,
                    period = %period.key(),
                    "Summary protected; automatic recompute skipped"
                );
                return Ok(None);
            }
        }

        let mut summary = self.compute(client_id, period).await?;

        if let Some(existing) = existing {
            summary.summary_id = existing.summary_id;
            summary.metadata.prevent_auto_recalculation =
                existing.metadata.prevent_auto_recalculation;
            summary.metadata.migrated_data = existing.metadata.migrated_data;

            // Recompute idempotence: an unchanged result is not rewritten
            let mut probe = summary.clone();
            probe.metadata.last_calculated = existing.metadata.last_calculated;
            if probe == existing {
                return Ok(Some(existing));
            }
        }

        self.summaries.put(summary.clone()).await?;
        tracing::debug!(
            client_id = %client_id,
            period = %period.key(),
            total_co2e = summary.totals.co2e,
            entries = summary.metadata.entry_count,
            "Summary materialised"
        );
        Ok(Some(summary))
    }

    async fn compute(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<EmissionSummary, MaterialiseError> {
        let (from, to_exclusive) = period.bounds(self.timezone);
        let to = to_exclusive - Duration::nanoseconds(1);
        let entries = self.entries.client_entries_in_range(client_id, from, to).await?;

        let metadata = self.registry.metadata_for(client_id).await?;
        let allocations = self.registry.process_allocations(client_id).await?;

        let mut summary = EmissionSummary::empty(client_id, period);
        summary.summary_id = Uuid::new_v4();

        let mut shared_scopes: HashSet<String> = HashSet::new();
        let mut warnings: HashSet<String> = HashSet::new();

        for entry in &entries {
            if entry.processing_status != ProcessingStatus::Processed {
                continue;
            }
            let gases = fold_vector(entry);
            self.fold_axes(&mut summary, entry, &gases, &metadata);
            fold_process_view(
                &mut summary.process,
                entry,
                &gases,
                &metadata,
                &allocations,
                &mut shared_scopes,
                &mut warnings,
            );
        }

        summary.process.shared_scope_count = shared_scopes.len() as u64;
        summary.process.allocation_warnings = {
            let mut list: Vec<String> = warnings.into_iter().collect();
            list.sort();
            list
        };

        summary.trends = self.compute_trends(client_id, &summary, period).await?;
        summary.reduction = self.reductions.summarise(client_id, &period).await?;
        summary.metadata.last_calculated = Utc::now();
        Ok(summary)
    }

    fn fold_axes(
        &self,
        summary: &mut EmissionSummary,
        entry: &MeasurementEntry,
        gases: &GasVector,
        metadata: &NodeMetadataCache,
    ) {
        let meta = metadata.lookup(&entry.scope_identifier);
        let (category, activity, department, location, node) = match meta {
            Some(meta) => (
                meta.category_name.clone(),
                meta.activity.clone(),
                meta.department.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                meta.location.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                meta.node_label.clone(),
            ),
            None => {
                summary.metadata.unknown_scope_count += 1;
                (
                    UNKNOWN.to_string(),
                    UNKNOWN.to_string(),
                    UNKNOWN.to_string(),
                    UNKNOWN.to_string(),
                    entry.node_id.clone(),
                )
            }
        };

        summary.totals.fold(gases);
        summary.metadata.entry_count += 1;
        summary
            .by_scope
            .entry(entry.scope_type.as_str().to_string())
            .or_default()
            .fold(gases);

        let category_totals = summary.by_category.entry(category).or_default();
        category_totals.totals.fold(gases);
        category_totals
            .activities
            .entry(activity.clone())
            .or_default()
            .fold(gases);

        summary.by_activity.entry(activity).or_default().fold(gases);
        summary.by_node.entry(node).or_default().fold(gases);
        summary.by_department.entry(department).or_default().fold(gases);
        summary.by_location.entry(location).or_default().fold(gases);
        summary
            .by_input_type
            .entry(entry.input_type.as_str().to_string())
            .or_default()
            .fold(gases);
        summary
            .by_emission_factor
            .entry(entry.emission_factor.as_str().to_string())
            .or_default()
            .fold(gases);
    }

    async fn compute_trends(
        &self,
        client_id: &str,
        current: &EmissionSummary,
        period: Period,
    ) -> Result<Trends, MaterialiseError> {
        let Some(previous_period) = period.preceding() else {
            return Ok(Trends {
                total_co2e: trend(current.totals.co2e, 0.0),
                data_point_count: trend(current.totals.data_point_count as f64, 0.0),
                ..Trends::default()
            });
        };

        // Prefer the stored summary; fall back to a direct fold so trends
        // survive a cold start
        let (prev_total, prev_count, prev_scopes, prev_categories) =
            match self.summaries.get(client_id, &previous_period).await? {
                Some(prev) => (
                    prev.totals.co2e,
                    prev.totals.data_point_count,
                    prev.by_scope
                        .iter()
                        .map(|(k, v)| (k.clone(), v.co2e))
                        .collect::<HashMap<_, _>>(),
                    prev.by_category
                        .iter()
                        .map(|(k, v)| (k.clone(), v.totals.co2e))
                        .collect::<HashMap<_, _>>(),
                ),
                None => {
                    self.fold_basic(client_id, previous_period).await?
                }
            };

        let mut trends = Trends {
            total_co2e: trend(current.totals.co2e, prev_total),
            data_point_count: trend(
                current.totals.data_point_count as f64,
                prev_count as f64,
            ),
            ..Trends::default()
        };

        let scope_keys: HashSet<&String> =
            current.by_scope.keys().chain(prev_scopes.keys()).collect();
        for key in scope_keys {
            let now = current.by_scope.get(key).map(|a| a.co2e).unwrap_or(0.0);
            let before = prev_scopes.get(key).copied().unwrap_or(0.0);
            trends.by_scope.insert(key.clone(), trend(now, before));
        }

        let category_keys: HashSet<&String> = current
            .by_category
            .keys()
            .chain(prev_categories.keys())
            .collect();
        for key in category_keys {
            let now = current
                .by_category
                .get(key)
                .map(|c| c.totals.co2e)
                .unwrap_or(0.0);
            let before = prev_categories.get(key).copied().unwrap_or(0.0);
            trends.by_category.insert(key.clone(), trend(now, before));
        }

        Ok(trends)
    }

    async fn fold_basic(
        &self,
        client_id: &str,
        period: Period,
    ) -> Result<(f64, u64, HashMap<String, f64>, HashMap<String, f64>), MaterialiseError> {
        let (from, to_exclusive) = period.bounds(self.timezone);
        let to = to_exclusive - Duration::nanoseconds(1);
        let entries = self.entries.client_entries_in_range(client_id, from, to).await?;
        let metadata = self.registry.metadata_for(client_id).await?;

        let mut total = 0.0;
        let mut count = 0u64;
        let mut by_scope: HashMap<String, f64> = HashMap::new();
        let mut by_category: HashMap<String, f64> = HashMap::new();

        for entry in &entries {
            if entry.processing_status != ProcessingStatus::Processed {
                continue;
            }
            let co2e = entry.extract_co2e();
            total += co2e;
            count += 1;
            *by_scope
                .entry(entry.scope_type.as_str().to_string())
                .or_insert(0.0) += co2e;
            let category = metadata
                .lookup(&entry.scope_identifier)
                .map(|m| m.category_name.clone())
                .unwrap_or_else(|| UNKNOWN.to_string());
            *by_category.entry(category).or_insert(0.0) += co2e;
        }
        Ok((total, count, by_scope, by_category))
    }
}

/// The per-gas vector summarisation folds for one entry, honouring the
/// extraction preference order.
fn fold_vector(entry: &MeasurementEntry) -> GasVector {
    let mut gases = entry.extract_gases();
    gases.co2e = entry.extract_co2e();
    gases
}

fn fold_process_view(
    process: &mut ProcessEmissionSummary,
    entry: &MeasurementEntry,
    gases: &GasVector,
    metadata: &NodeMetadataCache,
    allocations: &HashMap<String, Vec<AllocationShare>>,
    shared_scopes: &mut HashSet<String>,
    warnings: &mut HashSet<String>,
) {
    // Resolve renames so historical identifiers hit the process chart
    let identifier = metadata
        .lookup(&entry.scope_identifier)
        .map(|m| m.scope_identifier.clone())
        .unwrap_or_else(|| entry.scope_identifier.clone());

    let Some(shares) = allocations.get(&identifier) else {
        // Scopes absent from the process chart are wholly unallocated
        process.unallocated.fold(gases);
        return;
    };

    let result = allocate(gases, shares);
    if result.is_shared {
        shared_scopes.insert(identifier.clone());
    }
    if let Some(warning) = result.warning {
        warnings.insert(format!("{}: {}", identifier, warning));
    }

    for share in result.shares {
        process.totals.fold(&share.allocated);
        process
            .by_node
            .entry(share.node_label)
            .or_default()
            .fold(&share.allocated);
    }
    process
        .by_scope
        .entry(identifier)
        .or_default()
        .fold(gases);
    if !result.unallocated.is_zero() {
        process.unallocated.fold(&result.unallocated);
    }
}
