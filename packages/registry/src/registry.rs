//! Registry operations over flowcharts: upsert, soft delete, restore,
//! node updates with scope merge, head assignment, and allocation edits.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use carbonplane_factors::{FactorCatalogue, FactorError};

use crate::flowchart::{ChartKind, Flowchart, FlowchartViolation};
use crate::merge::{merge_scopes, IncomingScope, MergeError};
use crate::metadata::NodeMetadataCache;
use crate::store::{FlowchartStore, StoreError};
use crate::types::{ClientId, NodeId};

/// Result of a flowchart or node save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// New chart version
    pub version: u64,
    /// Non-fatal findings, e.g. allocation sums above 100%
    pub warnings: Vec<String>,
}

/// Patch applied to a node; absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub label: Option<String>,
    pub department: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Full incoming scope list; merged against the node's previous scopes
    pub scopes: Option<Vec<IncomingScope>>,
}

/// One node's share of a scope's allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationShare {
    pub node_id: NodeId,
    pub node_label: String,
    pub pct: Decimal,
}

/// Result of an allocation edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationOutcome {
    pub scope_identifier: String,
    /// Sum of percentages across all referencing nodes
    pub total_pct: Decimal,
    /// `100 - total`, clamped at 0, rounded to 2 decimals
    pub unallocated_pct: Decimal,
    /// Scope appears in more than one process node
    pub is_shared: bool,
    pub warning: Option<String>,
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Structure(#[from] FlowchartViolation),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Factor detail missing or unresolvable for the chosen standard
    #[error(transparent)]
    Factor(#[from] FactorError),

    #[error("node {node_id} not found")]
    UnknownNode { node_id: NodeId },

    #[error("scope {scope_identifier} not found in {node_id}")]
    UnknownScope {
        node_id: NodeId,
        scope_identifier: String,
    },

    #[error("client {client_id} has no active {kind:?} flowchart")]
    NoActiveFlowchart { client_id: ClientId, kind: ChartKind },

    #[error("client {client_id} already has an active {kind:?} flowchart; delete it before restoring")]
    ActiveFlowchartExists { client_id: ClientId, kind: ChartKind },

    #[error("client {client_id} has no soft-deleted {kind:?} flowchart to restore")]
    NothingToRestore { client_id: ClientId, kind: ChartKind },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// The flowchart & scope registry.
pub struct FlowchartRegistry {
    store: Arc<dyn FlowchartStore>,
    catalogue: Arc<FactorCatalogue>,
    metadata: RwLock<HashMap<ClientId, Arc<NodeMetadataCache>>>,
}

impl FlowchartRegistry {
    pub fn new(store: Arc<dyn FlowchartStore>, catalogue: Arc<FactorCatalogue>) -> Self {
        Self {
            store,
            catalogue,
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Save a whole flowchart, bumping its version.
    ///
    /// Structure and factor resolvability are validated; allocation sums
    /// above 100% are stored with a warning (never rejected). Aliases
    /// accumulated on the previous version are carried forward.
    pub async fn upsert_flowchart(&self, mut chart: Flowchart) -> Result<UpsertOutcome, RegistryError> {
        chart.validate()?;
        self.validate_factors(&chart)?;

        let existing = self.store.get_active(&chart.client_id, chart.kind).await?;
        if let Some(previous) = &existing {
            for (alias, uid) in &previous.identifier_aliases {
                chart
                    .identifier_aliases
                    .entry(alias.clone())
                    .or_insert_with(|| uid.clone());
            }
            chart.version = previous.version + 1;
        } else {
            chart.version += 1;
        }
        chart.deleted = false;
        chart.updated_at = chrono::Utc::now();

        let warnings = allocation_warnings(&chart);
        for warning in &warnings {
            tracing::warn!(client_id = %chart.client_id, "{}", warning);
        }

        let version = chart.version;
        let client_id = chart.client_id.clone();
        self.store.put_active(chart).await?;
        self.invalidate_metadata(&client_id);

        tracing::info!(client_id = %client_id, version = version, "Flowchart saved");
        Ok(UpsertOutcome { version, warnings })
    }

    /// The active flowchart, if any.
    pub async fn get_flowchart(
        &self,
        client_id: &str,
        kind: ChartKind,
    ) -> Result<Option<Flowchart>, RegistryError> {
        Ok(self.store.get_active(client_id, kind).await?)
    }

    /// Soft-delete the active flowchart.
    pub async fn soft_delete(&self, client_id: &str, kind: ChartKind) -> Result<(), RegistryError> {
        let deleted = self.store.soft_delete(client_id, kind).await?;
        if deleted.is_none() {
            return Err(RegistryError::NoActiveFlowchart {
                client_id: client_id.to_string(),
                kind,
            });
        }
        self.invalidate_metadata(client_id);
        tracing::info!(client_id = %client_id, ?kind, "Flowchart soft-deleted");
        Ok(())
    }

    /// Restore the most recently soft-deleted flowchart.
    ///
    /// Restorable only while no active chart exists.
    pub async fn restore(&self, client_id: &str, kind: ChartKind) -> Result<Flowchart, RegistryError> {
        if self.store.get_active(client_id, kind).await?.is_some() {
            return Err(RegistryError::ActiveFlowchartExists {
                client_id: client_id.to_string(),
                kind,
            });
        }

        let mut chart =
            self.store
                .pop_deleted(client_id, kind)
                .await?
                .ok_or_else(|| RegistryError::NothingToRestore {
                    client_id: client_id.to_string(),
                    kind,
                })?;
        chart.deleted = false;
        chart.version += 1;
        chart.updated_at = chrono::Utc::now();

        self.store.put_active(chart.clone()).await?;
        self.invalidate_metadata(client_id);
        tracing::info!(client_id = %client_id, ?kind, version = chart.version, "Flowchart restored");
        Ok(chart)
    }

    /// Remove a node and every edge touching it.
    pub async fn delete_node(
        &self,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
    ) -> Result<UpsertOutcome, RegistryError> {
        self.mutate(client_id, kind, |chart| {
            if chart.node(node_id).is_none() {
                return Err(RegistryError::UnknownNode {
                    node_id: node_id.to_string(),
                });
            }
            chart.nodes.retain(|n| n.node_id != node_id);
            chart
                .edges
                .retain(|e| e.from != node_id && e.to != node_id);
            Ok(())
        })
        .await
    }

    /// Update a node's attributes and merge its scope list.
    pub async fn update_node(
        &self,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
        update: NodeUpdate,
    ) -> Result<UpsertOutcome, RegistryError> {
        let outcome = self
            .mutate(client_id, kind, |chart| {
                let node = chart.node_mut(node_id).ok_or_else(|| RegistryError::UnknownNode {
                    node_id: node_id.to_string(),
                })?;

                if let Some(label) = update.label.clone() {
                    node.label = label;
                }
                if let Some(department) = update.department.clone() {
                    node.department = Some(department);
                }
                if let Some(location) = update.location.clone() {
                    node.location = Some(location);
                }
                if let Some(latitude) = update.latitude {
                    node.latitude = Some(latitude);
                }
                if let Some(longitude) = update.longitude {
                    node.longitude = Some(longitude);
                }

                if let Some(incoming) = update.scopes.clone() {
                    let merged = merge_scopes(&node.scopes, incoming)?;
                    node.scopes = merged.scopes;
                    for (old_identifier, uid) in merged.renames {
                        tracing::debug!(
                            client_id = %chart.client_id,
                            old = %old_identifier,
                            uid = %uid,
                            "Scope renamed"
                        );
                        chart.record_alias(old_identifier, uid);
                    }
                }
                Ok(())
            })
            .await?;
        Ok(outcome)
    }

    /// Assign or clear the responsible head on a node.
    pub async fn assign_head(
        &self,
        client_id: &str,
        kind: ChartKind,
        node_id: &str,
        head: Option<String>,
    ) -> Result<UpsertOutcome, RegistryError> {
        self.mutate(client_id, kind, |chart| {
            let node = chart.node_mut(node_id).ok_or_else(|| RegistryError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
            node.assigned_head = head.clone();
            Ok(())
        })
        .await
    }

    /// Set the allocation percentage of a scope within one process node.
    pub async fn set_allocation(
        &self,
        client_id: &str,
        node_id: &str,
        scope_identifier: &str,
        pct: Decimal,
    ) -> Result<AllocationOutcome, RegistryError> {
        let mut outcome = None;
        self.mutate(client_id, ChartKind::Process, |chart| {
            let node = chart.node_mut(node_id).ok_or_else(|| RegistryError::UnknownNode {
                node_id: node_id.to_string(),
            })?;
            let scope = node
                .scopes
                .iter_mut()
                .find(|s| s.scope_identifier == scope_identifier)
                .ok_or_else(|| RegistryError::UnknownScope {
                    node_id: node_id.to_string(),
                    scope_identifier: scope_identifier.to_string(),
                })?;
            scope.allocation_pct = pct;

            let total: Decimal = chart
                .allocation_totals()
                .get(scope_identifier)
                .copied()
                .unwrap_or(dec!(0));
            let references = chart.scope_references(scope_identifier).len();
            let warning = if total > dec!(100) {
                Some(format!(
                    "allocation for {} totals {}% (exceeds 100%)",
                    scope_identifier, total
                ))
            } else {
                None
            };
            if let Some(w) = &warning {
                tracing::warn!(client_id = %chart.client_id, "{}", w);
            }

            outcome = Some(AllocationOutcome {
                scope_identifier: scope_identifier.to_string(),
                total_pct: total,
                unallocated_pct: (dec!(100) - total).max(dec!(0)).round_dp(2),
                is_shared: references > 1,
                warning,
            });
            Ok(())
        })
        .await?;

        Ok(outcome.expect("set_allocation outcome populated on success"))
    }

    /// Per-scope allocation shares declared by the active process chart.
    pub async fn process_allocations(
        &self,
        client_id: &str,
    ) -> Result<HashMap<String, Vec<AllocationShare>>, RegistryError> {
        let Some(chart) = self.store.get_active(client_id, ChartKind::Process).await? else {
            return Ok(HashMap::new());
        };

        let mut shares: HashMap<String, Vec<AllocationShare>> = HashMap::new();
        for node in &chart.nodes {
            for scope in &node.scopes {
                shares
                    .entry(scope.scope_identifier.clone())
                    .or_default()
                    .push(AllocationShare {
                        node_id: node.node_id.clone(),
                        node_label: node.label.clone(),
                        pct: scope.allocation_pct,
                    });
            }
        }
        Ok(shares)
    }

    /// Metadata cache for a client's active organisation chart.
    ///
    /// Cached per client and rebuilt when the chart version moves.
    pub async fn metadata_for(&self, client_id: &str) -> Result<Arc<NodeMetadataCache>, RegistryError> {
        let chart = self
            .store
            .get_active(client_id, ChartKind::Organisation)
            .await?;

        let Some(chart) = chart else {
            return Ok(Arc::new(NodeMetadataCache::empty()));
        };

        {
            let cached = self.metadata.read();
            if let Some(cache) = cached.get(client_id) {
                if cache.version() == chart.version {
                    return Ok(Arc::clone(cache));
                }
            }
        }

        let rebuilt = Arc::new(NodeMetadataCache::build(&chart));
        self.metadata
            .write()
            .insert(client_id.to_string(), Arc::clone(&rebuilt));
        tracing::debug!(
            client_id = %client_id,
            version = chart.version,
            scopes = rebuilt.len(),
            "Node metadata cache rebuilt"
        );
        Ok(rebuilt)
    }

    async fn mutate<F>(
        &self,
        client_id: &str,
        kind: ChartKind,
        apply: F,
    ) -> Result<UpsertOutcome, RegistryError>
    where
        F: FnOnce(&mut Flowchart) -> Result<(), RegistryError>,
    {
        let mut chart = self
            .store
            .get_active(client_id, kind)
            .await?
            .ok_or_else(|| RegistryError::NoActiveFlowchart {
                client_id: client_id.to_string(),
                kind,
            })?;

        apply(&mut chart)?;
        chart.validate()?;
        self.validate_factors(&chart)?;
        chart.version += 1;
        chart.updated_at = chrono::Utc::now();

        let warnings = allocation_warnings(&chart);
        let version = chart.version;
        self.store.put_active(chart).await?;
        self.invalidate_metadata(client_id);
        Ok(UpsertOutcome { version, warnings })
    }

    fn validate_factors(&self, chart: &Flowchart) -> Result<(), RegistryError> {
        for node in &chart.nodes {
            for scope in &node.scopes {
                self.catalogue
                    .resolve(&scope.factor_query(), chrono::Utc::now())?;
            }
        }
        Ok(())
    }

    fn invalidate_metadata(&self, client_id: &str) {
        self.metadata.write().remove(client_id);
    }
}

fn allocation_warnings(chart: &Flowchart) -> Vec<String> {
    if chart.kind != ChartKind::Process {
        return Vec::new();
    }
    let mut warnings: Vec<String> = chart
        .allocation_totals()
        .into_iter()
        .filter(|(_, total)| *total > dec!(100))
        .map(|(identifier, total)| {
            format!("allocation for {} totals {}% (exceeds 100%)", identifier, total)
        })
        .collect();
    warnings.sort();
    warnings
}
