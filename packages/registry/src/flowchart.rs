//! Flowchart model: nodes, edges, and their scope descriptors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::scope::ScopeDescriptor;
use crate::types::{ClientId, NodeId, ScopeUid};

/// Which chart a flowchart is.
///
/// The organisation chart owns the measurement streams; the process chart
/// references scopes (by identifier) and declares allocation percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Organisation,
    Process,
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: NodeId,
    pub to: NodeId,
}

/// A node in a flowchart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub node_id: NodeId,
    pub label: String,
    pub department: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Reference to the person responsible for this node
    pub assigned_head: Option<String>,
    /// Ordered scope descriptors
    pub scopes: Vec<ScopeDescriptor>,
}

impl FlowNode {
    pub fn new(node_id: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            label: label.into(),
            department: None,
            location: None,
            latitude: None,
            longitude: None,
            assigned_head: None,
            scopes: Vec::new(),
        }
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_scope(mut self, scope: ScopeDescriptor) -> Self {
        self.scopes.push(scope);
        self
    }
}

/// A per-client, versioned, soft-deletable flowchart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flowchart {
    pub client_id: ClientId,
    pub kind: ChartKind,
    /// Monotone, bumped on every update
    pub version: u64,
    pub deleted: bool,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    /// Former scope identifiers mapped to their stable uid, accumulated
    /// across renames so historical entries keep resolving
    pub identifier_aliases: HashMap<String, ScopeUid>,
    pub updated_at: DateTime<Utc>,
}

impl Flowchart {
    pub fn new(client_id: impl Into<ClientId>, kind: ChartKind) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
            version: 0,
            deleted: false,
            nodes: Vec::new(),
            edges: Vec::new(),
            identifier_aliases: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(FlowEdge {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut FlowNode> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    /// Find a scope descriptor by its current identifier.
    pub fn scope(&self, scope_identifier: &str) -> Option<(&FlowNode, &ScopeDescriptor)> {
        self.nodes.iter().find_map(|n| {
            n.scopes
                .iter()
                .find(|s| s.scope_identifier == scope_identifier)
                .map(|s| (n, s))
        })
    }

    /// Structural validation: edges reference existing nodes and scope
    /// identifiers are unique within each node.
    pub fn validate(&self) -> Result<(), FlowchartViolation> {
        let node_ids: HashSet<&str> = self.nodes.iter().map(|n| n.node_id.as_str()).collect();

        for edge in &self.edges {
            if !node_ids.contains(edge.from.as_str()) {
                return Err(FlowchartViolation::DanglingEdge {
                    node_id: edge.from.clone(),
                });
            }
            if !node_ids.contains(edge.to.as_str()) {
                return Err(FlowchartViolation::DanglingEdge {
                    node_id: edge.to.clone(),
                });
            }
        }

        for node in &self.nodes {
            let mut seen = HashSet::new();
            for scope in &node.scopes {
                if !seen.insert(scope.scope_identifier.as_str()) {
                    return Err(FlowchartViolation::DuplicateScopeIdentifier {
                        node_id: node.node_id.clone(),
                        identifier: scope.scope_identifier.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Per-identifier allocation totals across the whole chart.
    ///
    /// Only meaningful for process charts, where a scope may appear in
    /// several nodes. The sum may exceed 100: that is stored with a
    /// warning, never rejected.
    pub fn allocation_totals(&self) -> HashMap<String, Decimal> {
        let mut totals: HashMap<String, Decimal> = HashMap::new();
        for node in &self.nodes {
            for scope in &node.scopes {
                *totals
                    .entry(scope.scope_identifier.clone())
                    .or_insert(dec!(0)) += scope.allocation_pct;
            }
        }
        totals
    }

    /// All (node, scope) references for one scope identifier.
    pub fn scope_references(&self, scope_identifier: &str) -> Vec<(&FlowNode, &ScopeDescriptor)> {
        self.nodes
            .iter()
            .flat_map(|n| {
                n.scopes
                    .iter()
                    .filter(|s| s.scope_identifier == scope_identifier)
                    .map(move |s| (n, s))
            })
            .collect()
    }

    /// Drop aliases shadowed by a current identifier and record new ones.
    pub fn record_alias(&mut self, old_identifier: String, uid: ScopeUid) {
        self.identifier_aliases.insert(old_identifier, uid);
        let current: HashSet<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.scopes.iter().map(|s| s.scope_identifier.clone()))
            .collect();
        self.identifier_aliases
            .retain(|alias, _| !current.contains(alias));
    }
}

/// Structural invariant violations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowchartViolation {
    #[error("edge references missing node {node_id}")]
    DanglingEdge { node_id: NodeId },

    #[error("scope identifier {identifier} duplicated within node {node_id}")]
    DuplicateScopeIdentifier { node_id: NodeId, identifier: String },
}
