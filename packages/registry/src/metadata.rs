//! Node-metadata cache: the read-mostly lookup the summary materialiser
//! folds scope identifiers through. Rebuilt whenever the flowchart version
//! changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use carbonplane_factors::{FactorSource, ScopeType};

use crate::flowchart::Flowchart;
use crate::scope::InputType;
use crate::types::{NodeId, ScopeUid};

/// Dimensional metadata for one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeMeta {
    pub scope_uid: ScopeUid,
    /// Current identifier (post-rename)
    pub scope_identifier: String,
    pub scope_type: ScopeType,
    pub category_name: String,
    pub activity: String,
    pub input_type: InputType,
    pub emission_factor: FactorSource,
    pub department: Option<String>,
    pub location: Option<String>,
    pub node_id: NodeId,
    pub node_label: String,
}

/// Cache of `scope identifier -> metadata` for one flowchart version.
///
/// Lookups also resolve former identifiers through the chart's alias map,
/// so historical entries keep rolling up under a renamed scope.
#[derive(Debug, Clone)]
pub struct NodeMetadataCache {
    version: u64,
    by_identifier: HashMap<String, ScopeMeta>,
    by_uid: HashMap<ScopeUid, String>,
    aliases: HashMap<String, ScopeUid>,
}

impl NodeMetadataCache {
    /// Build the cache from a flowchart.
    pub fn build(chart: &Flowchart) -> Self {
        let mut by_identifier = HashMap::new();
        let mut by_uid = HashMap::new();

        for node in &chart.nodes {
            for scope in &node.scopes {
                let meta = ScopeMeta {
                    scope_uid: scope.scope_uid.clone(),
                    scope_identifier: scope.scope_identifier.clone(),
                    scope_type: scope.scope_type,
                    category_name: scope.category_name.clone(),
                    activity: scope.activity.clone(),
                    input_type: scope.input_type,
                    emission_factor: scope.emission_factor,
                    department: node.department.clone(),
                    location: node.location.clone(),
                    node_id: node.node_id.clone(),
                    node_label: node.label.clone(),
                };
                by_uid.insert(scope.scope_uid.clone(), scope.scope_identifier.clone());
                by_identifier.insert(scope.scope_identifier.clone(), meta);
            }
        }

        Self {
            version: chart.version,
            by_identifier,
            by_uid,
            aliases: chart.identifier_aliases.clone(),
        }
    }

    /// An empty cache for clients without an active flowchart.
    pub fn empty() -> Self {
        Self {
            version: 0,
            by_identifier: HashMap::new(),
            by_uid: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Flowchart version this cache was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.by_identifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }

    /// Look up a scope by identifier, resolving renames through the alias
    /// map. Returns `None` for identifiers unknown to the active chart;
    /// the materialiser then falls back to "Unknown" dimensions.
    pub fn lookup(&self, scope_identifier: &str) -> Option<&ScopeMeta> {
        if let Some(meta) = self.by_identifier.get(scope_identifier) {
            return Some(meta);
        }
        let uid = self.aliases.get(scope_identifier)?;
        let current = self.by_uid.get(uid)?;
        self.by_identifier.get(current)
    }

    /// All current scope identifiers.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.by_identifier.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowchart::{ChartKind, FlowNode};
    use crate::scope::ScopeDescriptor;

    #[test]
    fn test_lookup_resolves_alias_to_renamed_scope() {
        let mut scope = ScopeDescriptor::new(
            "SCOPE_A_NEW",
            ScopeType::Scope1,
            "stationary-combustion",
            "fuel-combustion",
        );
        scope.scope_uid = "uid-1".to_string();

        let mut chart = Flowchart::new("acme", ChartKind::Organisation)
            .with_node(FlowNode::new("n1", "Boiler").with_scope(scope));
        chart.record_alias("SCOPE_A".to_string(), "uid-1".to_string());

        let cache = NodeMetadataCache::build(&chart);
        let meta = cache.lookup("SCOPE_A").expect("alias resolves");
        assert_eq!(meta.scope_identifier, "SCOPE_A_NEW");
        assert_eq!(meta.node_label, "Boiler");
    }

    #[test]
    fn test_unknown_identifier_is_none() {
        let cache = NodeMetadataCache::empty();
        assert!(cache.lookup("GHOST").is_none());
    }
}
