//! Rename-tolerant scope merge applied on node update.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use carbonplane_factors::{CalculationTier, FactorSource, FactorValues, ScopeType};

use crate::scope::{CollectionFrequency, InputType, ScopeDescriptor};
use crate::types::ScopeUid;

/// A scope as submitted by a caller updating a node.
///
/// Optional fields overlay the matched existing scope; absent ones keep
/// the existing value (allocation defaults to 100 for brand-new scopes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingScope {
    pub scope_uid: Option<ScopeUid>,
    pub scope_identifier: String,
    /// Caller-supplied hint for rename resolution
    pub previous_scope_identifier: Option<String>,
    pub scope_type: ScopeType,
    pub category_name: String,
    pub activity: String,
    pub calculation_model: CalculationTier,
    pub input_type: InputType,
    pub api_endpoint: Option<String>,
    pub iot_device_id: Option<String>,
    pub emission_factor: FactorSource,
    pub emission_factor_values: Option<FactorValues>,
    pub fuel: Option<String>,
    pub region: Option<String>,
    pub uad_pct: Option<f64>,
    pub uef_pct: Option<f64>,
    pub allocation_pct: Option<Decimal>,
    pub collection_frequency: Option<CollectionFrequency>,
}

impl IncomingScope {
    /// Build an incoming scope from a full descriptor.
    pub fn from_descriptor(scope: &ScopeDescriptor) -> Self {
        Self {
            scope_uid: Some(scope.scope_uid.clone()),
            scope_identifier: scope.scope_identifier.clone(),
            previous_scope_identifier: None,
            scope_type: scope.scope_type,
            category_name: scope.category_name.clone(),
            activity: scope.activity.clone(),
            calculation_model: scope.calculation_model,
            input_type: scope.input_type,
            api_endpoint: scope.api_endpoint.clone(),
            iot_device_id: scope.iot_device_id.clone(),
            emission_factor: scope.emission_factor,
            emission_factor_values: scope.emission_factor_values,
            fuel: scope.fuel.clone(),
            region: scope.region.clone(),
            uad_pct: Some(scope.uad_pct),
            uef_pct: Some(scope.uef_pct),
            allocation_pct: Some(scope.allocation_pct),
            collection_frequency: scope.collection_frequency,
        }
    }

    pub fn renamed_from(mut self, previous_identifier: impl Into<String>) -> Self {
        self.previous_scope_identifier = Some(previous_identifier.into());
        self
    }
}

/// Outcome of a merge: the resulting scope list plus the renames that
/// happened, each as `(former identifier, stable uid)`.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub scopes: Vec<ScopeDescriptor>,
    pub renames: Vec<(String, ScopeUid)>,
}

/// Merge errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MergeError {
    #[error("merge would produce duplicate scope identifier {identifier}")]
    DuplicateIdentifier { identifier: String },
}

/// Merge incoming scopes into a node's previous scope list.
///
/// Each incoming scope resolves its existing counterpart by, in order:
/// stable uid, current identifier, caller-supplied previous identifier,
/// then a heuristic `(scope type, category, activity)` match among
/// still-unconsumed candidates. Matched scopes merge by shallow overlay;
/// unmatched incoming scopes are created; untouched previous scopes are
/// carried forward in their original order.
pub fn merge_scopes(
    previous: &[ScopeDescriptor],
    incoming: Vec<IncomingScope>,
) -> Result<MergeResult, MergeError> {
    let mut consumed = vec![false; previous.len()];
    let mut scopes = Vec::with_capacity(previous.len().max(incoming.len()));
    let mut renames = Vec::new();

    for inc in incoming {
        let matched = find_counterpart(previous, &consumed, &inc);

        match matched {
            Some(idx) => {
                consumed[idx] = true;
                let existing = &previous[idx];
                if existing.scope_identifier != inc.scope_identifier {
                    renames.push((existing.scope_identifier.clone(), existing.scope_uid.clone()));
                }
                scopes.push(overlay(existing, inc));
            }
            None => scopes.push(materialise(inc)),
        }
    }

    for (idx, existing) in previous.iter().enumerate() {
        if !consumed[idx] {
            scopes.push(existing.clone());
        }
    }

    let mut seen = HashSet::new();
    for scope in &scopes {
        if !seen.insert(scope.scope_identifier.as_str()) {
            return Err(MergeError::DuplicateIdentifier {
                identifier: scope.scope_identifier.clone(),
            });
        }
    }

    Ok(MergeResult { scopes, renames })
}

fn find_counterpart(
    previous: &[ScopeDescriptor],
    consumed: &[bool],
    inc: &IncomingScope,
) -> Option<usize> {
    let free = |i: &usize| !consumed[*i];

    if let Some(uid) = inc.scope_uid.as_ref().filter(|u| !u.is_empty()) {
        if let Some(idx) = (0..previous.len())
            .filter(free)
            .find(|&i| &previous[i].scope_uid == uid)
        {
            return Some(idx);
        }
    }

    if let Some(idx) = (0..previous.len())
        .filter(free)
        .find(|&i| previous[i].scope_identifier == inc.scope_identifier)
    {
        return Some(idx);
    }

    if let Some(prev_id) = inc.previous_scope_identifier.as_deref() {
        if let Some(idx) = (0..previous.len())
            .filter(free)
            .find(|&i| previous[i].scope_identifier == prev_id)
        {
            return Some(idx);
        }
    }

    (0..previous.len()).filter(free).find(|&i| {
        let p = &previous[i];
        p.scope_type == inc.scope_type
            && p.category_name == inc.category_name
            && p.activity == inc.activity
    })
}

fn overlay(existing: &ScopeDescriptor, inc: IncomingScope) -> ScopeDescriptor {
    ScopeDescriptor {
        scope_uid: inc
            .scope_uid
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| existing.scope_uid.clone()),
        scope_identifier: inc.scope_identifier,
        scope_type: inc.scope_type,
        category_name: inc.category_name,
        activity: inc.activity,
        calculation_model: inc.calculation_model,
        input_type: inc.input_type,
        api_endpoint: inc.api_endpoint.or_else(|| existing.api_endpoint.clone()),
        iot_device_id: inc.iot_device_id.or_else(|| existing.iot_device_id.clone()),
        emission_factor: inc.emission_factor,
        emission_factor_values: inc.emission_factor_values.or(existing.emission_factor_values),
        fuel: inc.fuel.or_else(|| existing.fuel.clone()),
        region: inc.region.or_else(|| existing.region.clone()),
        uad_pct: inc.uad_pct.unwrap_or(existing.uad_pct),
        uef_pct: inc.uef_pct.unwrap_or(existing.uef_pct),
        allocation_pct: inc.allocation_pct.unwrap_or(existing.allocation_pct),
        collection_frequency: inc.collection_frequency.or(existing.collection_frequency),
    }
}

fn materialise(inc: IncomingScope) -> ScopeDescriptor {
    ScopeDescriptor {
        scope_uid: inc
            .scope_uid
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        scope_identifier: inc.scope_identifier,
        scope_type: inc.scope_type,
        category_name: inc.category_name,
        activity: inc.activity,
        calculation_model: inc.calculation_model,
        input_type: inc.input_type,
        api_endpoint: inc.api_endpoint,
        iot_device_id: inc.iot_device_id,
        emission_factor: inc.emission_factor,
        emission_factor_values: inc.emission_factor_values,
        fuel: inc.fuel,
        region: inc.region,
        uad_pct: inc.uad_pct.unwrap_or(0.0),
        uef_pct: inc.uef_pct.unwrap_or(0.0),
        allocation_pct: inc.allocation_pct.unwrap_or(dec!(100)),
        collection_frequency: inc.collection_frequency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(identifier: &str, uid: &str) -> ScopeDescriptor {
        let mut scope = ScopeDescriptor::new(
            identifier,
            ScopeType::Scope1,
            "stationary-combustion",
            "fuel-combustion",
        )
        .with_uncertainty(5.0, 3.0);
        scope.scope_uid = uid.to_string();
        scope
    }

    #[test]
    fn test_match_by_uid_survives_rename() {
        let previous = vec![existing("SCOPE_A", "uid-1")];
        let mut inc = IncomingScope::from_descriptor(&previous[0]);
        inc.scope_identifier = "SCOPE_A_NEW".to_string();

        let result = merge_scopes(&previous, vec![inc]).unwrap();
        assert_eq!(result.scopes.len(), 1);
        assert_eq!(result.scopes[0].scope_uid, "uid-1");
        assert_eq!(result.scopes[0].scope_identifier, "SCOPE_A_NEW");
        assert_eq!(result.renames, vec![("SCOPE_A".to_string(), "uid-1".to_string())]);
    }

    #[test]
    fn test_match_by_previous_identifier_hint() {
        let previous = vec![existing("OLD_NAME", "uid-1")];
        let mut inc = IncomingScope::from_descriptor(&previous[0]);
        inc.scope_uid = None;
        inc.scope_identifier = "NEW_NAME".to_string();
        inc.category_name = "mobile-combustion".to_string(); // heuristic must not be needed
        inc = inc.renamed_from("OLD_NAME");

        let result = merge_scopes(&previous, vec![inc]).unwrap();
        assert_eq!(result.scopes[0].scope_uid, "uid-1");
        assert_eq!(result.scopes[0].scope_identifier, "NEW_NAME");
    }

    #[test]
    fn test_heuristic_match_on_shape() {
        let previous = vec![existing("A", "uid-1")];
        let mut inc = IncomingScope::from_descriptor(&previous[0]);
        inc.scope_uid = None;
        inc.scope_identifier = "B".to_string();

        let result = merge_scopes(&previous, vec![inc]).unwrap();
        // Same (scope type, category, activity) binds to the old scope
        assert_eq!(result.scopes.len(), 1);
        assert_eq!(result.scopes[0].scope_uid, "uid-1");
    }

    #[test]
    fn test_untouched_scopes_carry_forward() {
        let previous = vec![existing("A", "uid-1"), existing("B", "uid-2")];
        let mut inc = IncomingScope::from_descriptor(&previous[0]);
        inc.uad_pct = Some(9.0);

        let result = merge_scopes(&previous, vec![inc]).unwrap();
        assert_eq!(result.scopes.len(), 2);
        assert_eq!(result.scopes[0].uad_pct, 9.0);
        assert_eq!(result.scopes[1].scope_identifier, "B");
        assert_eq!(result.scopes[1].uad_pct, 5.0);
    }

    #[test]
    fn test_overlay_keeps_absent_fields() {
        let previous = vec![existing("A", "uid-1")];
        let mut inc = IncomingScope::from_descriptor(&previous[0]);
        inc.uad_pct = None;
        inc.uef_pct = None;
        inc.allocation_pct = None;

        let result = merge_scopes(&previous, vec![inc]).unwrap();
        assert_eq!(result.scopes[0].uad_pct, 5.0);
        assert_eq!(result.scopes[0].uef_pct, 3.0);
        assert_eq!(result.scopes[0].allocation_pct, dec!(100));
    }

    #[test]
    fn test_new_scope_gets_uid_and_default_allocation() {
        let inc = IncomingScope::from_descriptor(&existing("NEW", ""));
        let mut inc = inc;
        inc.scope_uid = None;
        inc.allocation_pct = None;

        let result = merge_scopes(&[], vec![inc]).unwrap();
        assert!(!result.scopes[0].scope_uid.is_empty());
        assert_eq!(result.scopes[0].allocation_pct, dec!(100));
    }

    #[test]
    fn test_duplicate_resulting_identifier_rejected() {
        let previous = vec![existing("A", "uid-1"), existing("B", "uid-2")];
        let mut inc = IncomingScope::from_descriptor(&previous[1]);
        // Rename B to A while A is untouched -> duplicate
        inc.scope_identifier = "A".to_string();

        assert!(matches!(
            merge_scopes(&previous, vec![inc]),
            Err(MergeError::DuplicateIdentifier { .. })
        ));
    }
}
