//! Allocation engine: partition a raw emission vector across process
//! nodes by their declared percentages.
//!
//! Allocation never mutates the raw emission; it only splits it for the
//! process-view summary. The residual `(100 - sum) / 100` share is
//! tracked as unallocated.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use carbonplane_factors::GasVector;
use carbonplane_registry::AllocationShare;

/// Threshold below which a residual is considered fully allocated.
const UNALLOCATED_WARN_PCT: Decimal = dec!(0.01);

/// One node's allocated share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAllocation {
    pub node_id: String,
    pub node_label: String,
    pub pct: Decimal,
    pub allocated: GasVector,
}

/// Result of allocating one raw vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub shares: Vec<NodeAllocation>,
    /// Residual vector not attributed to any node
    pub unallocated: GasVector,
    /// `100 - total`, clamped at 0, rounded to 2 decimals
    pub unallocated_pct: Decimal,
    pub total_pct: Decimal,
    /// Scope referenced by more than one process node
    pub is_shared: bool,
    pub warning: Option<String>,
}

/// Split `raw` across the given process-node shares.
pub fn allocate(raw: &GasVector, shares: &[AllocationShare]) -> AllocationResult {
    let total_pct: Decimal = shares.iter().map(|s| s.pct).sum();
    let unallocated_pct = (dec!(100) - total_pct).max(dec!(0)).round_dp(2);

    let node_shares: Vec<NodeAllocation> = shares
        .iter()
        .map(|share| NodeAllocation {
            node_id: share.node_id.clone(),
            node_label: share.node_label.clone(),
            pct: share.pct,
            allocated: raw.scale(share.pct.to_f64().unwrap_or(0.0) / 100.0),
        })
        .collect();

    let unallocated = raw.scale(unallocated_pct.to_f64().unwrap_or(0.0) / 100.0);

    let warning = if total_pct > dec!(100) {
        Some(format!(
            "allocation exceeds 100% (total {}%); residual clamped to 0",
            total_pct
        ))
    } else if unallocated_pct >= UNALLOCATED_WARN_PCT && !shares.is_empty() {
        Some(format!(
            "{}% of emissions unallocated across process nodes",
            unallocated_pct
        ))
    } else {
        None
    };

    AllocationResult {
        shares: node_shares,
        unallocated,
        unallocated_pct,
        total_pct,
        is_shared: shares.len() > 1,
        warning,
    }
}
