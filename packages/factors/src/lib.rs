//! CarbonPlane: Emission-Factor Catalogue
//!
//! Read-mostly, versioned lookup of per-standard emission factors keyed by
//! `(standard, scope type, category, activity, fuel?, region?, unit)`.
//! Each factor carries per-gas values, a GWP table, and a citation.
//! A catalogue is immutable once built; a factor revision allocates a new
//! catalogue version instead of mutating in place.

pub mod catalogue;
pub mod gas;

pub use catalogue::{
    CatalogueBuilder, FactorCatalogue, FactorError, FactorKey, FactorQuery, FactorSet,
    FactorSource, FactorValues,
};
pub use gas::{CalculationTier, GasVector, GwpTable, ScopeType};
