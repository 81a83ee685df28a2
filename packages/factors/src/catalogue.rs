//! Factor catalogue: keyed lookup with time-keyed country grids and
//! inline custom factors.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::gas::{GasVector, GwpTable, ScopeType};

/// Emission-factor standard a scope is configured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorSource {
    #[serde(rename = "IPCC")]
    Ipcc,
    #[serde(rename = "DEFRA")]
    Defra,
    #[serde(rename = "EPA")]
    Epa,
    #[serde(rename = "EmissionFactorHub")]
    EmissionFactorHub,
    /// National grid factors, published per year
    Country,
    /// Factor values supplied inline on the scope descriptor
    Custom,
}

impl FactorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ipcc => "IPCC",
            Self::Defra => "DEFRA",
            Self::Epa => "EPA",
            Self::EmissionFactorHub => "EmissionFactorHub",
            Self::Country => "Country",
            Self::Custom => "Custom",
        }
    }
}

impl std::fmt::Display for FactorSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-gas factor values, each per activity unit.
///
/// Custom factors must supply at least one of the four values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorValues {
    pub co2_per_unit: Option<f64>,
    pub ch4_per_unit: Option<f64>,
    pub n2o_per_unit: Option<f64>,
    pub co2e_per_unit: Option<f64>,
}

impl FactorValues {
    /// A CO2e-only factor.
    pub fn co2e(rate: f64) -> Self {
        Self {
            co2e_per_unit: Some(rate),
            ..Self::default()
        }
    }

    /// True when at least one gas value is present.
    pub fn is_usable(&self) -> bool {
        self.co2_per_unit.is_some()
            || self.ch4_per_unit.is_some()
            || self.n2o_per_unit.is_some()
            || self.co2e_per_unit.is_some()
    }

    /// Effective CO2e rate per unit; falls back to combining the
    /// individual gases through the GWP table.
    pub fn co2e_rate(&self, gwp: &GwpTable) -> f64 {
        if let Some(rate) = self.co2e_per_unit {
            return rate;
        }
        self.co2_per_unit.unwrap_or(0.0) * gwp.co2
            + self.ch4_per_unit.unwrap_or(0.0) * gwp.ch4
            + self.n2o_per_unit.unwrap_or(0.0) * gwp.n2o
    }

    /// Multiply an activity quantity through the factor set.
    pub fn apply(&self, quantity: f64, gwp: &GwpTable) -> GasVector {
        GasVector {
            co2: self.co2_per_unit.unwrap_or(0.0) * quantity,
            ch4: self.ch4_per_unit.unwrap_or(0.0) * quantity,
            n2o: self.n2o_per_unit.unwrap_or(0.0) * quantity,
            co2e: self.co2e_rate(gwp) * quantity,
            uncertainty: 0.0,
        }
    }
}

/// Catalogue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactorKey {
    pub standard: FactorSource,
    pub scope_type: ScopeType,
    pub category: String,
    pub activity: String,
    pub fuel: Option<String>,
    pub region: Option<String>,
    pub unit: String,
}

impl FactorKey {
    fn lookup(&self) -> LookupKey {
        LookupKey {
            standard: self.standard,
            scope_type: self.scope_type,
            category: self.category.to_ascii_lowercase(),
            activity: self.activity.to_ascii_lowercase(),
            fuel: self.fuel.as_ref().map(|f| f.to_ascii_lowercase()),
            region: self.region.as_ref().map(|r| r.to_ascii_uppercase()),
        }
    }
}

/// Normalised lookup key (case-insensitive category/activity/fuel).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    standard: FactorSource,
    scope_type: ScopeType,
    category: String,
    activity: String,
    fuel: Option<String>,
    region: Option<String>,
}

/// A resolved factor set: key, values, GWP table, citation, validity year.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSet {
    pub key: FactorKey,
    pub values: FactorValues,
    pub gwp: GwpTable,
    /// Publication citation
    pub citation: String,
    /// Publication year for time-keyed grids; None = timeless
    pub valid_year: Option<i32>,
}

impl FactorSet {
    pub fn new(key: FactorKey, values: FactorValues, citation: impl Into<String>) -> Self {
        Self {
            key,
            values,
            gwp: GwpTable::default(),
            citation: citation.into(),
            valid_year: None,
        }
    }

    pub fn with_valid_year(mut self, year: i32) -> Self {
        self.valid_year = Some(year);
        self
    }

    pub fn with_gwp(mut self, gwp: GwpTable) -> Self {
        self.gwp = gwp;
        self
    }
}

/// What a scope asks the catalogue for.
#[derive(Debug, Clone)]
pub struct FactorQuery {
    pub source: FactorSource,
    pub scope_type: ScopeType,
    pub category: String,
    pub activity: String,
    pub fuel: Option<String>,
    pub region: Option<String>,
    /// Inline values for `FactorSource::Custom`
    pub custom: Option<FactorValues>,
}

/// Immutable factor catalogue.
///
/// Built once, shared behind `Arc`; a revision builds a new catalogue with
/// a bumped version instead of mutating this one.
#[derive(Debug, Clone)]
pub struct FactorCatalogue {
    version: u64,
    factors: HashMap<LookupKey, Vec<FactorSet>>,
}

impl FactorCatalogue {
    /// Catalogue version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of factor sets held.
    pub fn len(&self) -> usize {
        self.factors.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Resolve the effective factor set for a scope at an instant.
    ///
    /// Country grids are year-keyed: the entry published for the
    /// measurement's year wins, otherwise the most recent earlier year,
    /// otherwise the earliest published year.
    pub fn resolve(
        &self,
        query: &FactorQuery,
        timestamp: DateTime<Utc>,
    ) -> Result<FactorSet, FactorError> {
        if query.source == FactorSource::Custom {
            let values = query.custom.ok_or_else(|| FactorError::CustomMissing {
                category: query.category.clone(),
                activity: query.activity.clone(),
            })?;
            if !values.is_usable() {
                return Err(FactorError::CustomIncomplete {
                    category: query.category.clone(),
                    activity: query.activity.clone(),
                });
            }
            return Ok(FactorSet::new(
                FactorKey {
                    standard: FactorSource::Custom,
                    scope_type: query.scope_type,
                    category: query.category.clone(),
                    activity: query.activity.clone(),
                    fuel: query.fuel.clone(),
                    region: query.region.clone(),
                    unit: "custom".to_string(),
                },
                values,
                "inline custom factor",
            ));
        }

        let lookup = LookupKey {
            standard: query.source,
            scope_type: query.scope_type,
            category: query.category.to_ascii_lowercase(),
            activity: query.activity.to_ascii_lowercase(),
            fuel: query.fuel.as_ref().map(|f| f.to_ascii_lowercase()),
            region: query.region.as_ref().map(|r| r.to_ascii_uppercase()),
        };

        let mut candidates = self.factors.get(&lookup);

        // Fuel-agnostic fallback: a query naming a fuel the catalogue does
        // not split on still resolves against the fuel-less entry.
        let relaxed;
        if candidates.is_none() && lookup.fuel.is_some() {
            relaxed = LookupKey {
                fuel: None,
                ..lookup.clone()
            };
            candidates = self.factors.get(&relaxed);
        }

        let candidates = candidates.ok_or_else(|| FactorError::Unresolved {
            standard: query.source,
            scope_type: query.scope_type,
            category: query.category.clone(),
            activity: query.activity.clone(),
        })?;

        let year = timestamp.year();
        let best = candidates
            .iter()
            .filter(|f| f.valid_year.map(|y| y <= year).unwrap_or(true))
            .max_by_key(|f| f.valid_year.unwrap_or(i32::MIN))
            .or_else(|| candidates.iter().min_by_key(|f| f.valid_year.unwrap_or(i32::MAX)))
            .ok_or_else(|| FactorError::Unresolved {
                standard: query.source,
                scope_type: query.scope_type,
                category: query.category.clone(),
                activity: query.activity.clone(),
            })?;

        Ok(best.clone())
    }

    /// Seed catalogue with published reference factors.
    ///
    /// Rates are kg per unit: fuels per litre / m3, electricity per kWh,
    /// spend per currency unit, travel per passenger-km, freight per
    /// tonne-km, waste per tonne.
    pub fn with_defaults() -> Self {
        let mut builder = CatalogueBuilder::new();

        // --- Scope 1: stationary combustion -------------------------------
        builder = builder
            .factor(
                FactorSet::new(
                    key(FactorSource::Defra, ScopeType::Scope1, "stationary-combustion", "fuel-combustion", Some("diesel"), None, "litre"),
                    FactorValues {
                        co2_per_unit: Some(2.556),
                        ch4_per_unit: Some(0.0001),
                        n2o_per_unit: Some(0.00007),
                        co2e_per_unit: Some(2.68),
                    },
                    "DEFRA GHG Conversion Factors, gas oil",
                ),
            )
            .factor(FactorSet::new(
                key(FactorSource::Defra, ScopeType::Scope1, "stationary-combustion", "fuel-combustion", Some("petrol"), None, "litre"),
                FactorValues {
                    co2_per_unit: Some(2.19),
                    ch4_per_unit: Some(0.0002),
                    n2o_per_unit: Some(0.00006),
                    co2e_per_unit: Some(2.31),
                },
                "DEFRA GHG Conversion Factors, petrol",
            ))
            .factor(FactorSet::new(
                key(FactorSource::Ipcc, ScopeType::Scope1, "stationary-combustion", "fuel-combustion", Some("natural-gas"), None, "m3"),
                FactorValues {
                    co2_per_unit: Some(1.89),
                    ch4_per_unit: Some(0.00037),
                    n2o_per_unit: Some(0.000035),
                    co2e_per_unit: Some(2.03),
                },
                "IPCC 2006 Guidelines Vol.2, natural gas",
            ));

        // --- Scope 1: mobile combustion -----------------------------------
        builder = builder
            .factor(FactorSet::new(
                key(FactorSource::Epa, ScopeType::Scope1, "mobile-combustion", "fuel-combustion", Some("diesel"), None, "litre"),
                FactorValues::co2e(2.70),
                "EPA Emission Factors Hub, on-road diesel",
            ))
            .factor(FactorSet::new(
                key(FactorSource::Epa, ScopeType::Scope1, "mobile-combustion", "distance-travelled", None, None, "km"),
                FactorValues::co2e(0.171),
                "EPA Emission Factors Hub, average passenger vehicle",
            ));

        // --- Scope 1: process and fugitive --------------------------------
        builder = builder
            .factor(FactorSet::new(
                key(FactorSource::Ipcc, ScopeType::Scope1, "process-emission", "clinker-production", None, None, "tonne"),
                FactorValues::co2e(510.0),
                "IPCC 2006 Guidelines Vol.3, clinker",
            ))
            .factor(FactorSet::new(
                key(FactorSource::Ipcc, ScopeType::Scope1, "fugitive-emission", "sf6-equipment", None, None, "kg"),
                FactorValues::co2e(24_300.0),
                "IPCC AR6 GWP100, SF6",
            ))
            .factor(FactorSet::new(
                key(FactorSource::Ipcc, ScopeType::Scope1, "fugitive-emission", "refrigeration", None, None, "kg"),
                FactorValues::co2e(1_430.0),
                "IPCC AR6 GWP100, R-134a",
            ));

        // --- Scope 2: purchased energy, year-keyed country grids ----------
        for (region, year, rate) in [
            ("IN", 2022, 0.82),
            ("IN", 2023, 0.79),
            ("IN", 2024, 0.77),
            ("GB", 2023, 0.207),
            ("GB", 2024, 0.198),
            ("US", 2023, 0.386),
            ("US", 2024, 0.369),
        ] {
            builder = builder.factor(
                FactorSet::new(
                    key(FactorSource::Country, ScopeType::Scope2, "purchased-electricity", "grid-electricity", None, Some(region), "kWh"),
                    FactorValues::co2e(rate),
                    format!("national grid factor {} {}", region, year),
                )
                .with_valid_year(year),
            );
        }
        builder = builder
            .factor(FactorSet::new(
                key(FactorSource::Defra, ScopeType::Scope2, "purchased-heat", "district-heat", None, None, "kWh"),
                FactorValues::co2e(0.1707),
                "DEFRA GHG Conversion Factors, heat and steam",
            ))
            .factor(FactorSet::new(
                key(FactorSource::Defra, ScopeType::Scope2, "purchased-cooling", "district-cooling", None, None, "kWh"),
                FactorValues::co2e(0.1707),
                "DEFRA GHG Conversion Factors, heat and steam",
            ));

        // --- Scope 3: spend- and quantity-based ---------------------------
        for (category, activity, unit, rate, citation) in [
            ("purchased-goods", "procurement-spend", "GBP", 0.54, "DEFRA spend-based, goods"),
            ("purchased-goods", "physical-quantity", "tonne", 980.0, "EmissionFactorHub, mixed materials"),
            ("capital-goods", "capital-spend", "GBP", 0.40, "DEFRA spend-based, capital goods"),
            ("fuel-energy-related", "upstream-fuel", "litre", 0.62, "DEFRA WTT fuels"),
            ("upstream-transport", "freight", "tonne.km", 0.107, "DEFRA freighting goods, HGV"),
            ("waste-operations", "waste-treatment", "tonne", 467.0, "DEFRA waste, landfill"),
            ("business-travel", "passenger-travel", "passenger.km", 0.246, "DEFRA business travel, short-haul flight"),
            ("employee-commuting", "commuting", "passenger.km", 0.17, "DEFRA business travel, average car"),
            ("upstream-leased-assets", "leased-energy", "kWh", 0.21, "DEFRA leased assets"),
            ("downstream-transport", "freight", "tonne.km", 0.107, "DEFRA freighting goods, HGV"),
            ("processing-sold-products", "processing-energy", "kWh", 0.21, "DEFRA processing"),
            ("use-of-sold-products", "product-energy-use", "kWh", 0.21, "DEFRA in-use energy"),
            ("end-of-life", "disposal", "tonne", 467.0, "DEFRA waste, landfill"),
            ("downstream-leased-assets", "leased-energy", "kWh", 0.21, "DEFRA leased assets"),
            ("franchises", "franchise-energy", "kWh", 0.21, "DEFRA franchises"),
            ("investments", "investment-spend", "GBP", 0.30, "PCAF economic intensity"),
        ] {
            builder = builder.factor(FactorSet::new(
                key(FactorSource::Defra, ScopeType::Scope3, category, activity, None, None, unit),
                FactorValues::co2e(rate),
                citation,
            ));
        }

        builder.build()
    }
}

fn key(
    standard: FactorSource,
    scope_type: ScopeType,
    category: &str,
    activity: &str,
    fuel: Option<&str>,
    region: Option<&str>,
    unit: &str,
) -> FactorKey {
    FactorKey {
        standard,
        scope_type,
        category: category.to_string(),
        activity: activity.to_string(),
        fuel: fuel.map(str::to_string),
        region: region.map(str::to_string),
        unit: unit.to_string(),
    }
}

/// Builder for an immutable catalogue version.
#[derive(Debug, Default)]
pub struct CatalogueBuilder {
    version: u64,
    factors: HashMap<LookupKey, Vec<FactorSet>>,
}

impl CatalogueBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            factors: HashMap::new(),
        }
    }

    /// Start a revision of an existing catalogue with a bumped version.
    pub fn revision_of(previous: &FactorCatalogue) -> Self {
        Self {
            version: previous.version + 1,
            factors: previous.factors.clone(),
        }
    }

    /// Register a factor set. Sets sharing a key are kept side by side and
    /// disambiguated by validity year at resolve time.
    pub fn factor(mut self, set: FactorSet) -> Self {
        self.factors.entry(set.key.lookup()).or_default().push(set);
        self
    }

    pub fn build(self) -> FactorCatalogue {
        tracing::debug!(
            version = self.version,
            keys = self.factors.len(),
            "Factor catalogue built"
        );
        FactorCatalogue {
            version: self.version,
            factors: self.factors,
        }
    }
}

/// Factor resolution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FactorError {
    #[error("no factor for {standard} {scope_type} {category}/{activity}")]
    Unresolved {
        standard: FactorSource,
        scope_type: ScopeType,
        category: String,
        activity: String,
    },

    #[error("custom factor source selected but no values supplied for {category}/{activity}")]
    CustomMissing { category: String, activity: String },

    #[error("custom factor for {category}/{activity} must supply at least one of CO2, CH4, N2O, CO2e")]
    CustomIncomplete { category: String, activity: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn query(
        source: FactorSource,
        scope_type: ScopeType,
        category: &str,
        activity: &str,
        fuel: Option<&str>,
        region: Option<&str>,
    ) -> FactorQuery {
        FactorQuery {
            source,
            scope_type,
            category: category.to_string(),
            activity: activity.to_string(),
            fuel: fuel.map(str::to_string),
            region: region.map(str::to_string),
            custom: None,
        }
    }

    #[test]
    fn test_resolve_diesel() {
        let cat = FactorCatalogue::with_defaults();
        let set = cat
            .resolve(
                &query(FactorSource::Defra, ScopeType::Scope1, "stationary-combustion", "fuel-combustion", Some("diesel"), None),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(set.values.co2e_per_unit, Some(2.68));
    }

    #[test]
    fn test_country_grid_is_year_keyed() {
        let cat = FactorCatalogue::with_defaults();
        let q = query(FactorSource::Country, ScopeType::Scope2, "purchased-electricity", "grid-electricity", None, Some("IN"));

        let y2022 = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();
        let y2024 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let y2030 = Utc.with_ymd_and_hms(2030, 6, 1, 0, 0, 0).unwrap();

        assert_eq!(cat.resolve(&q, y2022).unwrap().values.co2e_per_unit, Some(0.82));
        assert_eq!(cat.resolve(&q, y2024).unwrap().values.co2e_per_unit, Some(0.77));
        // Years past the last publication fall back to the latest value
        assert_eq!(cat.resolve(&q, y2030).unwrap().values.co2e_per_unit, Some(0.77));
    }

    #[test]
    fn test_grid_year_before_first_publication_uses_earliest() {
        let cat = FactorCatalogue::with_defaults();
        let q = query(FactorSource::Country, ScopeType::Scope2, "purchased-electricity", "grid-electricity", None, Some("IN"));
        let y2019 = Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(cat.resolve(&q, y2019).unwrap().values.co2e_per_unit, Some(0.82));
    }

    #[test]
    fn test_custom_factor_requires_values() {
        let cat = FactorCatalogue::with_defaults();
        let mut q = query(FactorSource::Custom, ScopeType::Scope1, "stationary-combustion", "fuel-combustion", None, None);

        assert!(matches!(
            cat.resolve(&q, Utc::now()),
            Err(FactorError::CustomMissing { .. })
        ));

        q.custom = Some(FactorValues::default());
        assert!(matches!(
            cat.resolve(&q, Utc::now()),
            Err(FactorError::CustomIncomplete { .. })
        ));

        q.custom = Some(FactorValues::co2e(3.2));
        let set = cat.resolve(&q, Utc::now()).unwrap();
        assert_eq!(set.key.standard, FactorSource::Custom);
        assert_eq!(set.values.co2e_per_unit, Some(3.2));
    }

    #[test]
    fn test_unresolved_is_typed() {
        let cat = FactorCatalogue::with_defaults();
        let q = query(FactorSource::Ipcc, ScopeType::Scope3, "no-such-category", "nothing", None, None);
        assert!(matches!(
            cat.resolve(&q, Utc::now()),
            Err(FactorError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_revision_bumps_version() {
        let cat = FactorCatalogue::with_defaults();
        let revised = CatalogueBuilder::revision_of(&cat)
            .factor(FactorSet::new(
                FactorKey {
                    standard: FactorSource::Epa,
                    scope_type: ScopeType::Scope2,
                    category: "purchased-electricity".to_string(),
                    activity: "grid-electricity".to_string(),
                    fuel: None,
                    region: Some("CA".to_string()),
                    unit: "kWh".to_string(),
                },
                FactorValues::co2e(0.12),
                "test",
            ))
            .build();

        assert_eq!(revised.version(), cat.version() + 1);
        assert_eq!(revised.len(), cat.len() + 1);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let cat = FactorCatalogue::with_defaults();
        let set = cat
            .resolve(
                &query(FactorSource::Defra, ScopeType::Scope1, "Stationary-Combustion", "Fuel-Combustion", Some("Diesel"), None),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(set.values.co2e_per_unit, Some(2.68));
    }
}
