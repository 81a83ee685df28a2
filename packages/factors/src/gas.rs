//! Greenhouse-gas vocabulary: scope types, calculation tiers, per-gas
//! emission vectors and GWP tables.

use serde::{Deserialize, Serialize};

/// GHG Protocol scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeType {
    /// Direct combustion and fugitive emissions
    #[serde(rename = "Scope 1")]
    Scope1,
    /// Purchased energy
    #[serde(rename = "Scope 2")]
    Scope2,
    /// Upstream and downstream activities
    #[serde(rename = "Scope 3")]
    Scope3,
}

impl ScopeType {
    /// Display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scope1 => "Scope 1",
            Self::Scope2 => "Scope 2",
            Self::Scope3 => "Scope 3",
        }
    }

    /// Parse from the wire form, tolerating case and spacing variants.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(' ', "").as_str() {
            "scope1" | "1" => Some(Self::Scope1),
            "scope2" | "2" => Some(Self::Scope2),
            "scope3" | "3" => Some(Self::Scope3),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calculation detail tier.
///
/// Tier 1 is spend-based, tier 2 quantity-based, tier 3 site-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationTier {
    #[serde(rename = "tier 1")]
    Tier1,
    #[serde(rename = "tier 2")]
    Tier2,
    #[serde(rename = "tier 3")]
    Tier3,
}

impl CalculationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tier1 => "tier 1",
            Self::Tier2 => "tier 2",
            Self::Tier3 => "tier 3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(' ', "").as_str() {
            "tier1" | "1" => Some(Self::Tier1),
            "tier2" | "2" => Some(Self::Tier2),
            "tier3" | "3" => Some(Self::Tier3),
            _ => None,
        }
    }
}

/// Global-warming-potential table (100-year horizon, AR6 defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GwpTable {
    /// CO2 reference (always 1)
    pub co2: f64,
    /// Methane
    pub ch4: f64,
    /// Nitrous oxide
    pub n2o: f64,
    /// Sulphur hexafluoride
    pub sf6: f64,
    /// Blended refrigerant default (HFC mix)
    pub refrigerant: f64,
    /// When this table was last revised
    pub last_updated: chrono::DateTime<chrono::Utc>,
    /// Free-text search field ("AR6", "AR5", assessment name)
    pub search: String,
}

impl Default for GwpTable {
    fn default() -> Self {
        Self::ar6()
    }
}

impl GwpTable {
    /// IPCC Sixth Assessment Report values, 100-year horizon.
    pub fn ar6() -> Self {
        Self {
            co2: 1.0,
            ch4: 27.9,
            n2o: 273.0,
            sf6: 24_300.0,
            refrigerant: 1_430.0, // R-134a
            last_updated: chrono::DateTime::from_timestamp(1_628_553_600, 0)
                .unwrap_or_else(chrono::Utc::now),
            search: "AR6".to_string(),
        }
    }
}

/// Per-gas emission result in kilograms.
///
/// `uncertainty` is the absolute CO2e uncertainty in kilograms, which sums
/// linearly when vectors are folded into summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GasVector {
    pub co2: f64,
    pub ch4: f64,
    pub n2o: f64,
    pub co2e: f64,
    pub uncertainty: f64,
}

impl GasVector {
    /// A vector holding only a CO2e mass.
    pub fn co2e_only(co2e: f64) -> Self {
        Self {
            co2e,
            ..Self::default()
        }
    }

    /// Element-wise addition.
    pub fn add(&self, other: &GasVector) -> GasVector {
        GasVector {
            co2: self.co2 + other.co2,
            ch4: self.ch4 + other.ch4,
            n2o: self.n2o + other.n2o,
            co2e: self.co2e + other.co2e,
            uncertainty: self.uncertainty + other.uncertainty,
        }
    }

    /// Element-wise subtraction, clamped at zero.
    pub fn saturating_sub(&self, other: &GasVector) -> GasVector {
        GasVector {
            co2: (self.co2 - other.co2).max(0.0),
            ch4: (self.ch4 - other.ch4).max(0.0),
            n2o: (self.n2o - other.n2o).max(0.0),
            co2e: (self.co2e - other.co2e).max(0.0),
            uncertainty: (self.uncertainty - other.uncertainty).max(0.0),
        }
    }

    /// Scale every component by a factor.
    pub fn scale(&self, factor: f64) -> GasVector {
        GasVector {
            co2: self.co2 * factor,
            ch4: self.ch4 * factor,
            n2o: self.n2o * factor,
            co2e: self.co2e * factor,
            uncertainty: self.uncertainty * factor,
        }
    }

    /// Apply a combined relative uncertainty percentage to the CO2e mass.
    pub fn with_uncertainty_pct(mut self, pct: f64) -> GasVector {
        self.uncertainty = self.co2e.abs() * pct / 100.0;
        self
    }

    /// True when every component is within `1e-9` of zero.
    pub fn is_zero(&self) -> bool {
        self.co2.abs() < 1e-9
            && self.ch4.abs() < 1e-9
            && self.n2o.abs() < 1e-9
            && self.co2e.abs() < 1e-9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_type_parse_tolerates_case() {
        assert_eq!(ScopeType::parse("Scope 1"), Some(ScopeType::Scope1));
        assert_eq!(ScopeType::parse("scope 2"), Some(ScopeType::Scope2));
        assert_eq!(ScopeType::parse("SCOPE3"), Some(ScopeType::Scope3));
        assert_eq!(ScopeType::parse("scope 4"), None);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(CalculationTier::parse("tier 1"), Some(CalculationTier::Tier1));
        assert_eq!(CalculationTier::parse("Tier2"), Some(CalculationTier::Tier2));
        assert_eq!(CalculationTier::parse("0"), None);
    }

    #[test]
    fn test_gas_vector_arithmetic() {
        let a = GasVector {
            co2: 1.0,
            ch4: 0.1,
            n2o: 0.01,
            co2e: 5.0,
            uncertainty: 0.5,
        };
        let b = a.scale(2.0);
        assert!((b.co2e - 10.0).abs() < 1e-12);

        let sum = a.add(&b);
        assert!((sum.co2e - 15.0).abs() < 1e-12);
        assert!((sum.uncertainty - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_uncertainty_pct_is_absolute_co2e() {
        let v = GasVector::co2e_only(200.0).with_uncertainty_pct(5.0);
        assert!((v.uncertainty - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_gwp_defaults() {
        let gwp = GwpTable::default();
        assert_eq!(gwp.co2, 1.0);
        assert!(gwp.sf6 > 20_000.0);
        assert_eq!(gwp.search, "AR6");
    }
}
