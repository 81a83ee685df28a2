//! Scope descriptors: the atomic unit measurements attach to.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use carbonplane_factors::{CalculationTier, FactorQuery, FactorSource, FactorValues, ScopeType};

use crate::types::ScopeUid;

/// How measurements enter a scope's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Manual,
    Api,
    Iot,
}

impl InputType {
    /// Canonical lowercase wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Api => "api",
            Self::Iot => "iot",
        }
    }

    /// Case-insensitive parse; the source data mixes `manual`, `Manual`,
    /// `API`, `IOT` and this is where they canonicalise.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "api" => Some(Self::Api),
            "iot" => Some(Self::Iot),
            _ => None,
        }
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected collection cadence of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionFrequency {
    Daily,
    Weekly,
    Fortnightly,
    Monthly,
    Quarterly,
    Yearly,
}

impl CollectionFrequency {
    /// Cadence as a duration, months approximated at 31 days so a monthly
    /// stream is never flagged early.
    pub fn cadence(&self) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
            Self::Fortnightly => Duration::weeks(2),
            Self::Monthly => Duration::days(31),
            Self::Quarterly => Duration::days(92),
            Self::Yearly => Duration::days(366),
        }
    }
}

/// A scope descriptor inside a flowchart node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    /// Stable across renames
    pub scope_uid: ScopeUid,
    /// Human name; may change over time
    pub scope_identifier: String,
    pub scope_type: ScopeType,
    pub category_name: String,
    pub activity: String,
    pub calculation_model: CalculationTier,
    pub input_type: InputType,
    /// Polled endpoint for `InputType::Api` scopes
    pub api_endpoint: Option<String>,
    /// Device binding for `InputType::Iot` scopes
    pub iot_device_id: Option<String>,
    /// Which standard the factor resolves against
    pub emission_factor: FactorSource,
    /// Resolved or inline-custom factor values
    pub emission_factor_values: Option<FactorValues>,
    /// Fuel discriminator for combustion factors
    pub fuel: Option<String>,
    /// Region discriminator for country grids
    pub region: Option<String>,
    /// Activity-data uncertainty percentage
    pub uad_pct: f64,
    /// Emission-factor uncertainty percentage
    pub uef_pct: f64,
    /// Share of this scope's raw emission attributed to the containing
    /// process node; 0..=100, defaults to 100
    pub allocation_pct: Decimal,
    /// Expected collection cadence, drives overdue detection
    pub collection_frequency: Option<CollectionFrequency>,
}

impl ScopeDescriptor {
    pub fn new(
        scope_identifier: impl Into<String>,
        scope_type: ScopeType,
        category_name: impl Into<String>,
        activity: impl Into<String>,
    ) -> Self {
        Self {
            scope_uid: uuid::Uuid::new_v4().to_string(),
            scope_identifier: scope_identifier.into(),
            scope_type,
            category_name: category_name.into(),
            activity: activity.into(),
            calculation_model: CalculationTier::Tier1,
            input_type: InputType::Manual,
            api_endpoint: None,
            iot_device_id: None,
            emission_factor: FactorSource::Defra,
            emission_factor_values: None,
            fuel: None,
            region: None,
            uad_pct: 0.0,
            uef_pct: 0.0,
            allocation_pct: dec!(100),
            collection_frequency: None,
        }
    }

    pub fn with_input_type(mut self, input_type: InputType) -> Self {
        self.input_type = input_type;
        self
    }

    pub fn with_tier(mut self, tier: CalculationTier) -> Self {
        self.calculation_model = tier;
        self
    }

    pub fn with_factor_source(mut self, source: FactorSource) -> Self {
        self.emission_factor = source;
        self
    }

    pub fn with_custom_factor(mut self, values: FactorValues) -> Self {
        self.emission_factor = FactorSource::Custom;
        self.emission_factor_values = Some(values);
        self
    }

    pub fn with_fuel(mut self, fuel: impl Into<String>) -> Self {
        self.fuel = Some(fuel.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_uncertainty(mut self, uad_pct: f64, uef_pct: f64) -> Self {
        self.uad_pct = uad_pct;
        self.uef_pct = uef_pct;
        self
    }

    pub fn with_allocation(mut self, pct: Decimal) -> Self {
        self.allocation_pct = pct;
        self
    }

    pub fn with_collection_frequency(mut self, freq: CollectionFrequency) -> Self {
        self.collection_frequency = Some(freq);
        self
    }

    /// Factor-catalogue query for this scope.
    pub fn factor_query(&self) -> FactorQuery {
        FactorQuery {
            source: self.emission_factor,
            scope_type: self.scope_type,
            category: self.category_name.clone(),
            activity: self.activity.clone(),
            fuel: self.fuel.clone(),
            region: self.region.clone(),
            custom: self.emission_factor_values,
        }
    }
}
