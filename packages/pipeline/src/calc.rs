//! Calculation engine: a closed dispatch table of pure functions mapping
//! `(data values, factor set)` to per-gas emissions in kilograms.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use carbonplane_factors::{FactorCatalogue, FactorError, FactorSet, GasVector};
use carbonplane_registry::ScopeDescriptor;

use crate::normalize::ActivityKind;

/// Calculation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CalcError {
    /// Dispatch key not in the closed activity table
    #[error("no calculator registered for {scope_type} {category}/{activity} ({tier})")]
    UnsupportedActivity {
        scope_type: String,
        category: String,
        activity: String,
        tier: String,
    },

    /// Factor unresolvable: the entry stays pending until config is fixed
    #[error(transparent)]
    Factor(#[from] FactorError),
}

/// The calculation engine. Pure apart from the catalogue lookup.
pub struct CalculationEngine {
    catalogue: Arc<FactorCatalogue>,
}

impl CalculationEngine {
    pub fn new(catalogue: Arc<FactorCatalogue>) -> Self {
        Self { catalogue }
    }

    /// Calculate one entry's per-gas emissions.
    ///
    /// Uncertainty is propagated as `sqrt(UAD^2 + UEF^2)` applied to the
    /// CO2e mass.
    pub fn calculate(
        &self,
        scope: &ScopeDescriptor,
        timestamp: DateTime<Utc>,
        data_values: &HashMap<String, f64>,
    ) -> Result<(GasVector, FactorSet), CalcError> {
        let kind = ActivityKind::resolve(
            scope.scope_type,
            &scope.category_name,
            &scope.activity,
            scope.calculation_model,
        )
        .ok_or_else(|| CalcError::UnsupportedActivity {
            scope_type: scope.scope_type.to_string(),
            category: scope.category_name.clone(),
            activity: scope.activity.clone(),
            tier: scope.calculation_model.as_str().to_string(),
        })?;

        let factor = self.catalogue.resolve(&scope.factor_query(), timestamp)?;
        let combined_pct = (scope.uad_pct.powi(2) + scope.uef_pct.powi(2)).sqrt();
        let result = dispatch(kind, data_values, &factor).with_uncertainty_pct(combined_pct);
        Ok((result, factor))
    }
}

fn field(values: &HashMap<String, f64>, name: &str) -> f64 {
    values.get(name).copied().unwrap_or(0.0)
}

/// The dispatch table proper. Adding a category means adding a variant to
/// `ActivityKind` and an arm here; the compiler keeps the two in step.
fn dispatch(kind: ActivityKind, v: &HashMap<String, f64>, factor: &FactorSet) -> GasVector {
    let rate = |quantity: f64| factor.values.apply(quantity, &factor.gwp);

    match kind {
        ActivityKind::StationaryCombustion | ActivityKind::MobileCombustionFuel => {
            rate(field(v, "fuelConsumption"))
        }
        ActivityKind::MobileCombustionDistance => rate(field(v, "distanceTravelled")),

        ActivityKind::ProcessEmissionDirect => rate(field(v, "rawMaterialInput")),
        ActivityKind::ProcessEmissionStoichiometric => {
            let quantity = field(v, "rawMaterialInput")
                * field(v, "stoichiometricFactor")
                * field(v, "conversionEfficiency");
            rate(quantity)
        }

        ActivityKind::FugitiveSf6 => {
            let leaked = field(v, "nameplateCapacity") * field(v, "defaultLeakageRate") / 100.0
                + field(v, "decreaseInventory")
                + field(v, "acquisitions")
                - field(v, "disbursements")
                - field(v, "netCapacityIncrease");
            rate(leaked)
        }
        ActivityKind::FugitiveRefrigeration => {
            let operating = field(v, "numberOfUnits").max(1.0)
                * field(v, "installedCapacity")
                * field(v, "leakageRate")
                / 100.0;
            let inventory_change = field(v, "installedCapacity") - field(v, "endYearCapacity");
            let leaked =
                operating + field(v, "purchases") - field(v, "disposals") + inventory_change;
            rate(leaked)
        }

        ActivityKind::PurchasedElectricity => rate(field(v, "consumed_electricity")),
        ActivityKind::PurchasedHeat => rate(field(v, "consumed_heat")),
        ActivityKind::PurchasedCooling => rate(field(v, "consumed_cooling")),

        ActivityKind::PurchasedGoodsSpend => rate(field(v, "procurementSpend")),
        ActivityKind::PurchasedGoodsQuantity => rate(field(v, "physicalQuantity")),
        ActivityKind::CapitalGoodsSpend => rate(field(v, "capitalSpend")),
        ActivityKind::CapitalGoodsQuantity => rate(field(v, "assetQuantity")),
        ActivityKind::FuelEnergyUpstream => rate(field(v, "fuelConsumption")),

        ActivityKind::UpstreamTransportSpend | ActivityKind::DownstreamTransportSpend => {
            rate(field(v, "freightSpend"))
        }
        ActivityKind::UpstreamTransportTonneKm | ActivityKind::DownstreamTransportTonneKm => {
            rate(field(v, "freightMass") * field(v, "distance"))
        }

        ActivityKind::WasteOperations => rate(field(v, "wasteMass")),
        ActivityKind::BusinessTravelSpend => rate(field(v, "travelSpend")),
        ActivityKind::BusinessTravelDistance => rate(field(v, "passengerDistance")),

        ActivityKind::EmployeeCommutingSurvey => {
            let distance = field(v, "employeeCount")
                * field(v, "averageCommuteDistance")
                * field(v, "workingDays");
            rate(distance)
        }
        ActivityKind::EmployeeCommutingDistance => rate(field(v, "passengerDistance")),

        ActivityKind::UpstreamLeasedAssets | ActivityKind::DownstreamLeasedAssets => {
            rate(field(v, "energyConsumption"))
        }
        ActivityKind::ProcessingSoldProducts => rate(field(v, "processingEnergy")),
        ActivityKind::UseOfSoldProducts => {
            rate(field(v, "productsSold") * field(v, "lifetimeEnergyUse"))
        }
        ActivityKind::EndOfLifeTreatment => rate(field(v, "massDisposed")),
        ActivityKind::Franchises => {
            rate(field(v, "franchiseCount") * field(v, "averageEnergyUse"))
        }

        ActivityKind::InvestmentsSpend => rate(field(v, "investmentValue")),
        // Tier-2 investments attribute the investee's reported emissions
        // directly; the share is a percentage, no factor involved.
        ActivityKind::InvestmentsShare => GasVector::co2e_only(
            field(v, "shareOfInvestment") / 100.0 * field(v, "investeeEmissions"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbonplane_factors::{CalculationTier, FactorSource, ScopeType};
    use carbonplane_registry::ScopeDescriptor;
    use chrono::TimeZone;

    fn engine() -> CalculationEngine {
        CalculationEngine::new(Arc::new(FactorCatalogue::with_defaults()))
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_stationary_combustion_diesel() {
        let scope = ScopeDescriptor::new(
            "DIESEL_GEN",
            ScopeType::Scope1,
            "stationary-combustion",
            "fuel-combustion",
        )
        .with_fuel("diesel");

        let values = HashMap::from([("fuelConsumption".to_string(), 100.0)]);
        let (result, factor) = engine()
            .calculate(&scope, ts(2024, 1, 15), &values)
            .unwrap();

        // 100 L x 2.68 kgCO2e/L = 268 kg = 0.268 t
        assert!((result.co2e - 268.0).abs() < 1e-9);
        assert!(result.co2 > 0.0);
        assert!(factor.citation.contains("DEFRA"));
    }

    #[test]
    fn test_grid_electricity_uses_measurement_year() {
        let scope = ScopeDescriptor::new(
            "PLANT_POWER",
            ScopeType::Scope2,
            "purchased-electricity",
            "grid-electricity",
        )
        .with_factor_source(FactorSource::Country)
        .with_region("IN");

        let values = HashMap::from([("consumed_electricity".to_string(), 1000.0)]);
        let engine = engine();

        let (y2022, _) = engine.calculate(&scope, ts(2022, 5, 1), &values).unwrap();
        let (y2024, _) = engine.calculate(&scope, ts(2024, 5, 1), &values).unwrap();

        assert!((y2022.co2e - 820.0).abs() < 1e-9);
        assert!((y2024.co2e - 770.0).abs() < 1e-9);
    }

    #[test]
    fn test_sf6_mass_balance() {
        let scope = ScopeDescriptor::new(
            "SWITCHGEAR",
            ScopeType::Scope1,
            "fugitive-emission",
            "sf6-equipment",
        )
        .with_factor_source(FactorSource::Ipcc);

        let values = HashMap::from([
            ("nameplateCapacity".to_string(), 200.0),
            ("defaultLeakageRate".to_string(), 0.5),
            ("decreaseInventory".to_string(), 1.0),
            ("acquisitions".to_string(), 2.0),
            ("disbursements".to_string(), 1.5),
            ("netCapacityIncrease".to_string(), 0.5),
        ]);

        let (result, _) = engine().calculate(&scope, ts(2024, 3, 1), &values).unwrap();
        // leaked = 200*0.5/100 + 1 + 2 - 1.5 - 0.5 = 2 kg; x 24300 GWP
        assert!((result.co2e - 48_600.0).abs() < 1e-6);
    }

    #[test]
    fn test_commuting_survey_formula() {
        let scope = ScopeDescriptor::new(
            "COMMUTE",
            ScopeType::Scope3,
            "employee-commuting",
            "commuting",
        )
        .with_tier(CalculationTier::Tier1);

        let values = HashMap::from([
            ("employeeCount".to_string(), 50.0),
            ("averageCommuteDistance".to_string(), 20.0),
            ("workingDays".to_string(), 220.0),
        ]);

        let (result, _) = engine().calculate(&scope, ts(2024, 3, 1), &values).unwrap();
        // 50 x 20 x 220 x 0.17 = 37,400 kg
        assert!((result.co2e - 37_400.0).abs() < 1e-6);
    }

    #[test]
    fn test_investments_share_ignores_factor() {
        let scope = ScopeDescriptor::new(
            "PORTFOLIO",
            ScopeType::Scope3,
            "investments",
            "investment-spend",
        )
        .with_tier(CalculationTier::Tier2);

        let values = HashMap::from([
            ("shareOfInvestment".to_string(), 25.0),
            ("investeeEmissions".to_string(), 4000.0),
        ]);

        let (result, _) = engine().calculate(&scope, ts(2024, 3, 1), &values).unwrap();
        assert!((result.co2e - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_uncertainty_is_quadrature_of_uad_uef() {
        let scope = ScopeDescriptor::new(
            "DIESEL_GEN",
            ScopeType::Scope1,
            "stationary-combustion",
            "fuel-combustion",
        )
        .with_fuel("diesel")
        .with_uncertainty(3.0, 4.0);

        let values = HashMap::from([("fuelConsumption".to_string(), 100.0)]);
        let (result, _) = engine().calculate(&scope, ts(2024, 1, 15), &values).unwrap();

        // combined = sqrt(9 + 16) = 5% of 268 kg
        assert!((result.uncertainty - 13.4).abs() < 1e-9);
    }

    #[test]
    fn test_unsupported_activity_is_typed() {
        let scope = ScopeDescriptor::new(
            "X",
            ScopeType::Scope1,
            "teleportation",
            "beam",
        );
        let err = engine()
            .calculate(&scope, ts(2024, 1, 1), &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CalcError::UnsupportedActivity { .. }));
    }
}
