//! Canonical payload shapes per activity.
//!
//! Every `(scope type, category, activity, tier)` combination the plane
//! understands resolves to one `ActivityKind` variant carrying its
//! canonical field set. Normalisation keeps exactly those fields, drops
//! unknown ones, and defaults missing ones to 0 — a missing field never
//! fails ingestion.

use std::collections::HashMap;

use carbonplane_factors::{CalculationTier, ScopeType};

/// Closed set of supported activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    // --- Scope 1 ----------------------------------------------------------
    StationaryCombustion,
    MobileCombustionFuel,
    MobileCombustionDistance,
    ProcessEmissionDirect,
    ProcessEmissionStoichiometric,
    FugitiveSf6,
    FugitiveRefrigeration,
    // --- Scope 2 ----------------------------------------------------------
    PurchasedElectricity,
    PurchasedHeat,
    PurchasedCooling,
    // --- Scope 3 (GHG Protocol categories 1-15) ---------------------------
    PurchasedGoodsSpend,
    PurchasedGoodsQuantity,
    CapitalGoodsSpend,
    CapitalGoodsQuantity,
    FuelEnergyUpstream,
    UpstreamTransportSpend,
    UpstreamTransportTonneKm,
    WasteOperations,
    BusinessTravelSpend,
    BusinessTravelDistance,
    EmployeeCommutingSurvey,
    EmployeeCommutingDistance,
    UpstreamLeasedAssets,
    DownstreamTransportSpend,
    DownstreamTransportTonneKm,
    ProcessingSoldProducts,
    UseOfSoldProducts,
    EndOfLifeTreatment,
    DownstreamLeasedAssets,
    Franchises,
    InvestmentsSpend,
    InvestmentsShare,
}

impl ActivityKind {
    /// Resolve the dispatch key to a variant. Returns `None` for
    /// combinations the plane does not calculate; the entry is then left
    /// pending until configuration is fixed.
    pub fn resolve(
        scope_type: ScopeType,
        category: &str,
        activity: &str,
        tier: CalculationTier,
    ) -> Option<Self> {
        let category = slug(category);
        let activity = slug(activity);
        let spend = tier == CalculationTier::Tier1;

        match scope_type {
            ScopeType::Scope1 => match category.as_str() {
                "stationarycombustion" => Some(Self::StationaryCombustion),
                "mobilecombustion" => {
                    if activity.contains("distance") {
                        Some(Self::MobileCombustionDistance)
                    } else {
                        Some(Self::MobileCombustionFuel)
                    }
                }
                "processemission" => match tier {
                    CalculationTier::Tier1 => Some(Self::ProcessEmissionDirect),
                    _ => Some(Self::ProcessEmissionStoichiometric),
                },
                "fugitiveemission" => {
                    if activity.contains("sf6") {
                        Some(Self::FugitiveSf6)
                    } else if activity.contains("refrigeration") || activity.contains("cooling") {
                        Some(Self::FugitiveRefrigeration)
                    } else {
                        None
                    }
                }
                _ => None,
            },
            ScopeType::Scope2 => match category.as_str() {
                "purchasedelectricity" => Some(Self::PurchasedElectricity),
                "purchasedheat" | "purchasedsteam" => Some(Self::PurchasedHeat),
                "purchasedcooling" => Some(Self::PurchasedCooling),
                _ => None,
            },
            ScopeType::Scope3 => match category.as_str() {
                "purchasedgoods" | "purchasedgoodsandservices" => Some(if spend {
                    Self::PurchasedGoodsSpend
                } else {
                    Self::PurchasedGoodsQuantity
                }),
                "capitalgoods" => Some(if spend {
                    Self::CapitalGoodsSpend
                } else {
                    Self::CapitalGoodsQuantity
                }),
                "fuelenergyrelated" | "fuelandenergyrelated" => Some(Self::FuelEnergyUpstream),
                "upstreamtransport" | "upstreamtransportation" => Some(if spend {
                    Self::UpstreamTransportSpend
                } else {
                    Self::UpstreamTransportTonneKm
                }),
                "wasteoperations" | "wastegenerated" => Some(Self::WasteOperations),
                "businesstravel" => Some(if spend {
                    Self::BusinessTravelSpend
                } else {
                    Self::BusinessTravelDistance
                }),
                "employeecommuting" => Some(if spend {
                    Self::EmployeeCommutingSurvey
                } else {
                    Self::EmployeeCommutingDistance
                }),
                "upstreamleasedassets" => Some(Self::UpstreamLeasedAssets),
                "downstreamtransport" | "downstreamtransportation" => Some(if spend {
                    Self::DownstreamTransportSpend
                } else {
                    Self::DownstreamTransportTonneKm
                }),
                "processingsoldproducts" | "processingofsoldproducts" => {
                    Some(Self::ProcessingSoldProducts)
                }
                "useofsoldproducts" => Some(Self::UseOfSoldProducts),
                "endoflife" | "endoflifetreatment" => Some(Self::EndOfLifeTreatment),
                "downstreamleasedassets" => Some(Self::DownstreamLeasedAssets),
                "franchises" => Some(Self::Franchises),
                "investments" => Some(if spend {
                    Self::InvestmentsSpend
                } else {
                    Self::InvestmentsShare
                }),
                _ => None,
            },
        }
    }

    /// Canonical field set of this activity's payload.
    pub fn canonical_fields(&self) -> &'static [&'static str] {
        match self {
            Self::StationaryCombustion => &["fuelConsumption"],
            Self::MobileCombustionFuel => &["fuelConsumption"],
            Self::MobileCombustionDistance => &["distanceTravelled"],
            Self::ProcessEmissionDirect => &["rawMaterialInput"],
            Self::ProcessEmissionStoichiometric => {
                &["rawMaterialInput", "stoichiometricFactor", "conversionEfficiency"]
            }
            Self::FugitiveSf6 => &[
                "nameplateCapacity",
                "defaultLeakageRate",
                "decreaseInventory",
                "acquisitions",
                "disbursements",
                "netCapacityIncrease",
            ],
            Self::FugitiveRefrigeration => &[
                "numberOfUnits",
                "leakageRate",
                "installedCapacity",
                "endYearCapacity",
                "purchases",
                "disposals",
            ],
            Self::PurchasedElectricity => &["consumed_electricity"],
            Self::PurchasedHeat => &["consumed_heat"],
            Self::PurchasedCooling => &["consumed_cooling"],
            Self::PurchasedGoodsSpend => &["procurementSpend"],
            Self::PurchasedGoodsQuantity => &["physicalQuantity"],
            Self::CapitalGoodsSpend => &["capitalSpend"],
            Self::CapitalGoodsQuantity => &["assetQuantity"],
            Self::FuelEnergyUpstream => &["fuelConsumption"],
            Self::UpstreamTransportSpend => &["freightSpend"],
            Self::UpstreamTransportTonneKm => &["freightMass", "distance"],
            Self::WasteOperations => &["wasteMass"],
            Self::BusinessTravelSpend => &["travelSpend"],
            Self::BusinessTravelDistance => &["passengerDistance"],
            Self::EmployeeCommutingSurvey => {
                &["employeeCount", "averageCommuteDistance", "workingDays"]
            }
            Self::EmployeeCommutingDistance => &["passengerDistance"],
            Self::UpstreamLeasedAssets => &["energyConsumption"],
            Self::DownstreamTransportSpend => &["freightSpend"],
            Self::DownstreamTransportTonneKm => &["freightMass", "distance"],
            Self::ProcessingSoldProducts => &["processingEnergy"],
            Self::UseOfSoldProducts => &["productsSold", "lifetimeEnergyUse"],
            Self::EndOfLifeTreatment => &["massDisposed"],
            Self::DownstreamLeasedAssets => &["energyConsumption"],
            Self::Franchises => &["franchiseCount", "averageEnergyUse"],
            Self::InvestmentsSpend => &["investmentValue"],
            Self::InvestmentsShare => &["shareOfInvestment", "investeeEmissions"],
        }
    }
}

/// Lowercase a dispatch-key component and strip separators.
fn slug(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Sanitise a payload field name: document-store keys may not contain
/// `.` or `$`.
pub fn sanitise_field(name: &str) -> String {
    name.replace(['.', '$'], "_")
}

/// Project a raw payload onto an activity's canonical field set.
///
/// Unknown fields are dropped; missing canonical fields default to 0.
pub fn normalize_payload(kind: ActivityKind, raw: &HashMap<String, f64>) -> HashMap<String, f64> {
    let sanitised: HashMap<String, f64> = raw
        .iter()
        .map(|(k, v)| (sanitise_field(k), *v))
        .collect();

    kind.canonical_fields()
        .iter()
        .map(|field| {
            let value = sanitised.get(*field).copied().unwrap_or(0.0);
            (field.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scope1_variants() {
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope1, "stationary-combustion", "fuel-combustion", CalculationTier::Tier1),
            Some(ActivityKind::StationaryCombustion)
        );
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope1, "fugitive-emission", "sf6-equipment", CalculationTier::Tier1),
            Some(ActivityKind::FugitiveSf6)
        );
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope1, "fugitive-emission", "refrigeration", CalculationTier::Tier1),
            Some(ActivityKind::FugitiveRefrigeration)
        );
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope1, "process-emission", "clinker-production", CalculationTier::Tier2),
            Some(ActivityKind::ProcessEmissionStoichiometric)
        );
    }

    #[test]
    fn test_resolve_tier_selects_spend_or_quantity() {
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope3, "purchased-goods", "procurement-spend", CalculationTier::Tier1),
            Some(ActivityKind::PurchasedGoodsSpend)
        );
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope3, "purchased-goods", "physical-quantity", CalculationTier::Tier2),
            Some(ActivityKind::PurchasedGoodsQuantity)
        );
    }

    #[test]
    fn test_every_scope3_category_resolves() {
        let categories = [
            "purchased-goods",
            "capital-goods",
            "fuel-energy-related",
            "upstream-transport",
            "waste-operations",
            "business-travel",
            "employee-commuting",
            "upstream-leased-assets",
            "downstream-transport",
            "processing-sold-products",
            "use-of-sold-products",
            "end-of-life",
            "downstream-leased-assets",
            "franchises",
            "investments",
        ];
        for category in categories {
            for tier in [CalculationTier::Tier1, CalculationTier::Tier2] {
                assert!(
                    ActivityKind::resolve(ScopeType::Scope3, category, "any", tier).is_some(),
                    "category {} tier {:?} must resolve",
                    category,
                    tier
                );
            }
        }
    }

    #[test]
    fn test_unknown_category_is_none() {
        assert_eq!(
            ActivityKind::resolve(ScopeType::Scope1, "teleportation", "beam", CalculationTier::Tier1),
            None
        );
    }

    #[test]
    fn test_normalize_drops_unknown_and_defaults_missing() {
        let raw = HashMap::from([
            ("fuelConsumption".to_string(), 100.0),
            ("operatorName".to_string(), 7.0),
        ]);
        let canonical = normalize_payload(ActivityKind::StationaryCombustion, &raw);

        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical["fuelConsumption"], 100.0);

        let empty = normalize_payload(ActivityKind::FugitiveSf6, &HashMap::new());
        assert_eq!(empty.len(), 6);
        assert!(empty.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_sanitise_field_strips_reserved_chars() {
        assert_eq!(sanitise_field("fuel.consumption"), "fuel_consumption");
        assert_eq!(sanitise_field("$spend"), "_spend");
    }
}
