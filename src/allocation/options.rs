//! Candidate option enumeration.
//!
//! For every legal (demand, bank, supply) triple with a price row this emits
//! a normal option, and at adjacent/far tiers also the best paired option
//! when blending a co-located companion beats the single-habitat price. Both
//! are emitted; the minimiser chooses.

use rayon::prelude::*;

use super::legality::{is_legal_supply, pairing_candidates};
use super::tiers::{bank_tier, stock_use_ratio};
use super::{pairing_weights, AllocationOption, OptionComponent};
use crate::geography::SiteContext;
use crate::models::{ContractSize, DemandLine, Ledger, OptionKind};
use crate::reference::Reference;

#[derive(Debug, Clone, Default)]
pub struct BuiltOptions {
    pub options: Vec<AllocationOption>,
    pub warnings: Vec<String>,
}

pub fn build_options(
    reference: &Reference,
    site: &SiteContext,
    demand: &[DemandLine],
    contract_size: ContractSize,
) -> BuiltOptions {
    let mut warnings = Vec::new();

    let wants_watercourse = demand.iter().any(|d| d.ledger == Ledger::Watercourse);
    if wants_watercourse && site.waterbody_id.is_none() && site.operational_catchment_id.is_none() {
        warnings.push(
            "site waterbody and operational catchment unresolved; watercourse banks tier as far"
                .to_string(),
        );
    }

    let mut options: Vec<AllocationOption> = demand
        .par_iter()
        .enumerate()
        .map(|(demand_idx, line)| options_for_demand(reference, site, demand_idx, line, contract_size))
        .flatten()
        .collect();

    // Deterministic order independent of enumeration parallelism.
    options.sort_by(|a, b| {
        (
            a.demand_idx,
            &reference.bank(a.bank).bank_id,
            &reference.habitat(a.main().habitat).name,
            a.tier,
            a.kind.as_str(),
        )
            .cmp(&(
                b.demand_idx,
                &reference.bank(b.bank).bank_id,
                &reference.habitat(b.main().habitat).name,
                b.tier,
                b.kind.as_str(),
            ))
    });

    BuiltOptions { options, warnings }
}

fn options_for_demand(
    reference: &Reference,
    site: &SiteContext,
    demand_idx: usize,
    line: &DemandLine,
    contract_size: ContractSize,
) -> Vec<AllocationOption> {
    let mut out = Vec::new();

    for bank in 0..reference.banks.len() {
        let stocked = reference.habitats_at(bank);
        if stocked.is_empty() {
            continue;
        }

        let tier = bank_tier(reference, site, bank, line.ledger);
        let normal_use = stock_use_ratio(reference, line.ledger, tier);

        for &supply in stocked {
            if reference.headroom(bank, supply) <= 0.0 {
                continue;
            }
            if !is_legal_supply(reference, line, supply) {
                continue;
            }
            let Some(price) = reference.price(bank, supply, contract_size, tier) else {
                continue;
            };

            out.push(AllocationOption {
                demand_idx,
                bank,
                tier,
                kind: OptionKind::Normal,
                unit_price: price,
                components: vec![OptionComponent {
                    habitat: supply,
                    stock_use: normal_use,
                    unit_price: price,
                }],
            });

            // Pairing embeds the SRM in its weights, which only exist for
            // the area/hedgerow multiplier ladder.
            if line.ledger == Ledger::Watercourse {
                continue;
            }
            let Some((w_main, w_companion)) = pairing_weights(tier) else {
                continue;
            };

            let best = pairing_candidates(reference, line, stocked, supply)
                .into_iter()
                .filter(|&c| reference.headroom(bank, c) > 0.0)
                .filter_map(|c| {
                    reference
                        .price(bank, c, contract_size, tier)
                        .map(|p| (c, p))
                })
                .min_by(|(ca, pa), (cb, pb)| {
                    pa.partial_cmp(pb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| {
                            reference
                                .habitat(*ca)
                                .name
                                .cmp(&reference.habitat(*cb).name)
                        })
                });

            if let Some((companion, companion_price)) = best {
                let blended = w_main * price + w_companion * companion_price;
                if blended < price - 1e-9 {
                    out.push(AllocationOption {
                        demand_idx,
                        bank,
                        tier,
                        kind: OptionKind::Paired,
                        unit_price: blended,
                        components: vec![
                            OptionComponent {
                                habitat: supply,
                                stock_use: w_main,
                                unit_price: price,
                            },
                            OptionComponent {
                                habitat: companion,
                                stock_use: w_companion,
                                unit_price: companion_price,
                            },
                        ],
                    });
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Distinctiveness, Tier};
    use crate::reference::{Bank, Habitat, Stock};
    use std::collections::{HashMap, HashSet};

    fn fixture() -> (Reference, SiteContext) {
        let habitats = vec![
            Habitat {
                name: "Orchard - Traditional orchard".to_string(),
                broader_type: "Orchard".to_string(),
                distinctiveness: Distinctiveness::High,
                ledger: Ledger::Area,
            },
            Habitat {
                name: "Heathland - Mixed scrub".to_string(),
                broader_type: "Heathland and shrub".to_string(),
                distinctiveness: Distinctiveness::Medium,
                ledger: Ledger::Area,
            },
        ];
        let banks = vec![Bank {
            bank_id: "B1".to_string(),
            bank_name: "Orchard Bank".to_string(),
            lpa_name: "Warwick".to_string(),
            nca_name: "Cotswolds".to_string(),
            postcode: None,
            latitude: None,
            longitude: None,
            waterbody_id: None,
            operational_catchment_id: None,
        }];
        let stock = HashMap::from([
            ((0, 0), Stock { available_units: 1.0, reserved_units: 0.0 }),
            ((0, 1), Stock { available_units: 1.0, reserved_units: 0.0 }),
        ]);
        let mut pricing = HashMap::new();
        for (habitat, price) in [(0usize, 32_800.0), (1usize, 20_000.0)] {
            pricing.insert((0, habitat, ContractSize::Fractional, Tier::Adjacent), price);
        }
        let reference = Reference::assemble(
            habitats,
            banks,
            stock,
            pricing,
            HashMap::new(),
            HashMap::new(),
        );

        let site = SiteContext {
            lpa_name: "Stratford-on-Avon".to_string(),
            nca_name: "Arden".to_string(),
            lpa_neighbours: HashSet::from(["Warwick".to_string()]),
            nca_neighbours: HashSet::new(),
            waterbody_id: None,
            operational_catchment_id: None,
        };
        (reference, site)
    }

    fn urban_tree_demand() -> DemandLine {
        DemandLine {
            ledger: Ledger::Area,
            habitat_name: "Urban - Individual trees".to_string(),
            units_required: 0.07,
            distinctiveness: Distinctiveness::Medium,
            broader_type: Some("Urban".to_string()),
        }
    }

    #[test]
    fn test_adjacent_substitute_emits_normal_and_paired() {
        let (reference, site) = fixture();
        let demand = vec![urban_tree_demand()];
        let built = build_options(&reference, &site, &demand, ContractSize::Fractional);

        // Orchard (High) is the only legal supply; scrub pairs with it.
        assert_eq!(built.options.len(), 2);

        let normal = &built.options[0];
        assert_eq!(normal.kind, OptionKind::Normal);
        assert_eq!(normal.tier, Tier::Adjacent);
        assert_eq!(normal.unit_price, 32_800.0);
        assert!((normal.main().stock_use - 4.0 / 3.0).abs() < 1e-12);

        let paired = &built.options[1];
        assert_eq!(paired.kind, OptionKind::Paired);
        assert!((paired.unit_price - 29_600.0).abs() < 1e-9);
        assert_eq!(paired.main().stock_use, 0.75);
        assert_eq!(paired.companion().unwrap().stock_use, 0.25);
        assert_eq!(paired.companion().unwrap().unit_price, 20_000.0);
    }

    #[test]
    fn test_missing_price_discards_option() {
        let (mut reference, site) = fixture();
        // Rebuild without any pricing rows.
        reference = Reference::assemble(
            reference.habitats.clone(),
            reference.banks.clone(),
            HashMap::from([
                ((0, 0), Stock { available_units: 1.0, reserved_units: 0.0 }),
            ]),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        let built = build_options(&reference, &site, &[urban_tree_demand()], ContractSize::Fractional);
        assert!(built.options.is_empty());
    }

    #[test]
    fn test_no_pairing_against_local_banks() {
        let (reference, _) = fixture();
        let site = SiteContext {
            lpa_name: "Warwick".to_string(),
            nca_name: "Cotswolds".to_string(),
            ..Default::default()
        };
        // Local tier has no fractional/local price row in the fixture, so
        // re-price it first.
        let mut pricing = HashMap::new();
        pricing.insert((0usize, 0usize, ContractSize::Fractional, Tier::Local), 30_000.0);
        pricing.insert((0usize, 1usize, ContractSize::Fractional, Tier::Local), 15_000.0);
        let reference = Reference::assemble(
            reference.habitats.clone(),
            reference.banks.clone(),
            HashMap::from([
                ((0, 0), Stock { available_units: 1.0, reserved_units: 0.0 }),
                ((0, 1), Stock { available_units: 1.0, reserved_units: 0.0 }),
            ]),
            pricing,
            HashMap::new(),
            HashMap::new(),
        );

        let built = build_options(&reference, &site, &[urban_tree_demand()], ContractSize::Fractional);
        assert_eq!(built.options.len(), 1);
        assert_eq!(built.options[0].kind, OptionKind::Normal);
        assert_eq!(built.options[0].tier, Tier::Local);
    }

    #[test]
    fn test_exhausted_stock_is_skipped() {
        let (reference, site) = fixture();
        let reference = Reference::assemble(
            reference.habitats.clone(),
            reference.banks.clone(),
            HashMap::from([
                ((0usize, 0usize), Stock { available_units: 1.0, reserved_units: 1.0 }),
                ((0usize, 1usize), Stock { available_units: 1.0, reserved_units: 0.0 }),
            ]),
            HashMap::from([
                ((0usize, 0usize, ContractSize::Fractional, Tier::Adjacent), 32_800.0),
                ((0usize, 1usize, ContractSize::Fractional, Tier::Adjacent), 20_000.0),
            ]),
            HashMap::new(),
            HashMap::new(),
        );
        let built = build_options(&reference, &site, &[urban_tree_demand()], ContractSize::Fractional);
        assert!(built.options.is_empty());
    }

    #[test]
    fn test_watercourse_unresolved_site_warns() {
        let (reference, site) = fixture();
        let demand = vec![DemandLine {
            ledger: Ledger::Watercourse,
            habitat_name: "Rivers and streams".to_string(),
            units_required: 1.0,
            distinctiveness: Distinctiveness::High,
            broader_type: None,
        }];
        let built = build_options(&reference, &site, &demand, ContractSize::Fractional);
        assert_eq!(built.warnings.len(), 1);
        assert!(built.warnings[0].contains("watercourse banks tier as far"));
    }
}
