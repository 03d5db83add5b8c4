//! Substitute legality: which bank habitats may serve a demand line.
//!
//! An explicit trading rule for a demand habitat scopes its trade entirely;
//! there is no fallback to the distinctiveness ladder. Without rules, the
//! ladder of the demand's ledger applies, with like-for-like always legal.

use crate::models::{DemandLine, Distinctiveness, Ledger};
use crate::reference::{HabitatIdx, Reference};

/// Whether `supply` may serve `demand`.
pub fn is_legal_supply(reference: &Reference, demand: &DemandLine, supply: HabitatIdx) -> bool {
    let supply_habitat = reference.habitat(supply);
    if supply_habitat.ledger != demand.ledger {
        return false;
    }

    // Net-gain residuals accept any habitat of Low-or-higher distinctiveness
    // within the ledger.
    if demand.is_net_gain() {
        return supply_habitat.distinctiveness >= Distinctiveness::Low;
    }

    // Rule-scoped trade: only the listed supplies are legal, regardless of
    // distinctiveness.
    if let Some(demand_idx) = reference.habitat_idx(&demand.habitat_name) {
        let rules = reference.trading_rules_for(demand_idx);
        if !rules.is_empty() {
            return rules.iter().any(|rule| {
                rule.allowed_supply == supply
                    && rule
                        .min_distinctiveness
                        .map(|min| supply_habitat.distinctiveness >= min)
                        .unwrap_or(true)
            });
        }
    }

    // Like-for-like is always legal.
    if supply_habitat.name == demand.habitat_name {
        return true;
    }

    let (d_dist, d_broader) = demand_attributes(reference, demand);

    match demand.ledger {
        Ledger::Area => area_ladder(d_dist, d_broader.as_deref(), supply_habitat.distinctiveness, &supply_habitat.broader_type),
        // Cross-habitat hedgerow supply must be strictly more distinctive.
        Ledger::Hedgerow => supply_habitat.distinctiveness > d_dist,
        // Watercourse demand only trades within the same habitat.
        Ledger::Watercourse => false,
    }
}

/// Companion habitats eligible to pair with `main` for this demand at a
/// bank. Trading rules that name companions scope the choice; otherwise any
/// same-ledger habitat stocked at the bank qualifies, riding on the main
/// supply's legality.
pub fn pairing_candidates(
    reference: &Reference,
    demand: &DemandLine,
    bank_habitats: &[HabitatIdx],
    main: HabitatIdx,
) -> Vec<HabitatIdx> {
    let rule_companions: Option<Vec<HabitatIdx>> = reference
        .habitat_idx(&demand.habitat_name)
        .map(|demand_idx| {
            reference
                .trading_rules_for(demand_idx)
                .iter()
                .filter_map(|rule| rule.companion)
                .collect::<Vec<_>>()
        })
        .filter(|companions: &Vec<HabitatIdx>| !companions.is_empty());

    bank_habitats
        .iter()
        .copied()
        .filter(|&h| h != main)
        .filter(|&h| match &rule_companions {
            Some(companions) => companions.contains(&h),
            None => reference.habitat(h).ledger == demand.ledger,
        })
        .collect()
}

/// Demand-side distinctiveness and broader type, preferring the catalog when
/// the habitat is known.
fn demand_attributes(reference: &Reference, demand: &DemandLine) -> (Distinctiveness, Option<String>) {
    match reference.habitat_idx(&demand.habitat_name) {
        Some(idx) => {
            let h = reference.habitat(idx);
            (h.distinctiveness, Some(h.broader_type.clone()))
        }
        None => (demand.distinctiveness, demand.broader_type.clone()),
    }
}

/// Area ladder: Very High and High demand trades like-for-like only; Medium
/// accepts same-broader-group Medium or anything High+; Low and Very Low
/// accept anything at their band or above.
fn area_ladder(
    d_dist: Distinctiveness,
    d_broader: Option<&str>,
    s_dist: Distinctiveness,
    s_broader: &str,
) -> bool {
    match d_dist {
        Distinctiveness::VeryHigh | Distinctiveness::High => false,
        Distinctiveness::Medium => {
            let same_group = d_broader.map(|b| b == s_broader).unwrap_or(false);
            (s_dist == Distinctiveness::Medium && same_group) || s_dist >= Distinctiveness::High
        }
        Distinctiveness::Low => s_dist >= Distinctiveness::Low,
        Distinctiveness::VeryLow => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DemandLine;
    use crate::reference::{Habitat, TradingRule};
    use std::collections::HashMap;

    fn habitat(name: &str, broader: &str, dist: Distinctiveness, ledger: Ledger) -> Habitat {
        Habitat {
            name: name.to_string(),
            broader_type: broader.to_string(),
            distinctiveness: dist,
            ledger,
        }
    }

    fn reference(habitats: Vec<Habitat>, rules: HashMap<usize, Vec<TradingRule>>) -> Reference {
        Reference::assemble(
            habitats,
            Vec::new(),
            HashMap::new(),
            HashMap::new(),
            rules,
            HashMap::new(),
        )
    }

    fn demand(name: &str, ledger: Ledger, dist: Distinctiveness) -> DemandLine {
        DemandLine {
            ledger,
            habitat_name: name.to_string(),
            units_required: 1.0,
            distinctiveness: dist,
            broader_type: None,
        }
    }

    #[test]
    fn test_like_for_like_always_legal() {
        let r = reference(
            vec![habitat("Rivers and streams", "Watercourses", Distinctiveness::High, Ledger::Watercourse)],
            HashMap::new(),
        );
        let d = demand("Rivers and streams", Ledger::Watercourse, Distinctiveness::High);
        assert!(is_legal_supply(&r, &d, 0));
    }

    #[test]
    fn test_area_medium_ladder() {
        let r = reference(
            vec![
                habitat("Grassland - Other neutral grassland", "Grassland", Distinctiveness::Medium, Ledger::Area),
                habitat("Grassland - Traditional meadow", "Grassland", Distinctiveness::Medium, Ledger::Area),
                habitat("Heathland - Mixed scrub", "Heathland and shrub", Distinctiveness::Medium, Ledger::Area),
                habitat("Woodland - Lowland beech", "Woodland", Distinctiveness::High, Ledger::Area),
            ],
            HashMap::new(),
        );
        let d = demand("Grassland - Other neutral grassland", Ledger::Area, Distinctiveness::Medium);

        assert!(is_legal_supply(&r, &d, 1)); // same group, Medium
        assert!(!is_legal_supply(&r, &d, 2)); // other group, Medium
        assert!(is_legal_supply(&r, &d, 3)); // High beats the group test
    }

    #[test]
    fn test_area_high_is_like_for_like_only() {
        let r = reference(
            vec![
                habitat("Woodland - Lowland beech", "Woodland", Distinctiveness::High, Ledger::Area),
                habitat("Woodland - Wet woodland", "Woodland", Distinctiveness::High, Ledger::Area),
            ],
            HashMap::new(),
        );
        let d = demand("Woodland - Lowland beech", Ledger::Area, Distinctiveness::High);
        assert!(is_legal_supply(&r, &d, 0));
        assert!(!is_legal_supply(&r, &d, 1));
    }

    #[test]
    fn test_trading_rule_scopes_supply() {
        // Rule allows only habitat 1, even though habitat 2 is higher band.
        let rules = HashMap::from([(
            0usize,
            vec![TradingRule {
                allowed_supply: 1,
                min_distinctiveness: None,
                companion: None,
            }],
        )]);
        let r = reference(
            vec![
                habitat("Urban - Individual trees", "Urban", Distinctiveness::Medium, Ledger::Area),
                habitat("Orchard - Traditional orchard", "Orchard", Distinctiveness::High, Ledger::Area),
                habitat("Wetland - Lowland fen", "Wetland", Distinctiveness::VeryHigh, Ledger::Area),
            ],
            rules,
        );
        let d = demand("Urban - Individual trees", Ledger::Area, Distinctiveness::Medium);

        assert!(is_legal_supply(&r, &d, 1));
        assert!(!is_legal_supply(&r, &d, 2));
        // Rule-scoped: like-for-like not implicitly allowed either.
        assert!(!is_legal_supply(&r, &d, 0));
    }

    #[test]
    fn test_trading_rule_min_distinctiveness() {
        let rules = HashMap::from([(
            0usize,
            vec![TradingRule {
                allowed_supply: 1,
                min_distinctiveness: Some(Distinctiveness::VeryHigh),
                companion: None,
            }],
        )]);
        let r = reference(
            vec![
                habitat("A", "G", Distinctiveness::Medium, Ledger::Area),
                habitat("B", "G", Distinctiveness::High, Ledger::Area),
            ],
            rules,
        );
        let d = demand("A", Ledger::Area, Distinctiveness::Medium);
        assert!(!is_legal_supply(&r, &d, 1));
    }

    #[test]
    fn test_net_gain_accepts_low_and_above() {
        let r = reference(
            vec![
                habitat("Grassland - Modified grassland", "Grassland", Distinctiveness::VeryLow, Ledger::Area),
                habitat("Grassland - Bracken", "Grassland", Distinctiveness::Low, Ledger::Area),
                habitat("Native hedgerow", "Hedgerows", Distinctiveness::Medium, Ledger::Hedgerow),
            ],
            HashMap::new(),
        );
        let d = DemandLine::net_gain(Ledger::Area, 1.0);
        assert!(!is_legal_supply(&r, &d, 0)); // Very Low rejected
        assert!(is_legal_supply(&r, &d, 1));
        assert!(!is_legal_supply(&r, &d, 2)); // wrong ledger
    }

    #[test]
    fn test_hedgerow_requires_strictly_greater_cross_habitat() {
        let r = reference(
            vec![
                habitat("Native hedgerow", "Hedgerows", Distinctiveness::Medium, Ledger::Hedgerow),
                habitat("Species-rich native hedgerow", "Hedgerows", Distinctiveness::High, Ledger::Hedgerow),
                habitat("Line of trees", "Hedgerows", Distinctiveness::Medium, Ledger::Hedgerow),
            ],
            HashMap::new(),
        );
        let d = demand("Native hedgerow", Ledger::Hedgerow, Distinctiveness::Medium);
        assert!(is_legal_supply(&r, &d, 1));
        assert!(!is_legal_supply(&r, &d, 2));
    }

    #[test]
    fn test_watercourse_same_habitat_only() {
        let r = reference(
            vec![
                habitat("Rivers and streams", "Watercourses", Distinctiveness::High, Ledger::Watercourse),
                habitat("Ditches", "Watercourses", Distinctiveness::VeryHigh, Ledger::Watercourse),
            ],
            HashMap::new(),
        );
        let d = demand("Rivers and streams", Ledger::Watercourse, Distinctiveness::High);
        assert!(is_legal_supply(&r, &d, 0));
        assert!(!is_legal_supply(&r, &d, 1));
    }

    #[test]
    fn test_pairing_candidates_rule_scoped() {
        let rules = HashMap::from([(
            0usize,
            vec![TradingRule {
                allowed_supply: 1,
                min_distinctiveness: None,
                companion: Some(2),
            }],
        )]);
        let r = reference(
            vec![
                habitat("Urban - Individual trees", "Urban", Distinctiveness::Medium, Ledger::Area),
                habitat("Orchard - Traditional orchard", "Orchard", Distinctiveness::High, Ledger::Area),
                habitat("Heathland - Mixed scrub", "Heathland and shrub", Distinctiveness::Medium, Ledger::Area),
                habitat("Wetland - Lowland fen", "Wetland", Distinctiveness::VeryHigh, Ledger::Area),
            ],
            rules,
        );
        let d = demand("Urban - Individual trees", Ledger::Area, Distinctiveness::Medium);
        let candidates = pairing_candidates(&r, &d, &[1, 2, 3], 1);
        assert_eq!(candidates, vec![2]);
    }

    #[test]
    fn test_pairing_candidates_default_to_same_ledger() {
        let r = reference(
            vec![
                habitat("Orchard - Traditional orchard", "Orchard", Distinctiveness::High, Ledger::Area),
                habitat("Heathland - Mixed scrub", "Heathland and shrub", Distinctiveness::Medium, Ledger::Area),
                habitat("Native hedgerow", "Hedgerows", Distinctiveness::Medium, Ledger::Hedgerow),
            ],
            HashMap::new(),
        );
        // Companion need not be a legal supply itself, only co-located and in
        // the same ledger.
        let d = demand("Urban - Individual trees", Ledger::Area, Distinctiveness::Medium);
        let candidates = pairing_candidates(&r, &d, &[0, 1, 2], 0);
        assert_eq!(candidates, vec![1]);
    }
}
