//! Greedy fallback allocator.
//!
//! Always available when the LP reports infeasible, and doubles as the
//! oracle for property tests on small instances. Demand lines are served in
//! descending (distinctiveness, units) order; each takes its cheapest
//! options first until demand or stock runs out. Unmet demand surfaces as a
//! shortfall upstream.

use std::collections::HashMap;

use super::AllocationOption;
use crate::models::DemandLine;
use crate::reference::{BankIdx, HabitatIdx};

/// Effective units drawn through each option, index-aligned with `options`.
pub fn solve_greedy(
    demand: &[DemandLine],
    options: &[AllocationOption],
    capacity: &HashMap<(BankIdx, HabitatIdx), f64>,
) -> Vec<f64> {
    let mut quantities = vec![0.0; options.len()];
    let mut remaining: HashMap<(BankIdx, HabitatIdx), f64> = capacity.clone();

    let mut order: Vec<usize> = (0..demand.len()).collect();
    order.sort_by(|&a, &b| {
        demand[b]
            .distinctiveness
            .cmp(&demand[a].distinctiveness)
            .then_with(|| {
                demand[b]
                    .units_required
                    .partial_cmp(&demand[a].units_required)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| demand[a].habitat_name.cmp(&demand[b].habitat_name))
    });

    for d in order {
        let mut need = demand[d].units_required;

        let mut candidates: Vec<usize> = options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.demand_idx == d)
            .map(|(i, _)| i)
            .collect();
        // Options are already in deterministic order; sort by price only and
        // let that order break ties.
        candidates.sort_by(|&a, &b| {
            options[a]
                .unit_price
                .partial_cmp(&options[b].unit_price)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        for idx in candidates {
            if need <= 1e-9 {
                break;
            }
            let option = &options[idx];

            // The option can deliver as much as its scarcest component allows.
            let mut max_effective = f64::INFINITY;
            for component in &option.components {
                let headroom = remaining
                    .get(&(option.bank, component.habitat))
                    .copied()
                    .unwrap_or(0.0);
                if component.stock_use > 0.0 {
                    max_effective = max_effective.min(headroom / component.stock_use);
                }
            }

            let take = need.min(max_effective);
            if take <= 1e-9 {
                continue;
            }

            quantities[idx] += take;
            need -= take;
            for component in &option.components {
                if let Some(h) = remaining.get_mut(&(option.bank, component.habitat)) {
                    *h -= take * component.stock_use;
                }
            }
        }
    }

    quantities
}
