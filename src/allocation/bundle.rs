//! Bundling and report construction.
//!
//! Selected quantities are grouped per (demand, bank, supply, tier, kind,
//! companion), rounded up to the nearest 0.01 (the only rounding step in
//! the pipeline), and re-costed from the rounded units. Paired bundles
//! split into one row per component with the configured weights.

use std::collections::BTreeMap;

use super::AllocationOption;
use crate::models::{round_up_hundredth, AllocationRow, DemandLine, OptionKind, PairedPart};
use crate::reference::Reference;

#[derive(Debug, Default)]
pub struct BundleOutcome {
    pub rows: Vec<AllocationRow>,
    pub total_cost: f64,
}

pub fn bundle(
    reference: &Reference,
    demand: &[DemandLine],
    options: &[AllocationOption],
    quantities: &[f64],
) -> BundleOutcome {
    // BTreeMap keys give the deterministic (bank_id, habitat_name) row order
    // for free.
    type Key = (String, String, usize, u8, OptionKind, Option<usize>);
    let mut groups: BTreeMap<Key, GroupAccumulator> = BTreeMap::new();

    for (option, &x) in options.iter().zip(quantities) {
        if x <= 1e-9 {
            continue;
        }
        let bank = reference.bank(option.bank);
        let main = option.main();
        let key = (
            bank.bank_id.clone(),
            reference.habitat(main.habitat).name.clone(),
            option.demand_idx,
            option.tier as u8,
            option.kind,
            option.companion().map(|c| c.habitat),
        );
        let entry = groups.entry(key).or_insert_with(|| GroupAccumulator {
            option: option.clone(),
            effective_units: 0.0,
        });
        entry.effective_units += x;
    }

    let mut out = BundleOutcome::default();

    for acc in groups.into_values() {
        let option = &acc.option;
        let line = &demand[option.demand_idx];
        let bank = reference.bank(option.bank);
        let bundled = round_up_hundredth(acc.effective_units);

        match option.kind {
            OptionKind::Normal => {
                let main = option.main();
                let cost = bundled * option.unit_price;
                out.total_cost += cost;
                out.rows.push(AllocationRow {
                    bank_id: bank.bank_id.clone(),
                    bank_name: bank.bank_name.clone(),
                    demand_habitat: line.habitat_name.clone(),
                    supply_habitat: reference.habitat(main.habitat).name.clone(),
                    ledger: line.ledger,
                    tier: option.tier,
                    option_kind: OptionKind::Normal,
                    units_supplied: bundled,
                    effective_units: bundled,
                    stock_units_consumed: bundled * main.stock_use,
                    unit_price: option.unit_price,
                    cost,
                    paired_parts: None,
                });
            }
            OptionKind::Paired => {
                let parts: Vec<PairedPart> = option
                    .components
                    .iter()
                    .map(|component| {
                        let units = bundled * component.stock_use;
                        PairedPart {
                            supply_habitat: reference.habitat(component.habitat).name.clone(),
                            weight: component.stock_use,
                            unit_price: component.unit_price,
                            units_supplied: units,
                            stock_units_consumed: units,
                        }
                    })
                    .collect();

                for (i, component) in option.components.iter().enumerate() {
                    let units = bundled * component.stock_use;
                    let cost = units * component.unit_price;
                    out.total_cost += cost;
                    out.rows.push(AllocationRow {
                        bank_id: bank.bank_id.clone(),
                        bank_name: bank.bank_name.clone(),
                        demand_habitat: line.habitat_name.clone(),
                        supply_habitat: reference.habitat(component.habitat).name.clone(),
                        ledger: line.ledger,
                        tier: option.tier,
                        option_kind: OptionKind::Paired,
                        units_supplied: units,
                        // Each component delivers its weighted share of the
                        // bundle's effective quantity.
                        effective_units: units,
                        stock_units_consumed: units,
                        unit_price: component.unit_price,
                        cost,
                        // The main row carries the full blend description.
                        paired_parts: (i == 0).then(|| parts.clone()),
                    });
                }
            }
        }
    }

    out
}

struct GroupAccumulator {
    option: AllocationOption,
    effective_units: f64,
}
