//! Engine orchestration.
//!
//! Drives one allocation through its states:
//! `READY -> OPTIONS_BUILT -> LP_RUNNING -> { SOLVED | GREEDY |
//! INFEASIBLE_REPORTED }`. The only recoverable transition is
//! `LP_RUNNING -> GREEDY`, taken when the LP reports infeasible.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::bundle::bundle;
use super::greedy::solve_greedy;
use super::lp::{solve_lp, LpOutcome};
use super::options::build_options;
use super::tiers::select_contract_size;
use super::AllocationOption;
use crate::geography::SiteContext;
use crate::models::{
    AllocationReport, DemandLine, Shortfall, SolverSelection,
};
use crate::reference::{BankIdx, HabitatIdx, Reference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Ready,
    OptionsBuilt,
    LpRunning,
    Solved,
    Greedy,
    InfeasibleReported,
}

/// Engine knobs taken from process configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub contract_size_thresholds: [f64; 3],
    pub solver: SolverSelection,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            contract_size_thresholds: [1.0, 5.0, 15.0],
            solver: SolverSelection::LpFirst,
        }
    }
}

/// One-shot allocation run over an immutable reference snapshot.
pub struct AllocationEngine<'a> {
    reference: &'a Reference,
    site: &'a SiteContext,
    settings: EngineSettings,
}

impl<'a> AllocationEngine<'a> {
    pub fn new(reference: &'a Reference, site: &'a SiteContext, settings: EngineSettings) -> Self {
        Self {
            reference,
            site,
            settings,
        }
    }

    pub fn run(&self, demand: &[DemandLine]) -> AllocationReport {
        let mut state = EngineState::Ready;
        debug!(state = ?state, lines = demand.len(), "allocation run starting");
        let contract_size = select_contract_size(demand, self.settings.contract_size_thresholds);

        if demand.is_empty() {
            return AllocationReport {
                allocations: Vec::new(),
                total_cost: 0.0,
                contract_size,
                shortfalls: Vec::new(),
                warnings: Vec::new(),
            };
        }

        let built = build_options(self.reference, self.site, demand, contract_size);
        let mut warnings = built.warnings;
        state = EngineState::OptionsBuilt;
        debug!(
            state = ?state,
            options = built.options.len(),
            contract_size = contract_size.as_str(),
            "candidate options built"
        );

        let capacity = capacity_map(self.reference, &built.options);

        let quantities = match self.settings.solver {
            SolverSelection::LpFirst => {
                state = EngineState::LpRunning;
                debug!(state = ?state, "cost minimisation starting");
                match solve_lp(demand, &built.options, &capacity) {
                    Ok(LpOutcome::Solved(q)) => {
                        state = EngineState::Solved;
                        q
                    }
                    Ok(LpOutcome::Infeasible) => {
                        info!("LP infeasible; falling back to greedy allocation");
                        warnings
                            .push("demand cannot be fully met; best-effort allocation".to_string());
                        state = EngineState::Greedy;
                        solve_greedy(demand, &built.options, &capacity)
                    }
                    Err(e) => {
                        warn!(error = %e, "LP solver error; falling back to greedy allocation");
                        warnings.push("cost minimiser unavailable; greedy allocation used".to_string());
                        state = EngineState::Greedy;
                        solve_greedy(demand, &built.options, &capacity)
                    }
                }
            }
            SolverSelection::GreedyOnly => {
                state = EngineState::Greedy;
                solve_greedy(demand, &built.options, &capacity)
            }
        };

        let shortfalls = compute_shortfalls(demand, &built.options, &quantities);
        let bundled = bundle(self.reference, demand, &built.options, &quantities);

        if bundled.rows.is_empty() {
            state = EngineState::InfeasibleReported;
        }
        debug!(state = ?state, rows = bundled.rows.len(), shortfalls = shortfalls.len(), "allocation finished");

        AllocationReport {
            allocations: bundled.rows,
            total_cost: bundled.total_cost,
            contract_size,
            shortfalls,
            warnings,
        }
    }
}

/// Stock headroom of every (bank, habitat) the options touch.
fn capacity_map(
    reference: &Reference,
    options: &[AllocationOption],
) -> HashMap<(BankIdx, HabitatIdx), f64> {
    let mut capacity = HashMap::new();
    for option in options {
        for component in &option.components {
            capacity
                .entry((option.bank, component.habitat))
                .or_insert_with(|| reference.headroom(option.bank, component.habitat));
        }
    }
    capacity
}

fn compute_shortfalls(
    demand: &[DemandLine],
    options: &[AllocationOption],
    quantities: &[f64],
) -> Vec<Shortfall> {
    let mut delivered = vec![0.0; demand.len()];
    for (option, &x) in options.iter().zip(quantities) {
        delivered[option.demand_idx] += x;
    }

    demand
        .iter()
        .zip(&delivered)
        .filter(|(line, &got)| got + 1e-6 < line.units_required)
        .map(|(line, &got)| Shortfall {
            ledger: line.ledger,
            habitat_name: line.habitat_name.clone(),
            units_unmet: line.units_required - got,
        })
        .collect()
}
