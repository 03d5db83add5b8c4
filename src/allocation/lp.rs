//! Linear-program formulation of the allocation problem.
//!
//! One nonnegative variable per option (effective units drawn through it),
//! equality constraints on demand, and per-(bank, habitat) stock-capacity
//! constraints weighted by each option's stock-use ratios. Solved with the
//! pure-Rust simplex backend, which is deterministic for a given input.

use std::collections::HashMap;

use good_lp::{constraint, default_solver, variable, variables, Expression, ResolutionError, Solution, SolverModel};
use tracing::debug;

use super::AllocationOption;
use crate::models::DemandLine;
use crate::reference::{BankIdx, HabitatIdx};

/// Per-option perturbation step. Large enough to break ties between
/// equal-cost optima deterministically (preferring earlier, i.e.
/// lexicographically smaller, options), small enough never to flip a real
/// price comparison.
const TIE_BREAK_STEP: f64 = 1e-6;

#[derive(Debug)]
pub enum LpOutcome {
    /// Effective units drawn through each option, index-aligned.
    Solved(Vec<f64>),
    Infeasible,
}

pub fn solve_lp(
    demand: &[DemandLine],
    options: &[AllocationOption],
    capacity: &HashMap<(BankIdx, HabitatIdx), f64>,
) -> anyhow::Result<LpOutcome> {
    if demand.is_empty() {
        return Ok(LpOutcome::Solved(Vec::new()));
    }
    // A demand line no option serves makes the program trivially infeasible;
    // skip the solver.
    for (d, _) in demand.iter().enumerate() {
        if !options.iter().any(|o| o.demand_idx == d) {
            debug!(demand_idx = d, "demand line has no serving options");
            return Ok(LpOutcome::Infeasible);
        }
    }

    let mut vars = variables!();
    let xs: Vec<_> = options.iter().map(|_| vars.add(variable().min(0.0))).collect();

    let mut objective = Expression::from(0.0);
    for (i, (option, &x)) in options.iter().zip(&xs).enumerate() {
        objective += x * (option.unit_price + TIE_BREAK_STEP * (i + 1) as f64);
    }

    let mut model = vars.minimise(objective).using(default_solver);

    for (d, line) in demand.iter().enumerate() {
        let mut served = Expression::from(0.0);
        for (option, &x) in options.iter().zip(&xs) {
            if option.demand_idx == d {
                served += x;
            }
        }
        model = model.with(constraint!(served == line.units_required));
    }

    for (&(bank, habitat), &headroom) in capacity {
        let mut used = Expression::from(0.0);
        let mut touched = false;
        for (option, &x) in options.iter().zip(&xs) {
            for component in &option.components {
                if option.bank == bank && component.habitat == habitat {
                    used += x * component.stock_use;
                    touched = true;
                }
            }
        }
        if touched {
            model = model.with(constraint!(used <= headroom));
        }
    }

    match model.solve() {
        Ok(solution) => {
            let quantities = xs.iter().map(|&x| solution.value(x).max(0.0)).collect();
            Ok(LpOutcome::Solved(quantities))
        }
        Err(ResolutionError::Infeasible) => Ok(LpOutcome::Infeasible),
        Err(e) => Err(anyhow::anyhow!("LP solver failed: {e}")),
    }
}
