//! Allocation engine.
//!
//! Builds every legal candidate option for the submitted demand, runs the
//! cost minimiser (LP first, greedy fallback), and post-processes the chosen
//! quantities into the allocation report.

mod bundle;
mod engine;
mod greedy;
mod legality;
mod lp;
mod options;
mod tiers;

pub use engine::{AllocationEngine, EngineSettings};
pub use options::{build_options, BuiltOptions};
pub use tiers::{bank_tier, select_contract_size};

use crate::models::{OptionKind, Tier};
use crate::reference::{BankIdx, HabitatIdx};

/// One supply component of a candidate option. `stock_use` is raw stock
/// units consumed per effective unit drawn through the option: the SRM for
/// normal options, the pairing weight for paired components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionComponent {
    pub habitat: HabitatIdx,
    pub stock_use: f64,
    /// Tier price of this component's habitat, per effective unit.
    pub unit_price: f64,
}

/// A candidate (bank, demand, supply, tier) assignment with its effective
/// unit price. Paired options carry two components whose weights sum to one.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationOption {
    /// Index into the job's demand list.
    pub demand_idx: usize,
    pub bank: BankIdx,
    pub tier: Tier,
    pub kind: OptionKind,
    /// Price charged to the buyer per effective unit (blended for paired).
    pub unit_price: f64,
    pub components: Vec<OptionComponent>,
}

impl AllocationOption {
    pub fn main(&self) -> &OptionComponent {
        &self.components[0]
    }

    pub fn companion(&self) -> Option<&OptionComponent> {
        self.components.get(1)
    }
}

/// Pairing weights (main, companion) by tier. Local tiers never pair; the
/// SRM is already embedded in the weights.
pub fn pairing_weights(tier: Tier) -> Option<(f64, f64)> {
    match tier {
        Tier::Local => None,
        Tier::Adjacent => Some((0.75, 0.25)),
        Tier::Far => Some((0.5, 0.5)),
    }
}
