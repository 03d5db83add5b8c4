//! Reference data snapshots.
//!
//! A [`Reference`] is a point-in-time, immutable view of the habitat catalog,
//! bank registry, stock ledger, price table, trading rules and spatial-risk
//! multipliers. Banks and habitats live in arenas and every relation is keyed
//! by integer indices, so the star schema needs no back-pointers.

mod store;

pub use store::{spawn_reference_refresher, ReferenceStore};

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{ContractSize, Distinctiveness, Ledger, Tier};

pub type HabitatIdx = usize;
pub type BankIdx = usize;

/// Default spatial-risk multipliers for the area and hedgerow ledgers.
pub const DEFAULT_SRM: [(Tier, f64); 3] = [
    (Tier::Local, 1.0),
    (Tier::Adjacent, 4.0 / 3.0),
    (Tier::Far, 2.0),
];

/// Watercourse multipliers are inverse yields: the buyer must supply
/// `1 / yield` raw units per effective unit.
pub const WATERCOURSE_YIELD: [(Tier, f64); 3] = [
    (Tier::Local, 1.0),
    (Tier::Adjacent, 0.75),
    (Tier::Far, 0.5),
];

#[derive(Debug, Clone)]
pub struct Habitat {
    pub name: String,
    pub broader_type: String,
    pub distinctiveness: Distinctiveness,
    pub ledger: Ledger,
}

#[derive(Debug, Clone)]
pub struct Bank {
    pub bank_id: String,
    pub bank_name: String,
    pub lpa_name: String,
    pub nca_name: String,
    pub postcode: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub waterbody_id: Option<String>,
    pub operational_catchment_id: Option<String>,
}

/// Available and reserved units of one habitat at one bank.
#[derive(Debug, Clone, Copy)]
pub struct Stock {
    pub available_units: f64,
    pub reserved_units: f64,
}

impl Stock {
    /// Units an allocation may actually consume.
    pub fn headroom(&self) -> f64 {
        (self.available_units - self.reserved_units).max(0.0)
    }
}

/// Explicit admissibility edge from a demand habitat to a supply habitat.
/// When any rule exists for a demand habitat, trading for it is rule-scoped.
#[derive(Debug, Clone)]
pub struct TradingRule {
    pub allowed_supply: HabitatIdx,
    pub min_distinctiveness: Option<Distinctiveness>,
    pub companion: Option<HabitatIdx>,
}

/// Immutable reference snapshot handed to each job.
#[derive(Debug)]
pub struct Reference {
    pub habitats: Vec<Habitat>,
    pub banks: Vec<Bank>,
    habitat_index: HashMap<String, HabitatIdx>,
    bank_index: HashMap<String, BankIdx>,
    stock: HashMap<(BankIdx, HabitatIdx), Stock>,
    /// Habitats with a stock row per bank, sorted by habitat name.
    bank_habitats: HashMap<BankIdx, Vec<HabitatIdx>>,
    pricing: HashMap<(BankIdx, HabitatIdx, ContractSize, Tier), f64>,
    trading_rules: HashMap<HabitatIdx, Vec<TradingRule>>,
    srm: HashMap<Tier, f64>,
    pub loaded_at: DateTime<Utc>,
}

impl Reference {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        habitats: Vec<Habitat>,
        banks: Vec<Bank>,
        stock: HashMap<(BankIdx, HabitatIdx), Stock>,
        pricing: HashMap<(BankIdx, HabitatIdx, ContractSize, Tier), f64>,
        trading_rules: HashMap<HabitatIdx, Vec<TradingRule>>,
        srm: HashMap<Tier, f64>,
    ) -> Self {
        let habitat_index = habitats
            .iter()
            .enumerate()
            .map(|(i, h)| (h.name.clone(), i))
            .collect();
        let bank_index = banks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.bank_id.clone(), i))
            .collect();

        let mut bank_habitats: HashMap<BankIdx, Vec<HabitatIdx>> = HashMap::new();
        for &(bank, habitat) in stock.keys() {
            bank_habitats.entry(bank).or_default().push(habitat);
        }
        for list in bank_habitats.values_mut() {
            list.sort_by(|a, b| habitats[*a].name.cmp(&habitats[*b].name));
            list.dedup();
        }

        Self {
            habitats,
            banks,
            habitat_index,
            bank_index,
            stock,
            bank_habitats,
            pricing,
            trading_rules,
            srm,
            loaded_at: Utc::now(),
        }
    }

    pub fn habitat_idx(&self, name: &str) -> Option<HabitatIdx> {
        self.habitat_index.get(name).copied()
    }

    pub fn bank_idx(&self, bank_id: &str) -> Option<BankIdx> {
        self.bank_index.get(bank_id).copied()
    }

    pub fn habitat(&self, idx: HabitatIdx) -> &Habitat {
        &self.habitats[idx]
    }

    pub fn bank(&self, idx: BankIdx) -> &Bank {
        &self.banks[idx]
    }

    pub fn stock(&self, bank: BankIdx, habitat: HabitatIdx) -> Option<Stock> {
        self.stock.get(&(bank, habitat)).copied()
    }

    /// Consumable units of a habitat at a bank; zero when no stock row exists.
    pub fn headroom(&self, bank: BankIdx, habitat: HabitatIdx) -> f64 {
        self.stock
            .get(&(bank, habitat))
            .map(|s| s.headroom())
            .unwrap_or(0.0)
    }

    /// Habitats stocked at a bank, in deterministic (name) order.
    pub fn habitats_at(&self, bank: BankIdx) -> &[HabitatIdx] {
        self.bank_habitats
            .get(&bank)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn price(
        &self,
        bank: BankIdx,
        habitat: HabitatIdx,
        size: ContractSize,
        tier: Tier,
    ) -> Option<f64> {
        self.pricing.get(&(bank, habitat, size, tier)).copied()
    }

    /// Rules scoping trade for a demand habitat; empty when trading falls
    /// back to the distinctiveness ladder.
    pub fn trading_rules_for(&self, demand: HabitatIdx) -> &[TradingRule] {
        self.trading_rules
            .get(&demand)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Spatial-risk multiplier for the area/hedgerow ledgers.
    pub fn srm(&self, tier: Tier) -> f64 {
        if let Some(&m) = self.srm.get(&tier) {
            return m;
        }
        DEFAULT_SRM
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, m)| *m)
            .expect("default SRM covers every tier")
    }

    /// Inverse-yield multiplier for watercourse banks.
    pub fn watercourse_yield(&self, tier: Tier) -> f64 {
        WATERCOURSE_YIELD
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, m)| *m)
            .expect("yield table covers every tier")
    }
}
