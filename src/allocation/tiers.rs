//! Contract-size selection and bank tier assignment.

use crate::geography::SiteContext;
use crate::models::{ContractSize, DemandLine, Ledger, Tier};
use crate::reference::{BankIdx, Reference};

/// Pick one contract size for the whole job from the aggregate effective
/// units demanded in the area ledger.
pub fn select_contract_size(demand: &[DemandLine], thresholds: [f64; 3]) -> ContractSize {
    let area_units: f64 = demand
        .iter()
        .filter(|d| d.ledger == Ledger::Area)
        .map(|d| d.units_required)
        .sum();

    let [t1, t2, t3] = thresholds;
    if area_units < t1 {
        ContractSize::Fractional
    } else if area_units < t2 {
        ContractSize::Small
    } else if area_units < t3 {
        ContractSize::Medium
    } else {
        ContractSize::Large
    }
}

/// Tier of a bank against the site, on the ledger's axis.
///
/// Area and hedgerow banks tier on LPA/NCA identity and adjacency.
/// Watercourse banks tier on the catchment axis: waterbody match = local,
/// operational-catchment match = adjacent, otherwise far. Banks whose
/// catchment data is unresolved also land on far.
pub fn bank_tier(reference: &Reference, site: &SiteContext, bank: BankIdx, ledger: Ledger) -> Tier {
    let bank = reference.bank(bank);

    if ledger == Ledger::Watercourse {
        let bank_wb = bank.waterbody_id.as_deref();
        let bank_oc = bank.operational_catchment_id.as_deref();
        let site_wb = site.waterbody_id.as_deref();
        let site_oc = site.operational_catchment_id.as_deref();

        if let (Some(a), Some(b)) = (bank_wb, site_wb) {
            if a == b {
                return Tier::Local;
            }
        }
        if let (Some(a), Some(b)) = (bank_oc, site_oc) {
            if a == b {
                return Tier::Adjacent;
            }
        }
        return Tier::Far;
    }

    if bank.lpa_name == site.lpa_name || bank.nca_name == site.nca_name {
        return Tier::Local;
    }
    if site.lpa_neighbours.contains(&bank.lpa_name) || site.nca_neighbours.contains(&bank.nca_name)
    {
        return Tier::Adjacent;
    }
    Tier::Far
}

/// Raw stock units consumed per effective unit for a normal option.
pub fn stock_use_ratio(reference: &Reference, ledger: Ledger, tier: Tier) -> f64 {
    match ledger {
        Ledger::Area | Ledger::Hedgerow => reference.srm(tier),
        Ledger::Watercourse => 1.0 / reference.watercourse_yield(tier),
    }
}
