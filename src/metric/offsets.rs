//! On-site offsetting under per-ledger trading rules.
//!
//! Deficits are netted against same-site surpluses before anything reaches
//! the allocation engine. Each ledger has its own eligibility ladder;
//! consumption is greedy by descending deficit distinctiveness, taking the
//! least-distinctive eligible surplus first.

use super::MetricRow;
use crate::models::{DemandLine, Distinctiveness, Ledger};

/// Result of offset application for one ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetOutcome {
    /// Residual off-site demand, one line per unmet deficit row.
    pub demand: Vec<DemandLine>,
    /// Surplus units left over after offsetting; absorbs the net-gain target.
    pub remaining_surplus: f64,
    pub warnings: Vec<String>,
}

struct Deficit {
    habitat_name: String,
    broader_type: Option<String>,
    distinctiveness: Option<Distinctiveness>,
    need: f64,
}

struct Surplus {
    habitat_name: String,
    broader_type: Option<String>,
    distinctiveness: Distinctiveness,
    have: f64,
}

pub fn apply_offsets(ledger: Ledger, rows: Vec<MetricRow>) -> OffsetOutcome {
    let mut warnings = Vec::new();
    let mut deficits: Vec<Deficit> = Vec::new();
    let mut surpluses: Vec<Surplus> = Vec::new();

    for row in rows {
        if row.net_units < 0.0 {
            deficits.push(Deficit {
                habitat_name: row.habitat_name,
                broader_type: row.broader_type,
                distinctiveness: row.distinctiveness,
                need: -row.net_units,
            });
        } else if row.net_units > 0.0 {
            match row.distinctiveness {
                Some(d) => surpluses.push(Surplus {
                    habitat_name: row.habitat_name,
                    broader_type: row.broader_type,
                    distinctiveness: d,
                    have: row.net_units,
                }),
                None => warnings.push(format!(
                    "surplus row '{}' has unresolved distinctiveness; excluded from offsetting",
                    row.habitat_name
                )),
            }
        }
    }

    // Highest-distinctiveness deficits claim surplus first.
    deficits.sort_by(|a, b| {
        let ra = a.distinctiveness.map(|d| d.rank()).unwrap_or(0);
        let rb = b.distinctiveness.map(|d| d.rank()).unwrap_or(0);
        rb.cmp(&ra).then_with(|| a.habitat_name.cmp(&b.habitat_name))
    });

    for deficit in &mut deficits {
        let Some(d_dist) = deficit.distinctiveness else {
            // Flagged upstream; flows through untraded.
            continue;
        };

        let mut eligible: Vec<usize> = surpluses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.have > 0.0 && offsettable(ledger, deficit, d_dist, s))
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by(|&a, &b| {
            surpluses[a]
                .distinctiveness
                .cmp(&surpluses[b].distinctiveness)
                .then_with(|| surpluses[a].habitat_name.cmp(&surpluses[b].habitat_name))
        });

        for idx in eligible {
            if deficit.need <= 1e-9 {
                break;
            }
            let take = deficit.need.min(surpluses[idx].have);
            deficit.need -= take;
            surpluses[idx].have -= take;
        }
    }

    let demand = deficits
        .into_iter()
        .filter(|d| d.need > 1e-9)
        .map(|d| DemandLine {
            ledger,
            habitat_name: d.habitat_name,
            units_required: d.need,
            // Untagged deficits trade like-for-like only.
            distinctiveness: d.distinctiveness.unwrap_or(Distinctiveness::VeryHigh),
            broader_type: d.broader_type,
        })
        .collect();

    let remaining_surplus = surpluses.iter().map(|s| s.have.max(0.0)).sum();

    OffsetOutcome {
        demand,
        remaining_surplus,
        warnings,
    }
}

fn offsettable(ledger: Ledger, deficit: &Deficit, d_dist: Distinctiveness, surplus: &Surplus) -> bool {
    match ledger {
        Ledger::Area => area_offsettable(deficit, d_dist, surplus),
        Ledger::Hedgerow => {
            d_dist != Distinctiveness::VeryHigh && surplus.distinctiveness > d_dist
        }
        Ledger::Watercourse => watercourse_offsettable(deficit, d_dist, surplus),
    }
}

/// Area ladder: Very High & High are like-for-like; Medium accepts same
/// broader-type Medium or anything High+; Low accepts anything Low+.
fn area_offsettable(deficit: &Deficit, d_dist: Distinctiveness, surplus: &Surplus) -> bool {
    match d_dist {
        Distinctiveness::VeryHigh | Distinctiveness::High => {
            surplus.habitat_name == deficit.habitat_name
        }
        Distinctiveness::Medium => {
            let same_group = matches!(
                (&deficit.broader_type, &surplus.broader_type),
                (Some(a), Some(b)) if a == b
            );
            (surplus.distinctiveness == Distinctiveness::Medium && same_group)
                || surplus.distinctiveness >= Distinctiveness::High
        }
        Distinctiveness::Low => surplus.distinctiveness >= Distinctiveness::Low,
        Distinctiveness::VeryLow => true,
    }
}

/// Watercourse ladder: Very High never; High/Medium same habitat at >= band;
/// Low same habitat at a strictly greater band.
fn watercourse_offsettable(
    deficit: &Deficit,
    d_dist: Distinctiveness,
    surplus: &Surplus,
) -> bool {
    if surplus.habitat_name != deficit.habitat_name {
        return false;
    }
    match d_dist {
        Distinctiveness::VeryHigh => false,
        Distinctiveness::High | Distinctiveness::Medium => surplus.distinctiveness >= d_dist,
        Distinctiveness::Low | Distinctiveness::VeryLow => surplus.distinctiveness > d_dist,
    }
}
