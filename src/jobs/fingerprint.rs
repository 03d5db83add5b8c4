//! Deterministic job fingerprints.
//!
//! Inputs are canonicalised (demand sorted where order is irrelevant,
//! workbook bytes collapsed to their digest) and hashed with SHA-256 under
//! a version prefix. Two submissions with the same fingerprint share a
//! cached result.

use serde_json::json;
use sha2::{Digest, Sha256};

use super::JobInputs;

/// Bump when the canonical form changes.
pub const FINGERPRINT_VERSION: &str = "JOBFP_V1";

pub fn fingerprint_inputs(inputs: &JobInputs) -> String {
    let mut demand = inputs.demand.clone();
    demand.sort_by(|a, b| {
        a.ledger
            .map(|l| l.as_str())
            .unwrap_or("")
            .cmp(b.ledger.map(|l| l.as_str()).unwrap_or(""))
            .then_with(|| a.habitat.cmp(&b.habitat))
            .then_with(|| a.units.partial_cmp(&b.units).unwrap_or(std::cmp::Ordering::Equal))
    });

    let metric_digest = inputs.metric_file.as_deref().map(|bytes| {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    });

    // serde_json serialises object keys in sorted order, which makes this
    // value the canonical form.
    let canonical = json!({
        "demand": demand,
        "site": inputs.site,
        "metric_sha256": metric_digest,
        "options": inputs.options,
    });

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geography::SiteInput;
    use crate::jobs::DemandSpec;
    use crate::models::Ledger;

    fn spec(habitat: &str, units: f64) -> DemandSpec {
        DemandSpec {
            habitat: habitat.to_string(),
            units,
            ledger: Some(Ledger::Area),
            distinctiveness: None,
            broader_type: None,
        }
    }

    fn inputs(demand: Vec<DemandSpec>) -> JobInputs {
        JobInputs {
            demand,
            site: SiteInput {
                postcode: Some("CV37 6HB".to_string()),
                ..Default::default()
            },
            metric_file: None,
            options: Default::default(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint_inputs(&inputs(vec![spec("A", 1.0), spec("B", 2.0)]));
        let b = fingerprint_inputs(&inputs(vec![spec("A", 1.0), spec("B", 2.0)]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_demand_order_is_irrelevant() {
        let a = fingerprint_inputs(&inputs(vec![spec("A", 1.0), spec("B", 2.0)]));
        let b = fingerprint_inputs(&inputs(vec![spec("B", 2.0), spec("A", 1.0)]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_units_change_the_fingerprint() {
        let a = fingerprint_inputs(&inputs(vec![spec("A", 1.0)]));
        let b = fingerprint_inputs(&inputs(vec![spec("A", 1.01)]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_site_changes_the_fingerprint() {
        let mut with_other_site = inputs(vec![spec("A", 1.0)]);
        with_other_site.site.postcode = Some("B1 1AA".to_string());
        let a = fingerprint_inputs(&inputs(vec![spec("A", 1.0)]));
        let b = fingerprint_inputs(&with_other_site);
        assert_ne!(a, b);
    }

    #[test]
    fn test_metric_bytes_change_the_fingerprint() {
        let mut with_metric = inputs(vec![spec("A", 1.0)]);
        with_metric.metric_file = Some(vec![1, 2, 3]);
        let a = fingerprint_inputs(&inputs(vec![spec("A", 1.0)]));
        let b = fingerprint_inputs(&with_metric);
        assert_ne!(a, b);

        let mut other_metric = inputs(vec![spec("A", 1.0)]);
        other_metric.metric_file = Some(vec![1, 2, 4]);
        assert_ne!(fingerprint_inputs(&with_metric), fingerprint_inputs(&other_metric));
    }
}
