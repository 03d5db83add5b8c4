//! Site geography resolution.
//!
//! Turns a submitted site identifier (postcode, address, or explicit
//! LPA/NCA names) into the spatial context the allocation engine tiers
//! against.

mod resolver;

pub use resolver::GeographyResolver;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Site identification as submitted by the caller. At least one field must
/// be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lpa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nca: Option<String>,
}

impl SiteInput {
    pub fn is_empty(&self) -> bool {
        self.postcode.is_none()
            && self.address.is_none()
            && self.lpa.is_none()
            && self.nca.is_none()
    }
}

/// Resolved spatial context for a development site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteContext {
    pub lpa_name: String,
    pub nca_name: String,
    pub lpa_neighbours: HashSet<String>,
    pub nca_neighbours: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waterbody_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_catchment_id: Option<String>,
}
