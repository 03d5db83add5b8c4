//! Geography resolution against external services.
//!
//! Three lookup shapes feed a [`SiteContext`]: postcode (geocode via a
//! postcodes.io-style API), free-text address (geocoder), or explicit
//! LPA/NCA names (no geocoding; representative point from the LPA polygon).
//! Boundary layers are ArcGIS-style feature services; adjacency comes from a
//! polygon-intersection query against the layer itself, so neighbour sets
//! stay precomputed on the service side.
//!
//! Neighbour sets cache for an hour, geocodes for a day. Failures on one
//! axis degrade to an empty neighbour set rather than failing the job.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{SiteContext, SiteInput};
use crate::models::{Config, ErrorKind, JobError};

const LPA_NAME_FIELD: &str = "LPA23NM";
const NCA_NAME_FIELD: &str = "NCA_Name";

#[derive(Debug, Clone, Copy)]
struct GeoPoint {
    lat: f64,
    lon: f64,
}

struct TimedCache<T> {
    entries: Mutex<HashMap<String, (T, i64)>>,
    ttl_secs: i64,
}

impl<T: Clone> TimedCache<T> {
    fn new(ttl_secs: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_secs,
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|(_, at)| now - at <= self.ttl_secs)
            .map(|(v, _)| v.clone())
    }

    fn put(&self, key: String, value: T) {
        self.entries
            .lock()
            .insert(key, (value, Utc::now().timestamp()));
    }
}

/// Resolver over the external geography services.
pub struct GeographyResolver {
    http: reqwest::Client,
    postcode_api_base: String,
    geocoder_api_base: String,
    lpa_layer_base: String,
    nca_layer_base: String,
    catchment_api_base: String,
    geocode_cache: TimedCache<(f64, f64)>,
    neighbour_cache: TimedCache<HashSet<String>>,
}

impl GeographyResolver {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("bng-optimiser/0.1 (geography resolver)")
            .build()?;

        Ok(Self {
            http,
            postcode_api_base: config.postcode_api_base.clone(),
            geocoder_api_base: config.geocoder_api_base.clone(),
            lpa_layer_base: config.lpa_layer_base.clone(),
            nca_layer_base: config.nca_layer_base.clone(),
            catchment_api_base: config.catchment_api_base.clone(),
            geocode_cache: TimedCache::new(config.geocode_cache_ttl_secs),
            neighbour_cache: TimedCache::new(config.neighbour_cache_ttl_secs),
        })
    }

    /// Resolve a site input to its context. Returns the context and any
    /// degradation warnings.
    pub async fn resolve(&self, input: &SiteInput) -> Result<(SiteContext, Vec<String>), JobError> {
        if input.is_empty() {
            return Err(JobError::new(
                ErrorKind::GeographyUnresolved,
                "site needs a postcode, an address, or explicit lpa/nca names",
            ));
        }

        let mut warnings = Vec::new();

        // Explicit names skip geocoding entirely.
        if input.lpa.is_some() || input.nca.is_some() {
            let ctx = self.resolve_explicit(input, &mut warnings).await?;
            return Ok((ctx, warnings));
        }

        let point = if let Some(postcode) = &input.postcode {
            self.geocode_postcode(postcode).await?
        } else if let Some(address) = &input.address {
            self.geocode_address(address).await?
        } else {
            return Err(JobError::new(
                ErrorKind::GeographyUnresolved,
                "site needs a postcode, an address, or explicit lpa/nca names",
            ));
        };

        let lpa_name = self.feature_at(&self.lpa_layer_base, LPA_NAME_FIELD, point).await;
        let nca_name = self.feature_at(&self.nca_layer_base, NCA_NAME_FIELD, point).await;

        let (lpa_name, nca_name) = match (lpa_name, nca_name) {
            (None, None) => {
                return Err(JobError::new(
                    ErrorKind::GeographyUnresolved,
                    "site point is outside both the LPA and NCA layers",
                ))
            }
            (lpa, nca) => {
                if lpa.is_none() {
                    warnings.push("no LPA contains the site point; LPA axis skipped".to_string());
                }
                if nca.is_none() {
                    warnings.push("no NCA contains the site point; NCA axis skipped".to_string());
                }
                (lpa.unwrap_or_default(), nca.unwrap_or_default())
            }
        };

        let lpa_neighbours = if lpa_name.is_empty() {
            HashSet::new()
        } else {
            self.neighbours(&self.lpa_layer_base, LPA_NAME_FIELD, &lpa_name, &mut warnings)
                .await
        };
        let nca_neighbours = if nca_name.is_empty() {
            HashSet::new()
        } else {
            self.neighbours(&self.nca_layer_base, NCA_NAME_FIELD, &nca_name, &mut warnings)
                .await
        };

        let (waterbody_id, operational_catchment_id) =
            self.catchment_at(point, &mut warnings).await;

        Ok((
            SiteContext {
                lpa_name,
                nca_name,
                lpa_neighbours,
                nca_neighbours,
                waterbody_id,
                operational_catchment_id,
            },
            warnings,
        ))
    }

    async fn resolve_explicit(
        &self,
        input: &SiteInput,
        warnings: &mut Vec<String>,
    ) -> Result<SiteContext, JobError> {
        let lpa_name = input.lpa.clone().unwrap_or_default();
        let nca_name = input.nca.clone().unwrap_or_default();

        // Validate the LPA name and take the polygon's vertex centroid as the
        // representative point for catchment lookups.
        let mut point = None;
        if !lpa_name.is_empty() {
            match self
                .feature_by_name(&self.lpa_layer_base, LPA_NAME_FIELD, &lpa_name)
                .await
            {
                Ok(Some(centroid)) => point = Some(centroid),
                Ok(None) => {
                    return Err(JobError::new(
                        ErrorKind::GeographyUnresolved,
                        format!("unknown LPA '{lpa_name}'"),
                    ))
                }
                Err(e) => {
                    warn!(error = %e, lpa = %lpa_name, "LPA layer unavailable; proceeding unvalidated");
                    warnings.push(format!("LPA layer unavailable; '{lpa_name}' accepted unvalidated"));
                }
            }
        }

        let lpa_neighbours = if lpa_name.is_empty() {
            warnings.push("no LPA supplied; LPA axis uses an empty neighbour set".to_string());
            HashSet::new()
        } else {
            self.neighbours(&self.lpa_layer_base, LPA_NAME_FIELD, &lpa_name, warnings)
                .await
        };
        let nca_neighbours = if nca_name.is_empty() {
            warnings.push("no NCA supplied; NCA axis uses an empty neighbour set".to_string());
            HashSet::new()
        } else {
            self.neighbours(&self.nca_layer_base, NCA_NAME_FIELD, &nca_name, warnings)
                .await
        };

        let (waterbody_id, operational_catchment_id) = match point {
            Some(p) => self.catchment_at(p, warnings).await,
            None => (None, None),
        };

        Ok(SiteContext {
            lpa_name,
            nca_name,
            lpa_neighbours,
            nca_neighbours,
            waterbody_id,
            operational_catchment_id,
        })
    }

    async fn geocode_postcode(&self, postcode: &str) -> Result<GeoPoint, JobError> {
        let key = format!("pc:{}", postcode.to_ascii_uppercase().replace(' ', ""));
        if let Some((lat, lon)) = self.geocode_cache.get(&key) {
            return Ok(GeoPoint { lat, lon });
        }

        let url = format!(
            "{}/postcodes/{}",
            self.postcode_api_base,
            urlencode(postcode.trim())
        );
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| geo_unresolved(format!("postcode lookup failed: {e}")))?
            .json()
            .await
            .map_err(|e| geo_unresolved(format!("postcode response unreadable: {e}")))?;

        let point = parse_postcode_response(&body)
            .ok_or_else(|| geo_unresolved(format!("postcode '{postcode}' not found")))?;
        self.geocode_cache.put(key, (point.lat, point.lon));
        Ok(point)
    }

    async fn geocode_address(&self, address: &str) -> Result<GeoPoint, JobError> {
        let key = format!("addr:{}", address.to_ascii_lowercase());
        if let Some((lat, lon)) = self.geocode_cache.get(&key) {
            return Ok(GeoPoint { lat, lon });
        }

        let url = format!(
            "{}/search?format=json&limit=1&q={}",
            self.geocoder_api_base,
            urlencode(address)
        );
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| geo_unresolved(format!("geocoder failed: {e}")))?
            .json()
            .await
            .map_err(|e| geo_unresolved(format!("geocoder response unreadable: {e}")))?;

        let point = parse_geocoder_response(&body)
            .ok_or_else(|| geo_unresolved(format!("address '{address}' could not be geocoded")))?;
        self.geocode_cache.put(key, (point.lat, point.lon));
        Ok(point)
    }

    /// Name of the layer feature containing a point, if any.
    async fn feature_at(&self, layer: &str, name_field: &str, point: GeoPoint) -> Option<String> {
        let url = format!(
            "{layer}/query?f=json&geometryType=esriGeometryPoint&inSR=4326&spatialRel=esriSpatialRelIntersects&returnGeometry=false&outFields={name_field}&geometry={lon},{lat}",
            lon = point.lon,
            lat = point.lat,
        );
        match self.layer_query(&url).await {
            Ok(body) => parse_feature_names(&body, name_field).into_iter().next(),
            Err(e) => {
                debug!(error = %e, layer, "point-in-polygon query failed");
                None
            }
        }
    }

    /// Look a feature up by name and return its outer-ring vertex centroid.
    async fn feature_by_name(
        &self,
        layer: &str,
        name_field: &str,
        name: &str,
    ) -> anyhow::Result<Option<GeoPoint>> {
        let clause = format!("UPPER({name_field})=UPPER('{}')", name.replace('\'', "''"));
        let url = format!(
            "{layer}/query?f=json&returnGeometry=true&outSR=4326&outFields={name_field}&where={}",
            urlencode(&clause)
        );
        let body = self.layer_query(&url).await?;
        Ok(parse_feature_centroid(&body))
    }

    /// Neighbour set of a named feature: every layer feature intersecting its
    /// polygon, minus itself. Cached.
    async fn neighbours(
        &self,
        layer: &str,
        name_field: &str,
        name: &str,
        warnings: &mut Vec<String>,
    ) -> HashSet<String> {
        let cache_key = format!("{name_field}:{}", name.to_ascii_lowercase());
        if let Some(hit) = self.neighbour_cache.get(&cache_key) {
            return hit;
        }

        let result = self
            .fetch_neighbours(layer, name_field, name)
            .await;
        match result {
            Ok(set) => {
                self.neighbour_cache.put(cache_key, set.clone());
                set
            }
            Err(e) => {
                warn!(error = %e, name, "neighbour query failed; axis degrades to empty set");
                warnings.push(format!("neighbour lookup failed for '{name}'"));
                HashSet::new()
            }
        }
    }

    async fn fetch_neighbours(
        &self,
        layer: &str,
        name_field: &str,
        name: &str,
    ) -> anyhow::Result<HashSet<String>> {
        // First fetch the target polygon...
        let clause = format!("UPPER({name_field})=UPPER('{}')", name.replace('\'', "''"));
        let url = format!(
            "{layer}/query?f=json&returnGeometry=true&outSR=4326&outFields={name_field}&where={}",
            urlencode(&clause)
        );
        let body = self.layer_query(&url).await?;
        let rings = body
            .pointer("/features/0/geometry")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("feature '{name}' not found in layer"))?;

        // ...then everything that touches it.
        let params = [
            ("f", "json".to_string()),
            ("geometryType", "esriGeometryPolygon".to_string()),
            ("inSR", "4326".to_string()),
            ("spatialRel", "esriSpatialRelIntersects".to_string()),
            ("returnGeometry", "false".to_string()),
            ("outFields", name_field.to_string()),
            ("geometry", rings.to_string()),
        ];
        let body: Value = self
            .http
            .post(format!("{layer}/query"))
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut names = parse_feature_names(&body, name_field);
        names.retain(|n| !n.eq_ignore_ascii_case(name));
        Ok(names.into_iter().collect())
    }

    async fn catchment_at(
        &self,
        point: GeoPoint,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let url = format!(
            "{}/point?lat={}&lon={}",
            self.catchment_api_base, point.lat, point.lon
        );
        match self.layer_query(&url).await {
            Ok(body) => parse_catchment_response(&body),
            Err(e) => {
                debug!(error = %e, "catchment lookup failed");
                warnings.push(
                    "waterbody/catchment lookup failed; watercourse banks will tier as far"
                        .to_string(),
                );
                (None, None)
            }
        }
    }

    async fn layer_query(&self, url: &str) -> anyhow::Result<Value> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        if body.get("error").is_some() {
            anyhow::bail!("layer returned error payload");
        }
        Ok(body)
    }
}

fn geo_unresolved(message: String) -> JobError {
    JobError::new(ErrorKind::GeographyUnresolved, message)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn parse_postcode_response(body: &Value) -> Option<GeoPoint> {
    let result = body.get("result")?;
    Some(GeoPoint {
        lat: result.get("latitude")?.as_f64()?,
        lon: result.get("longitude")?.as_f64()?,
    })
}

fn parse_geocoder_response(body: &Value) -> Option<GeoPoint> {
    let first = body.as_array()?.first()?;
    let lat = first.get("lat")?.as_str()?.parse().ok()?;
    let lon = first.get("lon")?.as_str()?.parse().ok()?;
    Some(GeoPoint { lat, lon })
}

fn parse_feature_names(body: &Value, name_field: &str) -> Vec<String> {
    body.get("features")
        .and_then(Value::as_array)
        .map(|features| {
            features
                .iter()
                .filter_map(|f| f.pointer(&format!("/attributes/{name_field}")))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Vertex centroid of the first feature's outer ring.
fn parse_feature_centroid(body: &Value) -> Option<GeoPoint> {
    let ring = body
        .pointer("/features/0/geometry/rings/0")?
        .as_array()?;
    let mut lat_sum = 0.0;
    let mut lon_sum = 0.0;
    let mut n = 0usize;
    for vertex in ring {
        let pair = vertex.as_array()?;
        lon_sum += pair.first()?.as_f64()?;
        lat_sum += pair.get(1)?.as_f64()?;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    Some(GeoPoint {
        lat: lat_sum / n as f64,
        lon: lon_sum / n as f64,
    })
}

fn parse_catchment_response(body: &Value) -> (Option<String>, Option<String>) {
    let waterbody = body
        .get("waterbody_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let catchment = body
        .get("operational_catchment_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    (waterbody, catchment)
}
