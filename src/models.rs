//! Shared domain types for the allocation backend.
//!
//! Everything that crosses a module boundary lives here: the habitat
//! vocabulary (ledger, distinctiveness, tier, contract size), demand lines,
//! allocation report rows, job error kinds, and process configuration.

use serde::{Deserialize, Serialize};

/// Spatial proximity class between a development site and a habitat bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Adjacent,
    Far,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Local, Tier::Adjacent, Tier::Far];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Adjacent => "adjacent",
            Tier::Far => "far",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Tier::Local),
            "adjacent" => Some(Tier::Adjacent),
            "far" => Some(Tier::Far),
            _ => None,
        }
    }
}

/// One of the three biodiversity ledgers. Demand and supply never cross
/// ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ledger {
    Area,
    Hedgerow,
    Watercourse,
}

impl Ledger {
    pub const ALL: [Ledger; 3] = [Ledger::Area, Ledger::Hedgerow, Ledger::Watercourse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ledger::Area => "area",
            Ledger::Hedgerow => "hedgerow",
            Ledger::Watercourse => "watercourse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "area" => Some(Ledger::Area),
            "hedgerow" => Some(Ledger::Hedgerow),
            "watercourse" => Some(Ledger::Watercourse),
            _ => None,
        }
    }

    /// Sentinel demand-habitat name for the net-gain residual of this ledger.
    pub fn net_gain_name(&self) -> &'static str {
        match self {
            Ledger::Area => "Net Gain (Area)",
            Ledger::Hedgerow => "Net Gain (Hedgerow)",
            Ledger::Watercourse => "Net Gain (Watercourse)",
        }
    }
}

/// Habitat distinctiveness band, totally ordered Very Low < ... < Very High.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distinctiveness {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl Distinctiveness {
    pub fn rank(&self) -> u8 {
        match self {
            Distinctiveness::VeryLow => 0,
            Distinctiveness::Low => 1,
            Distinctiveness::Medium => 2,
            Distinctiveness::High => 3,
            Distinctiveness::VeryHigh => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Distinctiveness::VeryLow => "Very Low",
            Distinctiveness::Low => "Low",
            Distinctiveness::Medium => "Medium",
            Distinctiveness::High => "High",
            Distinctiveness::VeryHigh => "Very High",
        }
    }

    /// Parse a band label as it appears in reference tables and metric-file
    /// section headers. Accepts "Very low", "V.Low", "VLow" style variants.
    pub fn parse(s: &str) -> Option<Self> {
        let norm: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "verylow" | "vlow" => Some(Distinctiveness::VeryLow),
            "low" => Some(Distinctiveness::Low),
            "medium" => Some(Distinctiveness::Medium),
            "high" => Some(Distinctiveness::High),
            "veryhigh" | "vhigh" => Some(Distinctiveness::VeryHigh),
            _ => None,
        }
    }
}

/// Pricing bundle applicable to a whole job, selected from the aggregate
/// area-ledger demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractSize {
    Fractional,
    Small,
    Medium,
    Large,
}

impl ContractSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractSize::Fractional => "fractional",
            ContractSize::Small => "small",
            ContractSize::Medium => "medium",
            ContractSize::Large => "large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fractional" => Some(ContractSize::Fractional),
            "small" => Some(ContractSize::Small),
            "medium" => Some(ContractSize::Medium),
            "large" => Some(ContractSize::Large),
            _ => None,
        }
    }
}

/// One line of compensation demand, in effective (buyer-side) units.
///
/// Units are strictly positive. A line whose habitat name is the ledger's
/// net-gain sentinel is satisfiable by any habitat of Low-or-higher
/// distinctiveness within the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandLine {
    pub ledger: Ledger,
    pub habitat_name: String,
    pub units_required: f64,
    pub distinctiveness: Distinctiveness,
    pub broader_type: Option<String>,
}

impl DemandLine {
    /// Net-gain residual line for a ledger. Carries Low distinctiveness, the
    /// minimum a supplying habitat must meet.
    pub fn net_gain(ledger: Ledger, units: f64) -> Self {
        Self {
            ledger,
            habitat_name: ledger.net_gain_name().to_string(),
            units_required: units,
            distinctiveness: Distinctiveness::Low,
            broader_type: None,
        }
    }

    pub fn is_net_gain(&self) -> bool {
        self.habitat_name == self.ledger.net_gain_name()
    }
}

/// Whether an allocation row draws a single supply habitat or a blended
/// pair at the same bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Normal,
    Paired,
}

impl OptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionKind::Normal => "normal",
            OptionKind::Paired => "paired",
        }
    }
}

/// One component of a paired allocation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedPart {
    pub supply_habitat: String,
    pub weight: f64,
    pub unit_price: f64,
    pub units_supplied: f64,
    pub stock_units_consumed: f64,
}

/// A single line of the allocation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub bank_id: String,
    pub bank_name: String,
    pub demand_habitat: String,
    pub supply_habitat: String,
    pub ledger: Ledger,
    pub tier: Tier,
    pub option_kind: OptionKind,
    /// Raw units drawn from the supply habitat (post-rounding).
    pub units_supplied: f64,
    /// Buyer-side units this row delivers toward its demand line.
    pub effective_units: f64,
    pub stock_units_consumed: f64,
    pub unit_price: f64,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_parts: Option<Vec<PairedPart>>,
}

/// Demand the engine could not cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    pub ledger: Ledger,
    pub habitat_name: String,
    pub units_unmet: f64,
}

/// The engine's output: allocations plus pricing context and anything the
/// caller must know about (shortfalls, warnings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub allocations: Vec<AllocationRow>,
    pub total_cost: f64,
    pub contract_size: ContractSize,
    pub shortfalls: Vec<Shortfall>,
    pub warnings: Vec<String>,
}

/// User-facing failure classification. Internal detail stays in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    ReferenceIncomplete,
    GeographyUnresolved,
    OffsetAmbiguous,
    Infeasible,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::ReferenceIncomplete => "reference_incomplete",
            ErrorKind::GeographyUnresolved => "geography_unresolved",
            ErrorKind::OffsetAmbiguous => "offset_ambiguous",
            ErrorKind::Infeasible => "infeasible",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// An error surfaced on a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Generic internal-error record; the real cause goes to the log only.
    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal, "internal error, see server logs")
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for JobError {}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub worker_count: usize,
    pub job_timeout_secs: u64,
    pub result_cache_ttl_secs: i64,
    pub reference_ttl_secs: u64,
    pub neighbour_cache_ttl_secs: i64,
    pub geocode_cache_ttl_secs: i64,
    /// Aggregate area-unit thresholds for fractional/small/medium contracts.
    pub contract_size_thresholds: [f64; 3],
    pub solver: SolverSelection,
    pub postcode_api_base: String,
    pub geocoder_api_base: String,
    pub lpa_layer_base: String,
    pub nca_layer_base: String,
    pub catchment_api_base: String,
}

/// Which optimiser runs first. The greedy allocator is always available as
/// the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverSelection {
    LpFirst,
    GreedyOnly,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./bng_optimiser.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let worker_count = std::env::var("WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n >= 1)
            .unwrap_or(2);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(120);

        let result_cache_ttl_secs = std::env::var("RESULT_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(12 * 3600);

        let reference_ttl_secs = std::env::var("REFERENCE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(600);

        let neighbour_cache_ttl_secs = std::env::var("NEIGHBOUR_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(3600);

        let geocode_cache_ttl_secs = std::env::var("GEOCODE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(24 * 3600);

        let t1 = env_f64("CONTRACT_SIZE_T1", 1.0);
        let t2 = env_f64("CONTRACT_SIZE_T2", 5.0);
        let t3 = env_f64("CONTRACT_SIZE_T3", 15.0);

        let solver = match std::env::var("SOLVER").as_deref() {
            Ok("GREEDY_ONLY") | Ok("greedy_only") => SolverSelection::GreedyOnly,
            _ => SolverSelection::LpFirst,
        };

        let postcode_api_base = std::env::var("POSTCODE_API_BASE")
            .unwrap_or_else(|_| "https://api.postcodes.io".to_string());
        let geocoder_api_base = std::env::var("GEOCODER_API_BASE")
            .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string());
        let lpa_layer_base = std::env::var("LPA_LAYER_BASE").unwrap_or_else(|_| {
            "https://services1.arcgis.com/ESMARspQHYMw9BZ9/arcgis/rest/services/LPA_APR_2023_UK_BUC/FeatureServer/0"
                .to_string()
        });
        let nca_layer_base = std::env::var("NCA_LAYER_BASE").unwrap_or_else(|_| {
            "https://services.arcgis.com/JJzESW51TqeY9uat/arcgis/rest/services/National_Character_Areas_England/FeatureServer/0"
                .to_string()
        });
        let catchment_api_base = std::env::var("CATCHMENT_API_BASE")
            .unwrap_or_else(|_| "https://environment.data.gov.uk/catchment-planning".to_string());

        Ok(Self {
            database_path,
            port,
            worker_count,
            job_timeout_secs,
            result_cache_ttl_secs,
            reference_ttl_secs,
            neighbour_cache_ttl_secs,
            geocode_cache_ttl_secs,
            contract_size_thresholds: [t1, t2, t3],
            solver,
            postcode_api_base,
            geocoder_api_base,
            lpa_layer_base,
            nca_layer_base,
            catchment_api_base,
        })
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Round up to the nearest 0.01. Applied exactly once, at the bundling step.
///
/// The slack absorbs binary-float artefacts (0.5 * 100 =
/// 50.000000000000007) and solver noise, both far below the 0.01 grid.
pub fn round_up_hundredth(x: f64) -> f64 {
    ((x * 100.0) - 1e-7).ceil() / 100.0
}
