//! SQLite-backed reference store.
//!
//! Loads the seven reference tables into an immutable [`Reference`] snapshot
//! and publishes it through an atomic pointer swap. Readers grab the current
//! snapshot without taking the connection lock; an out-of-band refresher task
//! replaces it when the TTL lapses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{info, warn};

use super::{Bank, BankIdx, Habitat, HabitatIdx, Reference, Stock, TradingRule};
use crate::models::{ContractSize, Distinctiveness, ErrorKind, JobError, Ledger, Tier};

const REQUIRED_TABLES: [&str; 7] = [
    "HabitatCatalog",
    "Banks",
    "Pricing",
    "Stock",
    "TradingRules",
    "SRM",
    "DistinctivenessLevels",
];

/// Store over the reference schema. The tables are consumed, not owned: the
/// schema bootstrap only creates them empty so a fresh database opens cleanly.
pub struct ReferenceStore {
    conn: Arc<Mutex<Connection>>,
    current: ArcSwapOption<Reference>,
}

impl ReferenceStore {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            current: ArcSwapOption::empty(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            current: ArcSwapOption::empty(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Run statements against the underlying connection. Test fixtures use
    /// this to seed reference rows.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS HabitatCatalog (
                habitat_name TEXT PRIMARY KEY,
                broader_type TEXT NOT NULL,
                distinctiveness TEXT NOT NULL,
                umbrella_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Banks (
                bank_id TEXT PRIMARY KEY,
                bank_name TEXT NOT NULL,
                lpa_name TEXT NOT NULL,
                nca_name TEXT NOT NULL,
                postcode TEXT,
                latitude REAL,
                longitude REAL,
                waterbody_id TEXT,
                operational_catchment_id TEXT
            );

            CREATE TABLE IF NOT EXISTS Pricing (
                bank_id TEXT NOT NULL,
                habitat_name TEXT NOT NULL,
                contract_size TEXT NOT NULL,
                tier TEXT NOT NULL,
                unit_price REAL NOT NULL,
                PRIMARY KEY (bank_id, habitat_name, contract_size, tier)
            );

            CREATE TABLE IF NOT EXISTS Stock (
                bank_id TEXT NOT NULL,
                habitat_name TEXT NOT NULL,
                available_units REAL NOT NULL,
                reserved_units REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (bank_id, habitat_name)
            );

            CREATE TABLE IF NOT EXISTS TradingRules (
                demand_habitat TEXT NOT NULL,
                allowed_supply_habitat TEXT NOT NULL,
                min_distinctiveness TEXT,
                companion_habitat TEXT,
                PRIMARY KEY (demand_habitat, allowed_supply_habitat)
            );

            CREATE TABLE IF NOT EXISTS SRM (
                tier TEXT PRIMARY KEY,
                multiplier REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS DistinctivenessLevels (
                level_name TEXT PRIMARY KEY,
                rank INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Current snapshot, loading one on first use. Never blocks readers on a
    /// concurrent refresh.
    pub fn snapshot(&self) -> Result<Arc<Reference>, JobError> {
        if let Some(r) = self.current.load_full() {
            return Ok(r);
        }
        self.refresh()?;
        self.current.load_full().ok_or_else(JobError::internal)
    }

    /// Reload every table and atomically publish the new snapshot.
    pub fn refresh(&self) -> Result<(), JobError> {
        let loaded = {
            let conn = self.conn.lock();
            load_reference(&conn)?
        };
        info!(
            habitats = loaded.habitats.len(),
            banks = loaded.banks.len(),
            "📚 Reference snapshot refreshed"
        );
        self.current.store(Some(Arc::new(loaded)));
        Ok(())
    }

    /// Whether a usable snapshot is currently published.
    pub fn is_ready(&self) -> bool {
        self.current.load().is_some()
    }
}

/// Periodically refresh the published snapshot. Failures keep the previous
/// snapshot so readers are never left without one.
pub fn spawn_reference_refresher(store: Arc<ReferenceStore>, ttl: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || store.refresh()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "reference refresh failed; keeping old snapshot"),
                Err(e) => warn!(error = %e, "reference refresh task panicked"),
            }
        }
    });
}

fn incomplete(table: &str, detail: impl std::fmt::Display) -> JobError {
    JobError::new(
        ErrorKind::ReferenceIncomplete,
        format!("reference table {table}: {detail}"),
    )
}

fn db_err(table: &str, e: rusqlite::Error) -> JobError {
    JobError::new(
        ErrorKind::ReferenceIncomplete,
        format!("reference table {table}: {e}"),
    )
}

fn load_reference(conn: &Connection) -> Result<Reference, JobError> {
    for table in REQUIRED_TABLES {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .map_err(|e| db_err(table, e))?;
        // SRM may legitimately be defaulted; everything else must have rows.
        if count == 0 && table != "SRM" && table != "TradingRules" {
            return Err(incomplete(table, "empty"));
        }
    }

    validate_distinctiveness_levels(conn)?;

    // Habitat arena
    let mut habitats: Vec<Habitat> = Vec::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT habitat_name, broader_type, distinctiveness, umbrella_type
                 FROM HabitatCatalog ORDER BY habitat_name",
            )
            .map_err(|e| db_err("HabitatCatalog", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("HabitatCatalog", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("HabitatCatalog", e))? {
            let name: String = row.get(0).map_err(|e| db_err("HabitatCatalog", e))?;
            let broader: String = row.get(1).map_err(|e| db_err("HabitatCatalog", e))?;
            let dist_raw: String = row.get(2).map_err(|e| db_err("HabitatCatalog", e))?;
            let umbrella_raw: String = row.get(3).map_err(|e| db_err("HabitatCatalog", e))?;

            let distinctiveness = Distinctiveness::parse(&dist_raw)
                .ok_or_else(|| incomplete("HabitatCatalog", format!("bad distinctiveness '{dist_raw}' for {name}")))?;
            let ledger = Ledger::parse(&umbrella_raw)
                .ok_or_else(|| incomplete("HabitatCatalog", format!("bad umbrella_type '{umbrella_raw}' for {name}")))?;

            habitats.push(Habitat {
                name,
                broader_type: broader,
                distinctiveness,
                ledger,
            });
        }
    }
    let habitat_index: HashMap<String, HabitatIdx> = habitats
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.clone(), i))
        .collect();

    // Bank arena
    let mut banks: Vec<Bank> = Vec::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT bank_id, bank_name, lpa_name, nca_name, postcode, latitude, longitude,
                        waterbody_id, operational_catchment_id
                 FROM Banks ORDER BY bank_id",
            )
            .map_err(|e| db_err("Banks", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("Banks", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("Banks", e))? {
            banks.push(Bank {
                bank_id: row.get(0).map_err(|e| db_err("Banks", e))?,
                bank_name: row.get(1).map_err(|e| db_err("Banks", e))?,
                lpa_name: row.get(2).map_err(|e| db_err("Banks", e))?,
                nca_name: row.get(3).map_err(|e| db_err("Banks", e))?,
                postcode: row.get(4).map_err(|e| db_err("Banks", e))?,
                latitude: row.get(5).map_err(|e| db_err("Banks", e))?,
                longitude: row.get(6).map_err(|e| db_err("Banks", e))?,
                waterbody_id: row.get(7).map_err(|e| db_err("Banks", e))?,
                operational_catchment_id: row.get(8).map_err(|e| db_err("Banks", e))?,
            });
        }
    }
    let bank_index: HashMap<String, BankIdx> = banks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.bank_id.clone(), i))
        .collect();

    // Stock ledger
    let mut stock: HashMap<(BankIdx, HabitatIdx), Stock> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT bank_id, habitat_name, available_units, reserved_units FROM Stock")
            .map_err(|e| db_err("Stock", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("Stock", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("Stock", e))? {
            let bank_id: String = row.get(0).map_err(|e| db_err("Stock", e))?;
            let habitat_name: String = row.get(1).map_err(|e| db_err("Stock", e))?;
            let available_units: f64 = row.get(2).map_err(|e| db_err("Stock", e))?;
            let reserved_units: f64 = row.get(3).map_err(|e| db_err("Stock", e))?;

            let bank = *bank_index
                .get(&bank_id)
                .ok_or_else(|| incomplete("Stock", format!("unknown bank_id {bank_id}")))?;
            let habitat = *habitat_index
                .get(&habitat_name)
                .ok_or_else(|| incomplete("Stock", format!("unknown habitat {habitat_name}")))?;
            if available_units < 0.0 {
                return Err(incomplete(
                    "Stock",
                    format!("negative available_units for {bank_id}/{habitat_name}"),
                ));
            }
            stock.insert(
                (bank, habitat),
                Stock {
                    available_units,
                    reserved_units,
                },
            );
        }
    }

    // Price table
    let mut pricing: HashMap<(BankIdx, HabitatIdx, ContractSize, Tier), f64> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT bank_id, habitat_name, contract_size, tier, unit_price FROM Pricing")
            .map_err(|e| db_err("Pricing", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("Pricing", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("Pricing", e))? {
            let bank_id: String = row.get(0).map_err(|e| db_err("Pricing", e))?;
            let habitat_name: String = row.get(1).map_err(|e| db_err("Pricing", e))?;
            let size_raw: String = row.get(2).map_err(|e| db_err("Pricing", e))?;
            let tier_raw: String = row.get(3).map_err(|e| db_err("Pricing", e))?;
            let unit_price: f64 = row.get(4).map_err(|e| db_err("Pricing", e))?;

            let bank = *bank_index
                .get(&bank_id)
                .ok_or_else(|| incomplete("Pricing", format!("unknown bank_id {bank_id}")))?;
            let habitat = *habitat_index
                .get(&habitat_name)
                .ok_or_else(|| incomplete("Pricing", format!("unknown habitat {habitat_name}")))?;
            let size = ContractSize::parse(&size_raw)
                .ok_or_else(|| incomplete("Pricing", format!("bad contract_size '{size_raw}'")))?;
            let tier = Tier::parse(&tier_raw)
                .ok_or_else(|| incomplete("Pricing", format!("bad tier '{tier_raw}'")))?;

            pricing.insert((bank, habitat, size, tier), unit_price);
        }
    }

    // Trading rules
    let mut trading_rules: HashMap<HabitatIdx, Vec<TradingRule>> = HashMap::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT demand_habitat, allowed_supply_habitat, min_distinctiveness, companion_habitat
                 FROM TradingRules ORDER BY demand_habitat, allowed_supply_habitat",
            )
            .map_err(|e| db_err("TradingRules", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("TradingRules", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("TradingRules", e))? {
            let demand_raw: String = row.get(0).map_err(|e| db_err("TradingRules", e))?;
            let supply_raw: String = row.get(1).map_err(|e| db_err("TradingRules", e))?;
            let min_raw: Option<String> = row.get(2).map_err(|e| db_err("TradingRules", e))?;
            let companion_raw: Option<String> = row.get(3).map_err(|e| db_err("TradingRules", e))?;

            let demand = *habitat_index
                .get(&demand_raw)
                .ok_or_else(|| incomplete("TradingRules", format!("unknown demand habitat {demand_raw}")))?;
            let allowed_supply = *habitat_index
                .get(&supply_raw)
                .ok_or_else(|| incomplete("TradingRules", format!("unknown supply habitat {supply_raw}")))?;
            let min_distinctiveness = match min_raw {
                Some(s) if !s.trim().is_empty() => Some(Distinctiveness::parse(&s).ok_or_else(
                    || incomplete("TradingRules", format!("bad min_distinctiveness '{s}'")),
                )?),
                _ => None,
            };
            let companion = match companion_raw {
                Some(s) if !s.trim().is_empty() => Some(*habitat_index.get(&s).ok_or_else(
                    || incomplete("TradingRules", format!("unknown companion habitat {s}")),
                )?),
                _ => None,
            };

            trading_rules.entry(demand).or_default().push(TradingRule {
                allowed_supply,
                min_distinctiveness,
                companion,
            });
        }
    }

    // SRM overrides (missing tiers fall back to defaults)
    let mut srm: HashMap<Tier, f64> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT tier, multiplier FROM SRM")
            .map_err(|e| db_err("SRM", e))?;
        let mut rows = stmt.query([]).map_err(|e| db_err("SRM", e))?;
        while let Some(row) = rows.next().map_err(|e| db_err("SRM", e))? {
            let tier_raw: String = row.get(0).map_err(|e| db_err("SRM", e))?;
            let multiplier: f64 = row.get(1).map_err(|e| db_err("SRM", e))?;
            let tier = Tier::parse(&tier_raw)
                .ok_or_else(|| incomplete("SRM", format!("bad tier '{tier_raw}'")))?;
            if multiplier <= 0.0 {
                return Err(incomplete("SRM", format!("non-positive multiplier for {tier_raw}")));
            }
            srm.insert(tier, multiplier);
        }
    }

    Ok(Reference::assemble(
        habitats,
        banks,
        stock,
        pricing,
        trading_rules,
        srm,
    ))
}

/// The rank column must describe the same total order the engine assumes.
fn validate_distinctiveness_levels(conn: &Connection) -> Result<(), JobError> {
    let mut stmt = conn
        .prepare("SELECT level_name, rank FROM DistinctivenessLevels ORDER BY rank")
        .map_err(|e| db_err("DistinctivenessLevels", e))?;
    let mut rows = stmt.query([]).map_err(|e| db_err("DistinctivenessLevels", e))?;

    let mut last_rank: Option<i64> = None;
    while let Some(row) = rows.next().map_err(|e| db_err("DistinctivenessLevels", e))? {
        let name: String = row.get(0).map_err(|e| db_err("DistinctivenessLevels", e))?;
        let rank: i64 = row.get(1).map_err(|e| db_err("DistinctivenessLevels", e))?;

        let band = Distinctiveness::parse(&name)
            .ok_or_else(|| incomplete("DistinctivenessLevels", format!("unknown band '{name}'")))?;
        if let Some(prev) = last_rank {
            if rank <= prev {
                return Err(incomplete("DistinctivenessLevels", "ranks are not strictly increasing"));
            }
        }
        // The table order must agree with the built-in band order.
        if i64::from(band.rank()) != rank {
            return Err(incomplete(
                "DistinctivenessLevels",
                format!("band '{name}' has rank {rank}, expected {}", band.rank()),
            ));
        }
        last_rank = Some(rank);
    }
    Ok(())
}
