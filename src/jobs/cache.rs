//! SQLite-backed result cache.
//!
//! `fingerprint -> result` with a TTL. Reads check freshness; a background
//! prune task deletes expired rows so the table stays lean.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::models::AllocationReport;

pub struct ResultCache {
    conn: Arc<Mutex<Connection>>,
    ttl_secs: i64,
}

impl ResultCache {
    pub fn new<P: AsRef<Path>>(path: P, ttl_secs: i64) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_secs,
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    pub fn in_memory(ttl_secs: i64) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_secs,
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS result_cache (
                fingerprint TEXT PRIMARY KEY,
                result_json TEXT NOT NULL,
                cached_at INTEGER NOT NULL
            ) WITHOUT ROWID;

            CREATE INDEX IF NOT EXISTS idx_result_cache_age
                ON result_cache(cached_at);
            "#,
        )?;
        Ok(())
    }

    /// Fresh cached result for a fingerprint, if any.
    pub fn get(&self, fingerprint: &str) -> Option<AllocationReport> {
        let now = Utc::now().timestamp();
        let row: Option<(String, i64)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT result_json, cached_at FROM result_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .ok()
            .flatten()
        };

        let (json, cached_at) = row?;
        if now - cached_at > self.ttl_secs {
            debug!(fingerprint, "cache entry expired");
            return None;
        }
        match serde_json::from_str(&json) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(fingerprint, error = %e, "cached result unreadable; ignoring");
                None
            }
        }
    }

    pub fn put(&self, fingerprint: &str, report: &AllocationReport) {
        let json = match serde_json::to_string(report) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "result not cacheable");
                return;
            }
        };
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT INTO result_cache (fingerprint, result_json, cached_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 result_json = excluded.result_json,
                 cached_at = excluded.cached_at",
            params![fingerprint, json, Utc::now().timestamp()],
        ) {
            warn!(error = %e, "cache write failed");
        }
    }

    /// Delete expired entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.ttl_secs;
        let conn = self.conn.lock();
        match conn.execute(
            "DELETE FROM result_cache WHERE cached_at < ?1",
            params![cutoff],
        ) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache prune failed");
                0
            }
        }
    }

    /// Trivial probe for the health endpoint.
    pub fn is_connected(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Periodically prune expired cache rows.
pub fn spawn_cache_pruner(cache: Arc<ResultCache>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            let pruned = tokio::task::spawn_blocking(move || cache.prune()).await;
            match pruned {
                Ok(n) if n > 0 => info!("🧹 Pruned {} expired cached results", n),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cache prune task panicked"),
            }
        }
    });
}
