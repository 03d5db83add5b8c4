//! bng-optimiser - least-cost biodiversity-unit allocation service
//!
//! A caller submits habitat deficits for a development site; the engine
//! resolves the site's geography, applies trading rules and spatial-risk
//! multipliers, and returns the cheapest feasible assignment of units from
//! the reachable habitat banks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bng_optimiser::{
    allocation::EngineSettings,
    api::{self, AppState},
    geography::GeographyResolver,
    jobs::{JobService, ResultCache},
    models::Config,
    reference::ReferenceStore,
};

/// Command-line overrides; everything else comes from the environment.
#[derive(Debug, Parser)]
#[command(name = "bng-optimiser", about = "Biodiversity-unit allocation service")]
struct Args {
    /// Listen port (overrides PORT).
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path (overrides DATABASE_PATH).
    #[arg(long)]
    database: Option<String>,
    /// Worker pool size (overrides WORKER_COUNT).
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers.max(1);
    }

    info!("🌿 BNG optimiser starting");

    // Reference store + result cache share one SQLite file (WAL mode).
    let reference = Arc::new(
        ReferenceStore::new(&config.database_path).context("Failed to open reference store")?,
    );
    match reference.refresh() {
        Ok(()) => info!("📚 Reference snapshot loaded from {}", config.database_path),
        Err(e) => warn!(error = %e, "reference tables not ready; jobs will fail until seeded"),
    }
    bng_optimiser::reference::spawn_reference_refresher(
        reference.clone(),
        Duration::from_secs(config.reference_ttl_secs),
    );

    let cache = Arc::new(
        ResultCache::new(&config.database_path, config.result_cache_ttl_secs)
            .context("Failed to open result cache")?,
    );
    bng_optimiser::jobs::spawn_cache_pruner(cache.clone(), Duration::from_secs(3600));

    let geography =
        Arc::new(GeographyResolver::new(&config).context("Failed to build geography resolver")?);

    let engine_settings = EngineSettings {
        contract_size_thresholds: config.contract_size_thresholds,
        solver: config.solver,
    };

    let jobs = JobService::start(
        cache.clone(),
        reference.clone(),
        geography,
        engine_settings,
        Duration::from_secs(config.job_timeout_secs),
        config.worker_count,
    );

    let state = AppState {
        jobs: jobs.clone(),
        cache,
    };

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            bng_optimiser::middleware::logging::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop signal received: refuse new work, let workers drain, then exit.
    jobs.shutdown().await;
    info!("👋 BNG optimiser stopped cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("🛑 Stop signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bng_optimiser=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
