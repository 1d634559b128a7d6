//! GoldNav collector binary

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use goldnav::collector::{Collector, CollectorOptions, CollectorService, StatusCache};
use goldnav::config::AppConfig;
use goldnav::oracle::sources::build_sources;
use goldnav::persistence::CsvCycleStore;
use goldnav::valuation::NavCalculator;

fn init_tracing(json: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("goldnav=info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .context("Failed to initialize tracing subscriber")?;
    }
    Ok(())
}

#[cfg(feature = "dashboard")]
fn spawn_dashboard(service: Arc<CollectorService>, bind: String) {
    tokio::spawn(async move {
        if let Err(e) = goldnav::dashboard::start_server(service, &bind).await {
            tracing::error!(error = %e, "Dashboard server failed");
        }
    });
}

#[cfg(not(feature = "dashboard"))]
fn spawn_dashboard(_service: Arc<CollectorService>, bind: String) {
    warn!(bind = %bind, "dashboard.enabled is set but the binary was built without the `dashboard` feature");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(cfg.logging.json)?;

    info!(config = %cfg.digest(), "🥇 GoldNav starting");

    let sources = build_sources(&cfg)?;
    let calculator = NavCalculator::new(
        cfg.valuation.gold_holding_per_unit,
        cfg.valuation.total_units,
    )?;
    let options = CollectorOptions::from_config(&cfg)?;
    let store = Arc::new(CsvCycleStore::open(&cfg.persistence.data_dir, options.utc_offset)?);
    let status = Arc::new(StatusCache::new());

    let service = Arc::new(CollectorService::new(Collector::new(
        sources, calculator, store, status, options,
    )));
    service.start().await;

    if cfg.dashboard.enabled {
        spawn_dashboard(service.clone(), cfg.dashboard.bind.clone());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    if let Some(counters) = service.stop().await {
        info!(
            cycles = counters.cycles,
            persisted = counters.persisted,
            "👋 GoldNav stopped"
        );
    } else {
        warn!("Collector was not running at shutdown");
    }

    Ok(())
}
