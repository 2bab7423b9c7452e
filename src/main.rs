//! relayd binary: load configuration, wire the balancer, serve.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use relayd::catalog::{Catalog, PgCatalog};
use relayd::config::{self, HealthConfig, Settings};
use relayd::{BackendCache, HealthProber, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let settings = Settings::from_env()?;
    let health_config = HealthConfig::load_from("config.json")?;
    info!(mode = ?settings.mode, "starting relayd");

    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::connect(&settings.postgres_url).await?);
    let active = catalog
        .list_active()
        .await
        .context("failed to load active backends")?;
    info!(active_backends = active.len(), "loaded backend catalog");

    let cache = Arc::new(BackendCache::new(active));
    let state = Arc::new(SharedState::new(&settings, cache.clone(), catalog.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(relayd::run_reconciler(
        cache.clone(),
        catalog.clone(),
        config::CACHE_REFRESH_PERIOD,
        shutdown_rx.clone(),
    ));

    let prober = HealthProber::new(catalog, cache, &health_config.health_check)?;
    tokio::spawn(prober.run(shutdown_rx.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config::LISTEN_PORT));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "load balancer listening");

    tokio::select! {
        result = relayd::serve(listener, state, shutdown_rx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
