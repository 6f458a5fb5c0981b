//! rowtapd binary — serves filtered, long-polling selects over configured SQL sources.

mod config;
mod health;
mod http_api;
mod metrics;
mod reaper;
mod sources;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use rowtap_connectors::{default_registry, ConnectorStore, QueryService};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::DaemonConfig;
use health::HealthState;
use http_api::AppState;
use metrics::DaemonMetrics;
use sources::SourceCatalog;

#[derive(Parser)]
#[command(name = "rowtapd", about = "Rowtap query daemon")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Sources file (overrides SOURCES_PATH)
    #[arg(long)]
    sources: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set.
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = DaemonConfig::from_env()?;
    if let Some(path) = cli.sources {
        config.sources_path = path;
    }

    let sources = SourceCatalog::load(&config.sources_path)?;
    if sources.is_empty() {
        warn!("No sources configured in {}", config.sources_path.display());
    } else {
        info!(
            "Loaded {} source(s) from {}: {}",
            sources.len(),
            config.sources_path.display(),
            sources.ids().collect::<Vec<_>>().join(", ")
        );
    }

    let registry = default_registry(&config.sqlite_base_dir);
    info!("Registered connectors: {}", registry.names().join(", "));
    let store = Arc::new(ConnectorStore::new(registry));
    let service = QueryService::new(store.clone()).with_max_wait(config.max_wait());

    // Metrics
    let daemon_metrics = DaemonMetrics::new();

    // Health/readiness state
    let ready = Arc::new(AtomicBool::new(false));
    let health_state = Arc::new(HealthState {
        metrics: daemon_metrics.clone(),
        ready: ready.clone(),
    });

    // Start reaper background task
    reaper::spawn_reaper(
        store,
        daemon_metrics.clone(),
        config.idle_ttl(),
        config.reaper_interval(),
    );
    info!(
        "Reaper started (interval: {}s, idle ttl: {}s)",
        config.reaper_interval().as_secs(),
        config.idle_ttl_secs
    );

    let state = Arc::new(AppState {
        service,
        sources,
        metrics: daemon_metrics,
    });
    let app = http_api::api_router(state)
        .merge(health::health_router(health_state))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("rowtapd listening on {}", addr);
    ready.store(true, Ordering::Relaxed);

    axum::serve(listener, app).await?;

    Ok(())
}
