use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use relaycache::cache::far::RedisFarTier;
use relaycache::cache::near::NearCache;
use relaycache::cache::store::TwoTierStore;
use relaycache::cache::ttl::TtlPolicy;
use relaycache::config;
use relaycache::http;
use relaycache::metrics::MetricsRegistry;
use relaycache::proxy::origin::{HttpOrigin, Origin};
use relaycache::proxy::refresh::{self, RefreshContext, RefreshScheduler};
use relaycache::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "relaycache", about = "Caching HTTP Reverse Proxy")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults plus environment
    /// overrides are used when omitted.
    #[arg(short, long)]
    config: Option<String>,
}

/// Grace period for draining background refreshes at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(cli.config.as_deref().map(Path::new))?);
    tracing::info!(origin_url = %config.origin_url, "starting relaycache");

    // ---- Far tier ----
    let far = RedisFarTier::connect(
        &config.redis_url,
        config.redis_pool_size,
        Duration::from_millis(config.far_tier_timeout_ms),
    )
    .await?;

    // ---- Origin client ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("relaycache/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.origin_timeout_seconds))
        .build()
        .context("failed to build reqwest client")?;

    let origin: Arc<dyn Origin> = Arc::new(HttpOrigin::new(http_client.clone(), &config.origin_url));

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Cache ----
    let ttl_policy = Arc::new(TtlPolicy::from_config(&config)?);
    let near = NearCache::new(
        config.l1_cache_maxsize,
        Duration::from_secs(config.refresh_mark_ttl_seconds),
    );
    let store = Arc::new(TwoTierStore::new(
        near,
        Arc::new(far),
        config.stale_ttl_offset,
        metrics.clone(),
    ));

    // ---- Background refresh worker ----
    let (scheduler, refresh_rx) = RefreshScheduler::new(config.refresh_queue_size, metrics.clone());
    let mut refresh_worker = tokio::spawn(refresh::run_worker(
        refresh_rx,
        RefreshContext {
            store: Arc::clone(&store),
            origin: Arc::clone(&origin),
            ttl_policy: Arc::clone(&ttl_policy),
            lock_lease_seconds: config.lock_lease_seconds,
            metrics: metrics.clone(),
        },
    ));

    // ---- App state & server ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        origin,
        ttl_policy,
        scheduler,
        metrics,
        http_client,
    });

    let app = http::handler::create_router(Arc::clone(&state));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
    tracing::info!(listen_addr = %config.listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Dropping the state closes the refresh queue; give the worker a grace
    // period to drain before cancelling it.
    drop(state);
    tokio::select! {
        _ = &mut refresh_worker => {}
        () = tokio::time::sleep(SHUTDOWN_GRACE) => {
            refresh_worker.abort();
            tracing::warn!("refresh worker cancelled after grace period");
        }
    }

    tracing::info!("relaycache shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
