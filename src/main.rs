use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::{StoreBackend, WardenConfig};
use ratewarden::http::{shutdown_signal, HttpServer, Throttle};
use ratewarden::ratelimit::RateLimiter;
use ratewarden::store::{MemoryStore, RedisStore, Store};

/// Distributed HTTP request throttling service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Address to serve HTTP on
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Counter store backend (memory or redis)
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = WardenConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }
    if let Some(url) = cli.redis_url {
        config.store.redis_url = url;
    }
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store.backend,
        api_gateway = config.rate_limiting.api_gateway,
        overrides = config.rate_limiting.api_limit.len(),
        trusted_proxies = config.rate_limiting.trusted_proxies.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            Arc::new(RedisStore::connect(&config.store.redis_url, config.store.timeout()).await?)
        }
    };
    info!(
        failure_policy = ?config.rate_limiting.store_failure_policy,
        "Counter store ready"
    );

    let throttle = Arc::new(Throttle::new(
        RateLimiter::new(store),
        Arc::new(config.rate_limiting),
    ));

    HttpServer::new(config.server.http_addr, throttle)
        .with_admin_token(config.server.admin_token.clone())
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Ratewarden stopped");
    Ok(())
}
