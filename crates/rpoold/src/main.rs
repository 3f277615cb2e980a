//! rpoold: chunk-pool daemon
//!
//! Usage:
//!   rpoold [--config ~/.config/rpool/rpool.toml] [--mode webdav|api|both]
//!
//! Serves the pool namespace over WebDAV (streaming reads with Range
//! support) and a JSON administration API, plus Prometheus metrics and
//! health probes when `metrics_addr` is configured.

mod api;
mod auth;
mod metrics;
mod webdav;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rpool_core::PoolConfig;
use rpool_engine::PoolEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "rpoold", version, about = "chunk pool daemon")]
struct Cli {
    /// Path to the pool configuration file (TOML or JSON)
    #[arg(
        long,
        short = 'c',
        env = "RPOOL_CONFIG",
        default_value = "~/.config/rpool/rpool.toml"
    )]
    config: PathBuf,

    /// Which frontends to run
    #[arg(long, default_value = "both")]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RPOOL_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "RPOOL_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum Mode {
    /// WebDAV frontend only
    Webdav,
    /// REST API only
    Api,
    /// Both frontends (default)
    Both,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        config = %cli.config.display(),
        "rpoold starting"
    );

    let config = PoolConfig::load(&expand_home(&cli.config))?;
    if config.remotes.is_empty() {
        anyhow::bail!("no remotes configured; add a [remotes] list to the config file");
    }

    let client = rpool_storage::build_client(&config)?;
    let engine = Arc::new(PoolEngine::new(config.clone(), client)?);
    let auth = Arc::new(auth::AuthManager::from_config(&config));
    let shutdown = CancellationToken::new();

    if let Some(addr) = config.metrics_addr.clone() {
        let state = Arc::new(metrics::MetricsState::new(engine.clone()));
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let mut servers = Vec::new();
    if cli.mode != Mode::Api {
        let addr = format!("{}:{}", config.webdav_host, config.webdav_port);
        let router = webdav::router(webdav::DavState {
            engine: engine.clone(),
            auth: auth.clone(),
        });
        servers.push(spawn_server("webdav", addr, router, shutdown.clone()).await?);
    }
    if cli.mode != Mode::Webdav {
        let addr = format!("{}:{}", config.api_server_host, config.api_server_port);
        let router = api::router(api::ApiState {
            engine: engine.clone(),
            auth,
        });
        servers.push(spawn_server("api", addr, router, shutdown.clone()).await?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    shutdown.cancel();
    for server in servers {
        let _ = server.await;
    }
    engine.shutdown().await;
    info!("rpoold stopped");
    Ok(())
}

async fn spawn_server(
    name: &'static str,
    addr: String,
    router: axum::Router,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("{name} bind {addr}"))?;
    info!(server = name, addr = %addr, "listening");
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(server = name, "server failed: {e}");
        }
    }))
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
