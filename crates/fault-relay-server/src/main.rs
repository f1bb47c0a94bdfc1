//! # Fault-Relay Server
//!
//! Main entry point for the fault-relay proxy server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fault_relay_api::create_router;
use fault_relay_core::{Config, ProxyCollection, ProxyConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file with an array of proxies to create at startup
    #[arg(short, long)]
    proxies: Option<PathBuf>,

    /// Host to bind the control API on
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the control API on
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_path) = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.api_port = port;
    }

    let _guard = init_logging(&config)?;

    info!(
        "Starting fault-relay proxy server v{}",
        env!("CARGO_PKG_VERSION")
    );
    match &config_path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let proxies = ProxyCollection::new(config.limits);

    let mut initial = config.proxies.clone();
    if let Some(path) = &args.proxies {
        initial.extend(load_proxies(path)?);
    }
    if !initial.is_empty() {
        let populated = proxies
            .populate(initial)
            .await
            .context("Failed to create startup proxies")?;
        info!("Populated {} proxies", populated.len());
    }

    let api_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.api_port)
        .parse()
        .context("Invalid API bind address")?;
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("Failed to bind control API on {}", api_addr))?;
    let router = create_router(proxies.clone());

    info!("Control API listening on http://{}", api_addr);

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    proxies.destroy_all().await;
    info!("Fault-relay shut down");
    Ok(())
}

/// Load configuration from the given path, a default location, or defaults.
fn load_config(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = Config::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }

    let config_paths = ["fault-relay.toml", "/etc/fault-relay/config.toml"];
    for path in config_paths {
        let path = Path::new(path);
        if path.exists() {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?;
            return Ok((config, Some(path.to_path_buf())));
        }
    }

    Ok((Config::default(), None))
}

/// Read a JSON array of proxy definitions.
fn load_proxies(path: &Path) -> Result<Vec<ProxyConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read proxies file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse proxies file: {}", path.display()))
}

/// Initialize logging. Logs go to stdout unless `logging.file` is set.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let level = &config.logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(file) = &config.logging.file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .init();
        return Ok(None);
    };

    let path = Path::new(file);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Invalid log file path: {}", file))?;

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();
    Ok(Some(guard))
}
