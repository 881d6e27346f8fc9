//! Portico: request-dispatch server.
//!
//! Serves the hosted contexts described in a JSON config file through the
//! interceptor chain, with optional admin endpoints for inspecting the chain
//! and swapping handler rules at runtime.
//!
//! Usage:
//!   portico --config portico.json                 # Mounts from config, port 8080
//!   portico --config portico.json --rules r.json  # Follow a rules file
//!   portico --port 0 --enable-admin               # OS-assigned port, admin on

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use portico_server::{DispatchPipeline, HandlerRegistry, RulesWatcher};
use portico_services::builtin_catalog;
use portico_transport::{TransportConfig, TransportServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::PorticoConfig;

#[derive(Parser, Debug)]
#[command(name = "portico", about = "Portico request-dispatch server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// JSON config file with mounts, session defaults and rules
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON rules file, reloaded whenever it changes
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Expose the admin endpoints under /_portico
    #[arg(long)]
    enable_admin: bool,

    /// Enable permissive CORS
    #[arg(long)]
    enable_cors: bool,

    /// Maximum concurrently dispatched requests
    #[arg(long, default_value = "1024")]
    max_in_flight: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if let Some(log_path) = &cli.log_file {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("Failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => PorticoConfig::load(path)?,
        None => PorticoConfig::default(),
    };

    // Interceptor chain
    let handlers = Arc::new(HandlerRegistry::new(builtin_catalog()));
    if let Some(rules) = config.initial_rules()? {
        handlers.update_rules(rules);
    }
    let rules_watcher = match &cli.rules {
        Some(path) => Some(
            RulesWatcher::start(path, handlers.clone())
                .with_context(|| format!("failed to load rules {}", path.display()))?,
        ),
        None => None,
    };

    // Hosted contexts
    let pipeline = Arc::new(DispatchPipeline::new(handlers));
    for mount in &config.mounts {
        let key = mount.key();
        pipeline
            .deploy(key.clone(), mount.factory(&config.sessions))
            .with_context(|| format!("failed to deploy {key}"))?;
    }

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        enable_cors: cli.enable_cors,
        max_in_flight: Some(cli.max_in_flight),
        enable_admin: cli.enable_admin,
        ..TransportConfig::default()
    };

    let mut transport = TransportServer::start(transport_config, pipeline.clone())
        .await
        .map_err(|e| anyhow!("failed to start transport: {e}"))?;

    println!();
    println!("  Portico listening on http://{}:{}", cli.hostname, transport.port());
    for key in pipeline.mounts().keys() {
        println!("    mounted  {key}");
    }
    if let Some(watcher) = &rules_watcher {
        println!("    rules    {} (watched)", watcher.path().display());
    }
    if cli.enable_admin {
        println!("    admin    http://{}:{}/_portico", cli.hostname, transport.port());
    }
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    transport.stop().await;
    if let Some(watcher) = rules_watcher {
        watcher.stop();
    }
    pipeline.shutdown();
    Ok(())
}
