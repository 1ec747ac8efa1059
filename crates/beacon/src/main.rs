use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use beacon::{serve, telemetry, Ingress, Stage};
use clap::Parser;
use glowconf::GlowConfig;
use patternette::{PatternCatalog, PatternHost, SandboxConfig};
use tracing::{info, warn};

/// Beacon - audio-reactive pattern host and WebSocket control plane
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load in place of ./glow.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// OTLP gRPC endpoint for OpenTelemetry (overrides config)
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Print the merged configuration and exit
    #[arg(long)]
    print_config: bool,

    /// List known patterns and exit
    #[arg(long)]
    list_patterns: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = GlowConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.infra.bind.port = port;
    }
    if let Some(endpoint) = cli.otlp_endpoint {
        config.infra.telemetry.otlp_endpoint = Some(endpoint);
    }

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let catalog = build_catalog(&config);

    if cli.list_patterns {
        for meta in catalog.list() {
            println!("{:<20} {:<10} {}", meta.id, meta.category, meta.description);
        }
        return Ok(());
    }

    telemetry::init(
        config.infra.telemetry.otlp_endpoint.as_deref(),
        &config.infra.telemetry.log_level,
    )
    .context("Failed to initialize telemetry")?;

    for file in &sources.files {
        info!(path = %file.display(), "Loaded config file");
    }
    for var in &sources.env_overrides {
        info!(var = %var, "Config overridden from environment");
    }
    info!(patterns = catalog.len(), "Pattern catalog ready");

    let host = Arc::new(PatternHost::new(
        Arc::new(catalog),
        SandboxConfig::from(&config.infra.scripting),
    ));
    let stage = Arc::new(Stage::new(host));
    stage
        .seed(&config.bootstrap.zones)
        .context("Failed to seed zones")?;

    let ingress = Ingress::new(&config.infra, stage.clone()).context("Failed to build router")?;
    let server = serve(&config.infra, ingress, Some(stage))
        .await
        .context("Failed to start WebSocket server")?;
    info!(addr = %server.local_addr(), "Beacon ready");

    wait_for_signal().await;
    server.shutdown().await;

    telemetry::shutdown();
    Ok(())
}

fn build_catalog(config: &GlowConfig) -> PatternCatalog {
    let mut catalog = PatternCatalog::builtin();
    if let Some(dir) = &config.infra.scripting.pattern_dir {
        match catalog.load_dir(dir) {
            Ok(count) => info!(dir = %dir.display(), count, "Loaded patterns from directory"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping pattern directory"),
        }
    }
    catalog
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Shutting down...");
}
