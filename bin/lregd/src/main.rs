//! ---
//! lreg_section: "01-core-functionality"
//! lreg_subsection: "binary"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Binary entrypoint for the lreg daemon."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lreg_cluster::LocalCluster;
use lreg_common::config::AppConfig;
use lreg_common::logging::init_tracing;
use lreg_common::time::SystemClock;
use lreg_metrics::{new_registry, record_startup, MetricsExporter, SharedRegistry};
use tokio::signal;
use tracing::info;

const PROFILE: &str = if cfg!(debug_assertions) { "debug" } else { "release" };

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("lregd ", env!("CARGO_PKG_VERSION")),
    about = "Cluster license registry daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Start every configured node and serve until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then print it as JSON")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/lregd.toml"));
    candidates.push(PathBuf::from("configs/lregd.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    config.validate()?;
    let load_duration = load_started.elapsed();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _log_guard = init_tracing("lregd", &config.logging)?;
            info!(config_path = %loaded.source.display(), nodes = config.cluster.nodes.len(), "configuration loaded");

            let registry = new_registry();
            record_startup(&registry, env!("CARGO_PKG_VERSION"), PROFILE, load_duration)?;
            run_daemon(config, registry).await?
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry) -> Result<()> {
    let exporter = if config.metrics.enabled {
        Some(MetricsExporter::bind(registry.clone(), config.metrics.listen).await?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let cluster = LocalCluster::start(&config, Arc::new(SystemClock), Some(registry))?;
    cluster.spawn_heartbeats();
    cluster.spawn_sweepers();

    info!(
        cluster = %cluster.name(),
        leader = cluster.leader().map(|node| node.id().to_owned()).as_deref().unwrap_or("none"),
        "daemon running; waiting for termination signal"
    );
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    cluster.shutdown().await;

    if let Some(exporter) = exporter {
        exporter.stop().await?;
    }
    Ok(())
}
