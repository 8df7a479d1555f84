//! Launch point for the kernel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use hri_core_lib::config::{BrokerAddr, KernelConfig};
use hri_core_lib::kernel::{Components, Kernel};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "hri-kernel",
    version,
    about = "Message broker and dialogue interpreter for human-robot interaction"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the message broker
    #[arg(long)]
    broker: bool,

    /// Run the dialogue interpreter
    #[arg(long)]
    interpreter: bool,

    /// Run the trajectory bridge
    #[arg(long)]
    trajectory: bool,

    /// Catalog source file (overrides the config)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Broker address, `tcp://host:port` or `local:<name>` (overrides the config)
    #[arg(long)]
    address: Option<BrokerAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let components = Components {
        broker: cli.broker,
        interpreter: cli.interpreter,
        trajectory: cli.trajectory,
    };
    if !components.any() {
        Cli::command().print_help()?;
        std::process::exit(2);
    }

    let mut config = match &cli.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    if let Some(catalog) = cli.catalog {
        config.catalog.path = Some(catalog);
    }
    if let Some(address) = cli.address {
        config.broker.address = address;
    }

    info!("hri-kernel v{} starting", env!("CARGO_PKG_VERSION"));
    Kernel::new(config).run(components).await?;
    Ok(())
}
