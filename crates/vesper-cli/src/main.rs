//! VESPER CLI
//!
//! NAT-hole rendezvous server and STUN discovery tool.

mod config;
mod serve;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::Config;

/// VESPER - NAT-hole rendezvous for peer-to-peer tunnels
#[derive(Parser)]
#[command(name = "vesper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover this host's external UDP mappings and classify its NAT
    Discover {
        /// STUN server (repeatable, overrides the configured list)
        #[arg(short, long = "stun")]
        stun: Vec<String>,

        /// Local address to bind
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Run the rendezvous server
    Serve {
        /// Listen address (overrides `server.listen_addr`)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Discover { stun, bind } => {
            discover(stun, bind, &config).await?;
        }
        Commands::Serve { bind } => {
            let addr = match bind {
                Some(addr) => addr,
                None => config.parse_listen_addr()?,
            };
            serve::run(&config, addr).await?;
        }
    }

    Ok(())
}

/// Run STUN discovery and print the mappings and NAT classification
async fn discover(stun: Vec<String>, bind: Option<SocketAddr>, config: &Config) -> anyhow::Result<()> {
    let servers = if stun.is_empty() {
        config.stun.servers.clone()
    } else {
        stun
    };

    let discovery =
        vesper_nathole::discover(&servers, bind, &config.discovery_config()).await?;

    println!("Local address: {}", discovery.local_addr);
    for addr in &discovery.external_addrs {
        println!("External address: {addr}");
    }

    let assisted = vec![discovery.local_addr.ip().to_string()];
    let feature = vesper_nathole::classify_nat_feature(&discovery.mapped_addrs(), &assisted)?;
    println!("NAT type: {} ({})", feature.nat_type, feature.behavior);
    println!("{}", serde_json::to_string_pretty(&feature)?);

    Ok(())
}
