//! dnsbridge - DNS TXT tunnel to a framed TCP backend
//!
//! Answers TXT queries under two suffix domains and relays their payloads
//! to and from a local length-prefixed TCP service.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dnsbridge::config::StoreKind;
use dnsbridge::{BridgeConfig, DnsBridgeServer, Router};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "dnsbridge")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "DNS TXT tunnel to a framed TCP backend", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DNSBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the DNS responder
    Serve {
        /// UDP listen address
        #[arg(short, long, env = "DNSBRIDGE_LISTEN")]
        listen: Option<SocketAddr>,

        /// Suffix domain for agent → backend traffic
        #[arg(long)]
        input_domain: Option<String>,

        /// Suffix domain for backend → agent traffic
        #[arg(long)]
        output_domain: Option<String>,

        /// Backend TCP address
        #[arg(short, long, env = "DNSBRIDGE_BACKEND")]
        backend: Option<SocketAddr>,

        /// SQLite database for inbound fragments
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,

        /// Keep inbound fragments in memory instead of SQLite
        #[arg(long, conflicts_with = "db")]
        memory_store: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            input_domain,
            output_domain,
            backend,
            db,
            memory_store,
        } => {
            let mut config = load_config(cli.config.as_ref())?;

            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(input) = input_domain {
                config.domains.input = input;
            }
            if let Some(output) = output_domain {
                config.domains.output = output;
            }
            if let Some(backend) = backend {
                config.backend.addr = backend;
            }
            if let Some(db) = db {
                config.store.kind = StoreKind::Sqlite;
                config.store.path = db;
            }
            if memory_store {
                config.store.kind = StoreKind::Memory;
            }

            run_serve(config).await?;
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            BridgeConfig::default()
                .to_file(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => {
            warn!("No config file given, using defaults");
            Ok(BridgeConfig::default())
        }
    }
}

async fn run_serve(config: BridgeConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    info!("dnsbridge {}", LONG_VERSION);
    info!(
        "Input domain: {}, output domain: {}",
        config.domains.input, config.domains.output
    );
    info!(
        "Backend: {} (poll timeout {}, connect timeout {}, send timeout {})",
        config.backend.addr,
        humantime::format_duration(config.backend.recv_timeout),
        humantime::format_duration(config.backend.connect_timeout),
        humantime::format_duration(config.backend.send_timeout)
    );
    match config.store.kind {
        StoreKind::Sqlite => info!("Fragment store: sqlite at {}", config.store.path.display()),
        StoreKind::Memory => info!("Fragment store: memory"),
    }

    let router = Arc::new(Router::from_config(&config).context("Failed to build router")?);
    let server = DnsBridgeServer::bind(config.listen_addr, router)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    server.run().await?;
    info!("dnsbridge stopped");
    Ok(())
}
