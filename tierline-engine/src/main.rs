//! Tierline - run one node of the relay chain.
//!
//! Start the tiers bottom-up, each in its own process:
//!
//! ```text
//! tierline storage
//! tierline coordinator
//! tierline edge
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tierline_engine::{CoordinatorNode, EdgeNode, StorageNode, TierlineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tierline - three-tier request relay
#[derive(Parser, Debug)]
#[command(name = "tierline")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run in verbose mode (debug logging)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    node: NodeCommand,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Run the storage node
    Storage {
        /// Override the listen address
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },
    /// Run the coordinator node
    Coordinator {
        /// Override the listen address
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Override the storage node address
        #[arg(long, value_name = "ADDR")]
        storage: Option<String>,
    },
    /// Run the edge node
    Edge {
        /// Override the HTTP listen address
        #[arg(long, value_name = "ADDR")]
        http: Option<String>,

        /// Override the subscriber listen address
        #[arg(long, value_name = "ADDR")]
        subscribers: Option<String>,

        /// Override the coordinator node address
        #[arg(long, value_name = "ADDR")]
        coordinator: Option<String>,
    },
}

/// Which node this process runs.
#[derive(Debug, Clone, Copy)]
enum Role {
    Storage,
    Coordinator,
    Edge,
}

impl NodeCommand {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(self, config: &mut TierlineConfig) -> Role {
        match self {
            Self::Storage { listen } => {
                if let Some(listen) = listen {
                    config.storage.listen = listen;
                }
                Role::Storage
            }
            Self::Coordinator { listen, storage } => {
                if let Some(listen) = listen {
                    config.coordinator.listen = listen;
                }
                if let Some(storage) = storage {
                    config.coordinator.storage_addr = storage;
                }
                Role::Coordinator
            }
            Self::Edge {
                http,
                subscribers,
                coordinator,
            } => {
                if let Some(http) = http {
                    config.edge.http_listen = http;
                }
                if let Some(subscribers) = subscribers {
                    config.edge.subscriber_listen = subscribers;
                }
                if let Some(coordinator) = coordinator {
                    config.edge.coordinator_addr = coordinator;
                }
                Role::Edge
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let mut config =
        TierlineConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;
    let role = args.node.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        "Starting {:?} node (wire_format: {:?})",
        role, config.channel.wire_format
    );

    tokio::select! {
        result = run(role, &config) => result?,
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received, stopping {:?} node", role);
        }
    }
    Ok(())
}

async fn run(role: Role, config: &TierlineConfig) -> Result<()> {
    let format = config.channel.wire_format;
    match role {
        Role::Storage => StorageNode::bind(&config.storage, format)
            .await
            .context("Failed to start storage node")?
            .run()
            .await
            .context("Storage node failed"),
        Role::Coordinator => CoordinatorNode::bind(&config.coordinator, format)
            .await
            .context("Failed to start coordinator node")?
            .run()
            .await
            .context("Coordinator node failed"),
        Role::Edge => EdgeNode::bind(&config.edge, format)
            .await
            .context("Failed to start edge node")?
            .run()
            .await
            .context("Edge node failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C)"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
    }
    Ok(())
}
