use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use relog_repl::{Master, Secondary};

use crate::api;
use crate::config::{parse_secondary_info, NodeConfig};

#[derive(Parser)]
#[command(name = "relog")]
#[command(about = "Replicated log node", long_about = None)]
pub struct Cli {
    /// Node config file (.toml or .json)
    #[arg(short, long, env = "RELOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP API address
    #[arg(long, env = "RELOG_HTTP_ADDR")]
    pub http_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Accept writes and replicate them to the followers
    Master {
        /// Follower mapping, e.g. {"secondary-1": 65441}
        #[arg(long, env = "SECONDARY_INFO")]
        secondary_info: Option<String>,

        #[arg(long)]
        quorum_timeout_ms: Option<u64>,
    },
    /// Receive replicated writes from the master
    Secondary {
        /// Replication listener port
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Delay acknowledgements with this probability
        #[arg(long)]
        delay_probability: Option<f64>,

        #[arg(long)]
        delay_ms: Option<u64>,
    },
}

impl Cli {
    /// Config file contents with command-line and environment overrides applied.
    pub fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) if path.exists() => NodeConfig::from_file(path)?,
            Some(path) => {
                tracing::warn!("Config file not found, using defaults: {}", path.display());
                NodeConfig::default()
            }
            None => NodeConfig::default(),
        };

        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }

        match &self.command {
            Command::Master {
                secondary_info,
                quorum_timeout_ms,
            } => {
                if let Some(raw) = secondary_info {
                    config.master.followers = parse_secondary_info(raw)?;
                }
                if let Some(ms) = quorum_timeout_ms {
                    config.master.quorum_timeout_ms = *ms;
                }
            }
            Command::Secondary {
                port,
                delay_probability,
                delay_ms,
            } => {
                if let Some(port) = port {
                    config.secondary.set_port(*port);
                }
                if let Some(p) = delay_probability {
                    config.secondary.artificial_delay = true;
                    config.secondary.delay_probability = *p;
                }
                if let Some(ms) = delay_ms {
                    config.secondary.delay_ms = *ms;
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.node_config()?;
        match self.command {
            Command::Master { .. } => run_master(config).await,
            Command::Secondary { .. } => run_secondary(config).await,
        }
    }
}

async fn run_master(config: NodeConfig) -> Result<()> {
    tracing::info!(
        "Starting master with followers: {:?}",
        config
            .master
            .followers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    );
    let master = Arc::new(Master::start(config.master.to_master_config()));

    let result = api::serve(api::master_router(master.clone()), config.http_addr, shutdown_signal()).await;
    master.shutdown().await;
    result
}

async fn run_secondary(config: NodeConfig) -> Result<()> {
    let secondary = Arc::new(Secondary::start(config.secondary.to_secondary_config()).await?);

    let result =
        api::serve(api::secondary_router(secondary.clone()), config.http_addr, shutdown_signal()).await;
    secondary.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
