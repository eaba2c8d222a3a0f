//! # anax Entry Point
//!
//! ```text
//! anax run --config <file>
//! anax unconfigure [--remove-node] --config <file>
//! ```
//!
//! ## Initialization Flow
//! 1. Load the env file (`ANAX_ENV_FILE`, `.env.mainnet`, `.env`)
//! 2. Initialise tracing (`ANAX_LOG_LEVEL`, default INFO)
//! 3. Load the TOML config, apply `ANAX_*` overrides, validate
//! 4. Open the database, build the exchange client and protocol handlers
//! 5. Start the governance worker, and the blockchain worker when a
//!    `[blockchain]` table is configured
//!
//! `unconfigure` queues the node shutdown command right away and exits once
//! `NodeShutdownComplete` is published.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};

use anax_chain::{BlockchainWorker, ContractFactory, HttpContractFactory};
use anax_common::events::DEFAULT_BUS_CAPACITY;
use anax_common::{AgentDb, Message, MessageBus};
use anax_node::config::{load_env_file, load_from_file};
use anax_node::{
    build_handlers, AgentConfig, ExchangeApi, ExchangeClient, GovernanceCommand, GovernanceWorker, RetryPolicy,
};

#[derive(Parser)]
#[command(name = "anax", version, about = "Edge node agreement governance agent")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted.
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Cancel all agreements, stop all services and unregister the node.
    Unconfigure {
        /// Also delete the node from the exchange.
        #[arg(long)]
        remove_node: bool,
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn log_level() -> Level {
    env::var("ANAX_LOG_LEVEL")
        .ok()
        .and_then(|v| v.trim().parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

fn load_config(path: &PathBuf) -> Result<AgentConfig> {
    let mut config = load_from_file(path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

// ════════════════════════════════════════════════════════════════════════════
// AGENT
// ════════════════════════════════════════════════════════════════════════════

struct Agent {
    bus: MessageBus,
    governance: Arc<GovernanceWorker>,
    chain: Option<Arc<BlockchainWorker>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    fn start(config: AgentConfig) -> Result<Self> {
        let db = AgentDb::open(&config.db_path)
            .with_context(|| format!("opening database at {}", config.db_path.display()))?;
        let bus = MessageBus::new(DEFAULT_BUS_CAPACITY);
        let exchange: Arc<dyn ExchangeApi> = Arc::new(ExchangeClient::new(
            &config.exchange_url,
            &config.device_id,
            &config.device_token,
        )?);
        let retry = RetryPolicy::bounded(config.exchange_retry_interval(), config.exchange_retry_count);

        let factory: Option<Arc<dyn ContractFactory>> = match &config.blockchain {
            Some(bc) => {
                bc.validate()?;
                let f: Arc<dyn ContractFactory> = Arc::new(HttpContractFactory::new(bc.gateway_url.clone())?);
                Some(f)
            }
            None => None,
        };
        let chain_account = config.blockchain.as_ref().map(|bc| bc.account_id.clone()).unwrap_or_default();
        let handlers = build_handlers(
            &db,
            &exchange,
            retry,
            &config.arch,
            &bus,
            factory.clone().map(|f| (f, chain_account)),
        );

        let mut tasks = Vec::new();
        let chain = match (&config.blockchain, factory) {
            (Some(bc), Some(factory)) => {
                let worker = Arc::new(BlockchainWorker::new(bc.clone(), db.clone(), bus.clone(), factory));
                let w = Arc::clone(&worker);
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = w.run().await {
                        error!("blockchain worker stopped: {}", e);
                    }
                }));
                Some(worker)
            }
            _ => None,
        };

        let governance = GovernanceWorker::new(config, db, bus.clone(), exchange, handlers);
        let g = Arc::clone(&governance);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = g.run().await {
                error!("governance worker stopped: {}", e);
            }
        }));

        Ok(Agent {
            bus,
            governance,
            chain,
            tasks,
        })
    }

    async fn stop(self) {
        self.governance.stop();
        if let Some(chain) = &self.chain {
            chain.stop();
        }
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!("worker task ended abnormally: {}", e);
            }
        }
    }
}

fn banner(config: &AgentConfig) {
    info!("═══════════════════════════════════════════════════════════════");
    info!("                         anax agent                            ");
    info!("═══════════════════════════════════════════════════════════════");
    info!("Device:       {}", config.device_id);
    info!("Exchange:     {}", config.exchange_url);
    info!("Database:     {}", config.db_path.display());
    info!("Policy Path:  {}", config.policy_path.display());
    info!("Arch:         {}", config.arch);
    match &config.blockchain {
        Some(bc) => info!("Blockchain:   {}/{} via {}", bc.chain_type, bc.chain_name, bc.gateway_url),
        None => info!("Blockchain:   disabled"),
    }
    info!("═══════════════════════════════════════════════════════════════");
}

async fn run(config: AgentConfig) -> Result<()> {
    let agent = Agent::start(config)?;
    info!("agent running, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("unable to listen for Ctrl+C: {}", e);
    }
    info!("stopping agent");
    agent.stop().await;
    Ok(())
}

async fn unconfigure(config: AgentConfig, remove_node: bool) -> Result<()> {
    let agent = Agent::start(config)?;
    let mut rx = agent.bus.subscribe();
    agent
        .governance
        .runtime()
        .submit(GovernanceCommand::NodeShutdown { remove_node })
        .await?;
    info!("node shutdown requested, waiting for completion");

    let outcome = loop {
        match rx.recv().await {
            Ok(Message::NodeShutdownComplete { error }) => break error,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("missed {} bus messages while waiting", n),
            Err(RecvError::Closed) => break Some("message bus closed".to_string()),
        }
    };
    agent.stop().await;
    match outcome {
        None => {
            info!("node unconfigured");
            Ok(())
        }
        Some(e) => bail!("node shutdown failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = load_env_file();
    tracing_subscriber::fmt()
        .with_max_level(log_level())
        .with_target(false)
        .init();
    if let Some(f) = env_file {
        info!("loaded environment from {}", f.display());
    }

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Run { config } => {
            let config = load_config(&config)?;
            banner(&config);
            run(config).await
        }
        Commands::Unconfigure { remove_node, config } => {
            let config = load_config(&config)?;
            banner(&config);
            unconfigure(config, remove_node).await
        }
    }
}
