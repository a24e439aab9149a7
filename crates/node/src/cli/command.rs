use alloy::primitives::utils::format_ether;
use alloy::primitives::U256;
use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use shared::models::node::NodeState;
use shared::web3::Wallet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::BlockchainService;
use crate::config::{NodeConfig, API_KEY_ENV, PRIVATE_KEY_ENV};
use crate::console::Console;
use crate::llm::create_adapter;
use crate::node::{NodeManager, NodeManagerOptions};
use crate::state::IdentityStore;

const APP_VERSION: &str = match option_env!("PROVIDER_NODE_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

const DEFAULT_CONFIG_PATH: &str = "provider-node.toml";

#[derive(Parser)]
#[command(author, version = APP_VERSION, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node and serve until a shutdown signal arrives
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Directory holding the persisted peer identity
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Log level
        #[arg(long)]
        log_level: Option<String>,

        /// Loki URL
        #[arg(long)]
        loki_url: Option<String>,
    },

    /// Write a configuration file with default values
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Check the configured API key against its backend
    CheckKey {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Generate a fresh wallet key pair
    GenerateWallet {},

    /// Show the configured wallet and its balance
    Wallet {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Stake an amount (in wei) with the stake manager
    Stake {
        #[arg(long)]
        amount: String,

        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Claim accumulated staking rewards
    ClaimRewards {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

pub async fn execute_command(
    command: &Commands,
    cancellation_token: CancellationToken,
) -> Result<()> {
    match command {
        Commands::Run {
            config, state_dir, ..
        } => run_node(config, state_dir.clone(), cancellation_token).await,

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                bail!(
                    "{} already exists, pass --force to overwrite it",
                    output.display()
                );
            }
            let contents = NodeConfig::default().to_toml()?;
            std::fs::write(output, contents)
                .with_context(|| format!("failed to write {}", output.display()))?;
            Console::success(&format!("Wrote default configuration to {}", output.display()));
            Console::info(
                "Secrets",
                &format!("set {API_KEY_ENV} and {PRIVATE_KEY_ENV} or edit the file"),
            );
            Ok(())
        }

        Commands::CheckKey { config } => {
            let config = NodeConfig::load(config)?;
            if config.llm.api_key.is_empty() {
                bail!("no API key configured, set llm.api_key or {API_KEY_ENV}");
            }
            let adapter = create_adapter(&config.llm)?;
            Console::progress(&format!("Checking API key against {}", adapter.name()));
            if adapter.validate_api_key(&config.llm.api_key).await {
                Console::success("API key accepted");
                Ok(())
            } else {
                bail!("{} rejected the configured API key", adapter.name())
            }
        }

        Commands::GenerateWallet {} => {
            let (address, private_key) = Wallet::generate();
            Console::section("New wallet");
            Console::info("Address", &address.to_string());
            Console::info("Private key", &private_key);
            println!("\nTo set the environment variable in your current shell session:");
            println!("export {PRIVATE_KEY_ENV}={private_key}");
            Ok(())
        }

        Commands::Wallet { config } => {
            let service = blockchain(config)?;
            let Some(address) = service.wallet_address() else {
                bail!("no private key configured, set blockchain.private_key or {PRIVATE_KEY_ENV}");
            };
            Console::section("Wallet");
            Console::info("Network", &service.network().to_string());
            Console::info("RPC", service.rpc_url());
            Console::info("Address", &address.to_string());
            if !service.is_connected().await {
                Console::warning("RPC endpoint is unreachable");
                return Ok(());
            }
            let balance = service.get_balance().await?;
            Console::info("Balance", &format_ether(balance));
            Ok(())
        }

        Commands::Stake { amount, config } => {
            let amount = U256::from_str(amount)
                .with_context(|| format!("invalid stake amount {amount}"))?;
            let service = blockchain(config)?;
            Console::progress(&format!("Staking {} ETH", format_ether(amount)));
            let hash = service.stake(amount).await?;
            Console::success(&format!("Stake confirmed in {hash}"));
            Ok(())
        }

        Commands::ClaimRewards { config } => {
            let service = blockchain(config)?;
            Console::progress("Claiming rewards");
            let hash = service.claim_rewards().await?;
            Console::success(&format!("Rewards claimed in {hash}"));
            Ok(())
        }
    }
}

fn blockchain(config: &Path) -> Result<BlockchainService> {
    let config = NodeConfig::load(config)?;
    Ok(BlockchainService::initialize(&config.blockchain)?)
}

async fn run_node(
    config_path: &Path,
    state_dir: Option<PathBuf>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let config = NodeConfig::load(config_path)?;
    Console::section(&config.node_name);
    Console::info("Backend", config.llm.backend.as_str());
    Console::info("Models", &config.llm.models.join(", "));

    let manager = Arc::new(NodeManager::new(NodeManagerOptions {
        identity: IdentityStore::new(state_dir),
        ..Default::default()
    }));
    manager.initialize(config).await?;

    let subscription = manager.on_status_update(|status| match status.status {
        NodeState::Error => error!(
            "Node entered error state: {}",
            status.last_error.as_deref().unwrap_or("unknown error")
        ),
        NodeState::Running => info!(
            "Node running: {} peers, {} requests, {} tokens, up {}s",
            status.peer_count,
            status.requests_processed,
            status.total_tokens,
            status.uptime_seconds
        ),
        state => info!("Node {state}"),
    });

    let started = manager.start().await;
    if let Err(e) = &started {
        Console::user_error(&format!("Failed to start node: {e}"));
    } else {
        if let Some(peer_id) = manager.peer_id().await {
            Console::info("Peer ID", &peer_id.to_string());
        }
        for addr in manager.listen_addrs().await {
            Console::info("Listening", &addr.to_string());
        }
        if let Some(port) = manager.proxy_port().await {
            Console::info("Gateway", &format!("http://localhost:{port}/v1/inference"));
        }
        if let Some(address) = manager.wallet_address().await {
            Console::info("Wallet", &address.to_string());
        }
        Console::success("Node is running, press Ctrl+C to stop");
        cancellation_token.cancelled().await;
    }

    let stopped = manager.stop().await;
    subscription.unsubscribe();
    started?;
    stopped?;
    Console::success("Node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "provider-node",
            "run",
            "--config",
            "node.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                config,
                state_dir,
                log_level,
                loki_url,
            } => {
                assert_eq!(config, PathBuf::from("node.toml"));
                assert_eq!(state_dir, None);
                assert_eq!(log_level.as_deref(), Some("debug"));
                assert_eq!(loki_url, None);
            }
            _ => panic!("expected run command"),
        }
    }

    #[tokio::test]
    async fn init_config_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("node.toml");
        let command = Commands::InitConfig {
            output: output.clone(),
            force: false,
        };

        execute_command(&command, CancellationToken::new())
            .await
            .unwrap();
        let written: NodeConfig = toml::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written, NodeConfig::default());

        assert!(execute_command(&command, CancellationToken::new())
            .await
            .is_err());

        let forced = Commands::InitConfig {
            output,
            force: true,
        };
        execute_command(&forced, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stake_rejects_malformed_amount() {
        let command = Commands::Stake {
            amount: "lots".to_string(),
            config: PathBuf::from("unused.toml"),
        };
        let err = execute_command(&command, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid stake amount"));
    }
}
