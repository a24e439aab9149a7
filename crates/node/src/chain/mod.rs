use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::sol;
use log::{debug, info, warn};
use shared::web3::Wallet;
use std::time::Duration;
use url::Url;

use crate::config::{BlockchainConfig, Network};
use crate::error::NodeError;

const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

sol! {
    #[sol(rpc)]
    interface IStakeManager {
        function stake(uint256 amount) external payable;
        function claimRewards() external;
    }
}

/// Wallet and staking access for the node. Without a private key the service
/// still comes up but every signing operation fails.
pub struct BlockchainService {
    network: Network,
    rpc_url: String,
    wallet: Option<Wallet>,
    stake_manager: Option<Address>,
}

impl BlockchainService {
    pub fn initialize(config: &BlockchainConfig) -> Result<Self, NodeError> {
        let rpc_url = config.rpc_url().to_string();
        let url = Url::parse(&rpc_url)
            .map_err(|e| NodeError::Blockchain(format!("invalid rpc url {rpc_url}: {e}")))?;

        let wallet = match config.private_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Some(
                Wallet::new(key, url)
                    .map_err(|e| NodeError::Blockchain(format!("failed to load wallet: {e:#}")))?,
            ),
            None => {
                warn!("No private key configured, staking and rewards are unavailable");
                None
            }
        };

        let stake_manager = config
            .stake_manager_address
            .as_deref()
            .map(|addr| {
                addr.parse::<Address>().map_err(|e| {
                    NodeError::Blockchain(format!("invalid stake manager address {addr}: {e}"))
                })
            })
            .transpose()?;

        if let Some(wallet) = &wallet {
            info!(
                "Blockchain service ready on {} as {}",
                config.network,
                wallet.address()
            );
        }

        Ok(Self {
            network: config.network,
            rpc_url,
            wallet,
            stake_manager,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn wallet_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(Wallet::address)
    }

    fn wallet(&self) -> Result<&Wallet, NodeError> {
        self.wallet
            .as_ref()
            .ok_or(NodeError::NotInitialized("wallet"))
    }

    fn stake_manager(&self) -> Result<(Address, &Wallet), NodeError> {
        let wallet = self.wallet()?;
        let address = self.stake_manager.ok_or_else(|| {
            NodeError::Blockchain("no stake manager address configured".to_string())
        })?;
        Ok((address, wallet))
    }

    pub async fn get_balance(&self) -> Result<U256, NodeError> {
        self.wallet()?
            .get_balance()
            .await
            .map_err(|e| NodeError::Blockchain(format!("{e:#}")))
    }

    pub async fn is_connected(&self) -> bool {
        match &self.wallet {
            Some(wallet) => wallet.provider.get_block_number().await.is_ok(),
            None => false,
        }
    }

    /// Stakes `amount` wei with the stake manager and waits for inclusion.
    pub async fn stake(&self, amount: U256) -> Result<TxHash, NodeError> {
        if amount.is_zero() {
            return Err(NodeError::Validation("stake amount must be positive".into()));
        }
        let (address, wallet) = self.stake_manager()?;
        let contract = IStakeManager::new(address, wallet.provider.clone());

        debug!("Staking {amount} wei via {address}");
        let pending = contract
            .stake(amount)
            .value(amount)
            .send()
            .await
            .map_err(|e| NodeError::Blockchain(format!("stake transaction failed: {e}")))?;
        let hash = watch(pending).await?;
        info!("Staked {amount} wei in transaction {hash}");
        Ok(hash)
    }

    pub async fn claim_rewards(&self) -> Result<TxHash, NodeError> {
        let (address, wallet) = self.stake_manager()?;
        let contract = IStakeManager::new(address, wallet.provider.clone());

        let pending = contract
            .claimRewards()
            .send()
            .await
            .map_err(|e| NodeError::Blockchain(format!("claim transaction failed: {e}")))?;
        let hash = watch(pending).await?;
        info!("Claimed rewards in transaction {hash}");
        Ok(hash)
    }
}

async fn watch(
    pending: alloy::providers::PendingTransactionBuilder<alloy::network::Ethereum>,
) -> Result<TxHash, NodeError> {
    match tokio::time::timeout(WATCH_TIMEOUT, pending.watch()).await {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(e)) => Err(NodeError::Blockchain(format!(
            "transaction was not confirmed: {e}"
        ))),
        Err(_) => Err(NodeError::Blockchain(format!(
            "transaction not confirmed within {}s",
            WATCH_TIMEOUT.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn initializes_without_a_key() {
        let service = BlockchainService::initialize(&BlockchainConfig::default()).unwrap();
        assert_eq!(service.network(), Network::Testnet);
        assert_eq!(service.wallet_address(), None);
        assert_eq!(service.rpc_url(), Network::Testnet.default_rpc_url());
    }

    #[test]
    fn exposes_wallet_address_from_key() {
        let service = BlockchainService::initialize(&BlockchainConfig {
            private_key: Some(TEST_KEY.to_string()),
            rpc_url: Some("http://localhost:8545".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            service.wallet_address().unwrap().to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[tokio::test]
    async fn staking_requires_wallet_and_contract() {
        let service = BlockchainService::initialize(&BlockchainConfig::default()).unwrap();
        assert_eq!(
            service.stake(U256::from(1u64)).await,
            Err(NodeError::NotInitialized("wallet"))
        );
        assert!(!service.is_connected().await);

        let service = BlockchainService::initialize(&BlockchainConfig {
            private_key: Some(TEST_KEY.to_string()),
            rpc_url: Some("http://localhost:8545".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            service.claim_rewards().await,
            Err(NodeError::Blockchain(_))
        ));
        assert!(matches!(
            service.stake(U256::ZERO).await,
            Err(NodeError::Validation(_))
        ));
    }

    #[test]
    fn rejects_malformed_contract_address() {
        let result = BlockchainService::initialize(&BlockchainConfig {
            stake_manager_address: Some("0x1234".to_string()),
            ..Default::default()
        });
        assert!(matches!(result, Err(NodeError::Blockchain(_))));
    }
}
