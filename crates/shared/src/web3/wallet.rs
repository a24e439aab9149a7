use alloy::{
    network::EthereumWallet,
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
};
use anyhow::{Context as _, Result};
use url::Url;

pub type WalletProvider = DynProvider;

pub struct Wallet {
    pub wallet: EthereumWallet,
    pub signer: PrivateKeySigner,
    pub provider: WalletProvider,
}

impl Wallet {
    pub fn new(private_key: &str, provider_url: Url) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim_start_matches("0x")
            .parse()
            .context("invalid private key")?;
        let wallet = EthereumWallet::from(signer.clone());

        let provider = ProviderBuilder::new()
            .wallet(wallet.clone())
            .connect_http(provider_url)
            .erased();

        Ok(Self {
            wallet,
            signer,
            provider,
        })
    }

    /// Fresh random key pair, returned as (address, hex private key).
    pub fn generate() -> (Address, String) {
        let signer = PrivateKeySigner::random();
        let key = hex::encode(signer.credential().to_bytes());
        (signer.address(), key)
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub async fn get_balance(&self) -> Result<U256> {
        let balance = self
            .provider
            .get_balance(self.address())
            .await
            .context("failed to fetch wallet balance")?;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // anvil's first default account
    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn wallet_address_matches_key() {
        let wallet = Wallet::new(TEST_KEY, Url::parse("http://localhost:8545").unwrap()).unwrap();
        assert_eq!(
            wallet.address().to_string().to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn generated_key_round_trips() {
        let (address, key) = Wallet::generate();
        assert_eq!(key.len(), 64);
        let wallet = Wallet::new(&key, Url::parse("http://localhost:8545").unwrap()).unwrap();
        assert_eq!(wallet.address(), address);
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(Wallet::new("not-a-key", Url::parse("http://localhost:8545").unwrap()).is_err());
    }
}
