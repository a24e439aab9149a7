use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::NodeError;

pub const API_KEY_ENV: &str = "LLM_API_KEY";
pub const PRIVATE_KEY_ENV: &str = "PRIVATE_KEY";

const MAX_QUOTA_LIMIT: u64 = 1_000_000;
const MIN_PROXY_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Seedance,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Anthropic => "anthropic",
            Backend::OpenAi => "openai",
            Backend::Seedance => "seedance",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Backend::Anthropic),
            "openai" => Ok(Backend::OpenAi),
            "seedance" => Ok(Backend::Seedance),
            other => Err(NodeError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
}

impl Network {
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://eth-mainnet.g.alchemy.com/v2/demo",
            Network::Testnet => "https://eth-sepolia.g.alchemy.com/v2/demo",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: Backend,
    pub api_key: String,
    pub models: Vec<String>,
    /// Cumulative token budget for the active adapter. 0 disables the check.
    pub max_quota: u64,
    pub base_url: Option<String>,
    pub price_per_1k_tokens: f64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Anthropic,
            api_key: String::new(),
            models: vec![
                "claude-3-opus-20240229".to_string(),
                "claude-3-sonnet-20240229".to_string(),
            ],
            max_quota: 10_000,
            base_url: None,
            price_per_1k_tokens: 0.0,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub bootstrap_peers: Vec<String>,
    pub relay_enabled: bool,
    pub mdns_enabled: bool,
    /// 0 lets the OS pick a port.
    pub port: u16,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            relay_enabled: true,
            mdns_enabled: true,
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfig {
    pub network: Network,
    pub private_key: Option<String>,
    pub rpc_url: Option<String>,
    pub stake_manager_address: Option<String>,
}

impl BlockchainConfig {
    pub fn rpc_url(&self) -> &str {
        self.rpc_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_rpc_url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 120,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub llm: LlmConfig,
    pub p2p: P2pConfig,
    pub blockchain: BlockchainConfig,
    pub proxy: ProxyConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "Provider Node".to_string(),
            llm: LlmConfig::default(),
            p2p: P2pConfig::default(),
            blockchain: BlockchainConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

/// Partial update for [`NodeConfig`]; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigUpdate {
    pub node_name: Option<String>,
    pub llm: Option<LlmConfigUpdate>,
    pub p2p: Option<P2pConfigUpdate>,
    pub blockchain: Option<BlockchainConfigUpdate>,
    pub proxy: Option<ProxyConfigUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfigUpdate {
    pub backend: Option<Backend>,
    pub api_key: Option<String>,
    pub models: Option<Vec<String>>,
    pub max_quota: Option<u64>,
    pub base_url: Option<String>,
    pub price_per_1k_tokens: Option<f64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfigUpdate {
    pub bootstrap_peers: Option<Vec<String>>,
    pub relay_enabled: Option<bool>,
    pub mdns_enabled: Option<bool>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfigUpdate {
    pub network: Option<Network>,
    pub private_key: Option<String>,
    pub rpc_url: Option<String>,
    pub stake_manager_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfigUpdate {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub request_timeout_secs: Option<u64>,
}

impl ProxyConfigUpdate {
    pub fn port(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Default::default()
        }
    }
}

/// Sections whose values differ after an update was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub node_name: bool,
    pub llm: bool,
    pub p2p: bool,
    pub blockchain: bool,
    pub proxy: bool,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        !(self.node_name || self.llm || self.p2p || self.blockchain || self.proxy)
    }

    /// Whether the advertised provider metadata must be republished.
    pub fn affects_provider_info(&self) -> bool {
        self.node_name || self.llm
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl NodeConfig {
    /// Reads a TOML file, applies environment secrets and validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: NodeConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var(API_KEY_ENV) {
            if !api_key.is_empty() {
                self.llm.api_key = api_key;
            }
        }
        if let Ok(private_key) = std::env::var(PRIVATE_KEY_ENV) {
            if !private_key.is_empty() {
                self.blockchain.private_key = Some(private_key);
            }
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let name_len = self.node_name.chars().count();
        if !(3..=50).contains(&name_len) {
            return Err(NodeError::Config(
                "node_name must be between 3 and 50 characters".to_string(),
            ));
        }

        let api_key = &self.llm.api_key;
        if !api_key.is_empty() {
            if api_key.len() < 10 {
                return Err(NodeError::Config(
                    "llm.api_key must be at least 10 characters".to_string(),
                ));
            }
            if !api_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(NodeError::Config(
                    "llm.api_key contains invalid characters".to_string(),
                ));
            }
        }
        if self.llm.models.is_empty() {
            return Err(NodeError::Config(
                "llm.models must list at least one model".to_string(),
            ));
        }
        if self.llm.max_quota > MAX_QUOTA_LIMIT {
            return Err(NodeError::Config(format!(
                "llm.max_quota must be at most {MAX_QUOTA_LIMIT}"
            )));
        }
        if self.llm.price_per_1k_tokens < 0.0 {
            return Err(NodeError::Config(
                "llm.price_per_1k_tokens must not be negative".to_string(),
            ));
        }
        if let Some(base_url) = &self.llm.base_url {
            validate_http_url("llm.base_url", base_url)?;
        }

        for peer in &self.p2p.bootstrap_peers {
            peer.parse::<p2p::Multiaddr>().map_err(|e| {
                NodeError::Config(format!("invalid bootstrap peer {peer}: {e}"))
            })?;
        }

        if let Some(private_key) = &self.blockchain.private_key {
            let key = private_key.trim_start_matches("0x");
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(NodeError::Config(
                    "blockchain.private_key must be 32 bytes of hex".to_string(),
                ));
            }
        }
        if let Some(rpc_url) = &self.blockchain.rpc_url {
            validate_http_url("blockchain.rpc_url", rpc_url)?;
        }
        if let Some(address) = &self.blockchain.stake_manager_address {
            let hex = address.strip_prefix("0x").unwrap_or_default();
            if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(NodeError::Config(
                    "blockchain.stake_manager_address is not a valid address".to_string(),
                ));
            }
        }

        if self.proxy.port < MIN_PROXY_PORT {
            return Err(NodeError::Config(format!(
                "proxy.port must be between {MIN_PROXY_PORT} and 65535"
            )));
        }
        if self.proxy.request_timeout_secs == 0 {
            return Err(NodeError::Config(
                "proxy.request_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Merges `update` into this config. The merged config is validated first;
    /// on failure `self` is left unchanged.
    pub fn apply(&mut self, update: NodeConfigUpdate) -> Result<ConfigChanges, NodeError> {
        let mut next = self.clone();

        set(&mut next.node_name, update.node_name);
        if let Some(llm) = update.llm {
            set(&mut next.llm.backend, llm.backend);
            set(&mut next.llm.api_key, llm.api_key);
            set(&mut next.llm.models, llm.models);
            set(&mut next.llm.max_quota, llm.max_quota);
            set(&mut next.llm.price_per_1k_tokens, llm.price_per_1k_tokens);
            set(&mut next.llm.max_retries, llm.max_retries);
            if llm.base_url.is_some() {
                next.llm.base_url = llm.base_url;
            }
        }
        if let Some(p2p) = update.p2p {
            set(&mut next.p2p.bootstrap_peers, p2p.bootstrap_peers);
            set(&mut next.p2p.relay_enabled, p2p.relay_enabled);
            set(&mut next.p2p.mdns_enabled, p2p.mdns_enabled);
            set(&mut next.p2p.port, p2p.port);
        }
        if let Some(blockchain) = update.blockchain {
            set(&mut next.blockchain.network, blockchain.network);
            if blockchain.private_key.is_some() {
                next.blockchain.private_key = blockchain.private_key;
            }
            if blockchain.rpc_url.is_some() {
                next.blockchain.rpc_url = blockchain.rpc_url;
            }
            if blockchain.stake_manager_address.is_some() {
                next.blockchain.stake_manager_address = blockchain.stake_manager_address;
            }
        }
        if let Some(proxy) = update.proxy {
            set(&mut next.proxy.enabled, proxy.enabled);
            set(&mut next.proxy.host, proxy.host);
            set(&mut next.proxy.port, proxy.port);
            set(&mut next.proxy.request_timeout_secs, proxy.request_timeout_secs);
        }

        next.validate()?;

        let changes = ConfigChanges {
            node_name: next.node_name != self.node_name,
            llm: next.llm != self.llm,
            p2p: next.p2p != self.p2p,
            blockchain: next.blockchain != self.blockchain,
            proxy: next.proxy != self.proxy,
        };
        *self = next;
        Ok(changes)
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), NodeError> {
    let url = url::Url::parse(value)
        .map_err(|e| NodeError::Config(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NodeError::Config(format!("{field} must be an http(s) URL")));
    }
    Ok(())
}
