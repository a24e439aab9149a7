use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const IDENTITY_FILENAME: &str = "identity.json";

pub fn default_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("io", "provider-node", "provider-node")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIdentity {
    /// Protobuf-encoded libp2p keypair, hex.
    p2p_keypair: String,
}

impl PersistedIdentity {
    fn from_keypair(keypair: &p2p::Keypair) -> Result<Self> {
        let encoded = keypair
            .to_protobuf_encoding()
            .context("failed to encode p2p keypair")?;
        Ok(Self {
            p2p_keypair: hex::encode(encoded),
        })
    }

    fn keypair(&self) -> Result<p2p::Keypair> {
        let bytes = hex::decode(&self.p2p_keypair).context("p2p keypair is not valid hex")?;
        p2p::Keypair::from_protobuf_encoding(&bytes).context("failed to decode p2p keypair")
    }
}

/// Persists the node's p2p identity so its peer id survives restarts.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    state_dir: Option<PathBuf>,
}

impl IdentityStore {
    /// `None` falls back to the platform data directory.
    pub fn new(state_dir: Option<PathBuf>) -> Self {
        let state_dir = state_dir.or_else(default_state_dir);
        debug!("State dir: {state_dir:?}");
        Self { state_dir }
    }

    /// Store that never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self { state_dir: None }
    }

    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Loads the stored keypair, or generates and stores a new one when the
    /// file is missing or unreadable.
    pub fn load_or_create(&self) -> Result<p2p::Keypair> {
        let Some(dir) = &self.state_dir else {
            return Ok(p2p::Keypair::generate_ed25519());
        };

        match Self::load(dir) {
            Ok(Some(keypair)) => {
                info!(
                    "Loaded p2p identity {}",
                    keypair.public().to_peer_id()
                );
                return Ok(keypair);
            }
            Ok(None) => debug!("No identity file in {}, generating one", dir.display()),
            Err(e) => warn!("Discarding unreadable identity file: {e:#}"),
        }

        let keypair = p2p::Keypair::generate_ed25519();
        self.save(&keypair)?;
        info!(
            "Generated new p2p identity {}",
            keypair.public().to_peer_id()
        );
        Ok(keypair)
    }

    fn load(dir: &Path) -> Result<Option<p2p::Keypair>> {
        let path = dir.join(IDENTITY_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let persisted: PersistedIdentity = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        persisted.keypair().map(Some)
    }

    fn save(&self, keypair: &p2p::Keypair) -> Result<()> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        let path = dir.join(IDENTITY_FILENAME);
        let json = serde_json::to_string_pretty(&PersistedIdentity::from_keypair(keypair)?)?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        debug!("Saved p2p identity to {}", path.display());
        Ok(())
    }
}
