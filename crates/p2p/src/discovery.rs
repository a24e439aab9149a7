use anyhow::{Context as _, Result};
use libp2p::kad::QueryResult;
use libp2p::kad::{self, store::RecordStore, QueryId, Quorum};
use libp2p::PeerId;
use std::collections::HashMap;

pub const PROVIDER_DHT_KEY: &str = "provider-node/1.0.0";

/// Capability key every provider announces itself under.
pub const LLM_PROXY_CAPABILITY: &str = "llm-proxy";

pub fn provider_dht_key_with_peer_id(peer_id: &PeerId) -> String {
    format!("{PROVIDER_DHT_KEY}/{peer_id}")
}

pub fn capability_dht_key(capability: &str) -> String {
    format!("{PROVIDER_DHT_KEY}/capability/{capability}")
}

pub struct KademliaActionWithChannel {
    kad_action: KademliaAction,
    result_tx: tokio::sync::mpsc::Sender<Result<QueryResult>>,
}

impl KademliaActionWithChannel {
    pub fn new(
        kad_action: KademliaAction,
        result_tx: tokio::sync::mpsc::Sender<Result<QueryResult>>,
    ) -> Self {
        Self {
            kad_action,
            result_tx,
        }
    }
}

#[derive(Debug, Clone)]
pub enum KademliaAction {
    PutRecord { key: Vec<u8>, value: Vec<u8> },
    GetRecord(Vec<u8>),
    StartProviding(Vec<u8>),
    StopProviding(Vec<u8>),
    GetProviders(Vec<u8>),
}

impl KademliaAction {
    pub fn into_kademlia_action_with_channel(
        self,
    ) -> (
        KademliaActionWithChannel,
        tokio::sync::mpsc::Receiver<Result<QueryResult>>,
    ) {
        let (result_tx, result_rx) = tokio::sync::mpsc::channel(8);
        (
            KademliaActionWithChannel {
                kad_action: self,
                result_tx,
            },
            result_rx,
        )
    }
}

pub(crate) struct OngoingKademliaQuery {
    pub(crate) result_tx: tokio::sync::mpsc::Sender<Result<QueryResult>>,
}

pub(crate) type OngoingKademliaQueries = HashMap<QueryId, OngoingKademliaQuery>;

pub(crate) fn handle_kademlia_action<S: RecordStore + Send + 'static>(
    kademlia: &mut kad::Behaviour<S>,
    action: KademliaActionWithChannel,
    ongoing_queries: &mut OngoingKademliaQueries,
) -> Result<()> {
    let KademliaActionWithChannel {
        kad_action,
        result_tx,
    } = action;

    let query_id = match kad_action {
        KademliaAction::PutRecord { key, value } => kademlia
            .put_record(
                kad::Record {
                    key: key.into(),
                    value,
                    publisher: None,
                    expires: None,
                },
                Quorum::One,
            )
            .context("failed to put record in dht")?,
        KademliaAction::GetRecord(key) => kademlia.get_record(key.into()),
        KademliaAction::StartProviding(key) => kademlia
            .start_providing(key.into())
            .context("failed to start providing key in dht")?,
        KademliaAction::StopProviding(key) => {
            kademlia.stop_providing(&key.into());
            return Ok(());
        }
        KademliaAction::GetProviders(key) => kademlia.get_providers(key.into()),
    };

    ongoing_queries.insert(query_id, OngoingKademliaQuery { result_tx });
    Ok(())
}
