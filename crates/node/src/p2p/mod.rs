use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use log::{debug, error, info, warn};
use p2p::{
    IncomingMessage, KademliaAction, KademliaActionWithChannel, Libp2pIncomingMessage, Multiaddr,
    NetworkState, NodeBuilder, OutgoingMessage, PeerId, Request, RequestMessage, Response,
    ResponseChannel, ResponseMessage,
};
use shared::models::node::ProviderInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::NodeError;

pub mod handler;

pub use handler::PeerRequestHandler;

const LISTEN_WAIT: Duration = Duration::from_secs(1);
const LISTEN_POLL: Duration = Duration::from_millis(50);

/// Answers inference requests arriving from remote peers.
#[async_trait]
pub trait InboundRequestHandler: Send + Sync {
    async fn handle_request(&self, peer: PeerId, request: RequestMessage) -> ResponseMessage;
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn InboundRequestHandler>>>>;

#[derive(Debug, Clone, Default)]
pub struct P2PConfig {
    pub bootstrap_peers: Vec<String>,
    pub relay_enabled: bool,
    pub mdns_enabled: bool,
    pub port: u16,
    pub node_name: String,
    pub backend: String,
    pub models: Vec<String>,
}

/// Holds the response channel of every request still waiting for an answer.
#[derive(Clone)]
struct ResponseRouter {
    pending: Arc<Mutex<HashMap<String, ResponseChannel>>>,
    outgoing: Sender<OutgoingMessage>,
}

impl ResponseRouter {
    fn new(outgoing: Sender<OutgoingMessage>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing,
        }
    }

    /// Hands the channel back if a request with the same id is still pending.
    fn register(&self, request_id: &str, channel: ResponseChannel) -> Result<(), ResponseChannel> {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending.contains_key(request_id) {
            return Err(channel);
        }
        pending.insert(request_id.to_string(), channel);
        Ok(())
    }

    fn take(&self, request_id: &str) -> Option<ResponseChannel> {
        match self.pending.lock() {
            Ok(mut pending) => pending.remove(request_id),
            Err(poisoned) => poisoned.into_inner().remove(request_id),
        }
    }

    async fn reply(
        &self,
        channel: ResponseChannel,
        response: ResponseMessage,
    ) -> Result<(), NodeError> {
        let message = Response::from(response).into_outgoing_message(channel);
        self.outgoing
            .send(message)
            .await
            .map_err(|_| NodeError::NetworkInit("p2p node is no longer running".to_string()))
    }

    async fn send(&self, response: ResponseMessage) -> Result<(), NodeError> {
        let Some(channel) = self.take(&response.request_id) else {
            warn!(
                "No pending peer request {} for response {}",
                response.request_id, response.id
            );
            return Ok(());
        };
        self.reply(channel, response).await
    }
}

struct Connection {
    router: ResponseRouter,
    kademlia_tx: Sender<KademliaActionWithChannel>,
    network_state: NetworkState,
    tasks: Vec<JoinHandle<()>>,
}

struct Prepared {
    node: p2p::Node,
    incoming: Receiver<IncomingMessage>,
    outgoing: Sender<OutgoingMessage>,
    kademlia_tx: Sender<KademliaActionWithChannel>,
}

/// Overlay membership, provider advertisement and inbound request routing.
pub struct P2PService {
    keypair: p2p::Keypair,
    peer_id: PeerId,
    handler: HandlerSlot,
    provider_info: Option<ProviderInfo>,
    prepared: Option<Prepared>,
    connection: Option<Connection>,
    cancellation_token: CancellationToken,
}

impl P2PService {
    pub fn new(keypair: p2p::Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self {
            keypair,
            peer_id,
            handler: Arc::new(RwLock::new(None)),
            provider_info: None,
            prepared: None,
            connection: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Builds the swarm and the initial provider advertisement without
    /// binding any listener.
    pub fn initialize(&mut self, config: &P2PConfig) -> Result<(), NodeError> {
        if self.connection.is_some() {
            return Err(NodeError::InvalidState(
                "p2p service is already connected".to_string(),
            ));
        }

        let bootnodes = config
            .bootstrap_peers
            .iter()
            .map(|peer| {
                peer.parse::<Multiaddr>().map_err(|e| {
                    NodeError::NetworkInit(format!("invalid bootstrap peer {peer}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.cancellation_token = CancellationToken::new();
        let (node, incoming, outgoing, kademlia_tx) = NodeBuilder::new()
            .with_keypair(self.keypair.clone())
            .with_port(config.port)
            .with_inference()
            .with_mdns(config.mdns_enabled)
            .with_relay(config.relay_enabled)
            .with_bootnodes(bootnodes)
            .with_cancellation_token(self.cancellation_token.clone())
            .try_build()
            .map_err(|e| NodeError::NetworkInit(format!("{e:#}")))?;

        self.provider_info = Some(ProviderInfo {
            node_id: self.peer_id.to_string(),
            node_name: config.node_name.clone(),
            addresses: Vec::new(),
            capabilities: vec![p2p::LLM_PROXY_CAPABILITY.to_string()],
            backend: config.backend.clone(),
            models: config.models.clone(),
        });
        self.prepared = Some(Prepared {
            node,
            incoming,
            outgoing,
            kademlia_tx,
        });
        info!("P2P service initialized with peer id {}", self.peer_id);
        Ok(())
    }

    /// Binds listeners, starts the swarm and publishes the provider record.
    pub async fn connect(&mut self) -> Result<(), NodeError> {
        if self.connection.is_some() {
            debug!("P2P service already connected");
            return Ok(());
        }
        let prepared = self
            .prepared
            .as_mut()
            .ok_or(NodeError::NotInitialized("P2P service"))?;
        prepared
            .node
            .listen()
            .map_err(|e| NodeError::NetworkInit(format!("{e:#}")))?;

        let Some(Prepared {
            node,
            incoming,
            outgoing,
            kademlia_tx,
        }) = self.prepared.take()
        else {
            return Err(NodeError::NotInitialized("P2P service"));
        };

        let network_state = node.network_state();
        let router = ResponseRouter::new(outgoing);

        let node_task = tokio::spawn(async move {
            if let Err(e) = node.run().await {
                error!("P2P node stopped with error: {e:#}");
            }
        });
        let message_task = tokio::spawn(run_message_loop(
            incoming,
            router.clone(),
            self.handler.clone(),
            self.cancellation_token.clone(),
        ));

        self.connection = Some(Connection {
            router,
            kademlia_tx,
            network_state: network_state.clone(),
            tasks: vec![node_task, message_task],
        });

        let deadline = tokio::time::Instant::now() + LISTEN_WAIT;
        while network_state.listen_addrs().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(LISTEN_POLL).await;
        }
        info!(
            "P2P service listening on {:?}",
            network_state.listen_addrs()
        );

        if let Some(info) = self.provider_info.clone() {
            self.register_provider(info).await?;
        }
        Ok(())
    }

    /// Stores `info` and, when connected, republishes it to the DHT.
    pub async fn register_provider(&mut self, mut info: ProviderInfo) -> Result<(), NodeError> {
        let Some(connection) = &self.connection else {
            self.provider_info = Some(info);
            return Ok(());
        };

        info.node_id = self.peer_id.to_string();
        info.addresses = connection
            .network_state
            .listen_addrs()
            .into_iter()
            .filter_map(|addr| addr.with_p2p(self.peer_id).ok())
            .map(|addr| addr.to_string())
            .collect();

        let value = serde_json::to_vec(&info)
            .map_err(|e| NodeError::NetworkInit(format!("failed to encode provider info: {e}")))?;
        let key = p2p::provider_dht_key_with_peer_id(&self.peer_id).into_bytes();

        for capability in &info.capabilities {
            let action =
                KademliaAction::StartProviding(p2p::capability_dht_key(capability).into_bytes());
            publish(&connection.kademlia_tx, action).await?;
        }
        publish(&connection.kademlia_tx, KademliaAction::PutRecord { key, value }).await?;

        debug!(
            "Published provider info for {} ({} models)",
            info.node_name,
            info.models.len()
        );
        self.provider_info = Some(info);
        Ok(())
    }

    /// Replaces the inbound request handler.
    pub fn on_request(&self, handler: Arc<dyn InboundRequestHandler>) {
        match self.handler.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    pub async fn send_response(&self, response: ResponseMessage) -> Result<(), NodeError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(NodeError::NotInitialized("P2P service"))?;
        connection.router.send(response).await
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn peer_count(&self) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |connection| connection.network_state.peer_count())
    }

    pub fn network_state(&self) -> Option<NetworkState> {
        self.connection
            .as_ref()
            .map(|connection| connection.network_state.clone())
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.connection
            .as_ref()
            .map(|connection| connection.network_state.listen_addrs())
            .unwrap_or_default()
    }

    pub fn provider_info(&self) -> Option<&ProviderInfo> {
        self.provider_info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Shuts the swarm down and waits for its tasks. Safe to call repeatedly.
    pub async fn stop(&mut self) -> Result<(), NodeError> {
        self.cancellation_token.cancel();
        self.prepared = None;
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        for task in connection.tasks {
            if let Err(e) = task.await {
                warn!("P2P task ended abnormally: {e}");
                if result.is_ok() {
                    result = Err(NodeError::NetworkInit(format!("p2p task failed: {e}")));
                }
            }
        }
        info!("P2P service stopped");
        result
    }
}

async fn publish(
    kademlia_tx: &Sender<KademliaActionWithChannel>,
    action: KademliaAction,
) -> Result<(), NodeError> {
    let label = format!("{action:?}");
    let (action, mut results) = action.into_kademlia_action_with_channel();
    kademlia_tx
        .send(action)
        .await
        .map_err(|_| NodeError::NetworkInit("p2p node is no longer running".to_string()))?;

    tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            match result {
                Ok(result) => debug!("kademlia query finished: {result:?}"),
                Err(e) => debug!("kademlia query for {label} failed: {e:#}"),
            }
        }
    });
    Ok(())
}

async fn run_message_loop(
    mut incoming: Receiver<IncomingMessage>,
    router: ResponseRouter,
    handler: HandlerSlot,
    cancellation_token: CancellationToken,
) {
    use futures::StreamExt as _;

    let mut in_flight = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                break;
            }
            Some(message) = incoming.recv() => {
                if let Some((request_id, task)) = dispatch(message, &router, &handler).await {
                    in_flight.push(async move { (request_id, task.await) });
                }
            }
            Some((request_id, res)) = in_flight.next() => {
                if let Err(e) = res {
                    error!("failed to handle peer request {request_id}: {e}");
                    release(&router, &request_id).await;
                }
            }
        }
    }
}

/// Answers a request whose handler task died before replying, freeing its id.
async fn release(router: &ResponseRouter, request_id: &str) {
    let Some(channel) = router.take(request_id) else {
        return;
    };
    let response = ResponseMessage::error(
        Uuid::new_v4().to_string(),
        request_id,
        "request handler failed",
    );
    if let Err(e) = router.reply(channel, response).await {
        warn!("failed to answer peer request {request_id}: {e}");
    }
}

async fn dispatch(
    message: IncomingMessage,
    router: &ResponseRouter,
    handler: &HandlerSlot,
) -> Option<(String, JoinHandle<()>)> {
    let IncomingMessage { peer, message } = message;
    let (request, channel) = match message {
        Libp2pIncomingMessage::Request {
            request: Request::Inference(request),
            channel,
            ..
        } => (request, channel),
        Libp2pIncomingMessage::Response { response, .. } => {
            debug!("ignoring unsolicited response from {peer}: {response:?}");
            return None;
        }
    };

    let request_id = request.id.clone();
    debug!("received peer request {request_id} from {peer}");
    if let Err(channel) = router.register(&request_id, channel) {
        warn!("Peer request {request_id} is already in flight");
        let response = ResponseMessage::error(
            Uuid::new_v4().to_string(),
            &request_id,
            NodeError::DuplicateRequest(request_id.clone()).to_string(),
        );
        if let Err(e) = router.reply(channel, response).await {
            warn!("failed to reject duplicate request {request_id}: {e}");
        }
        return None;
    }

    let current = match handler.read() {
        Ok(slot) => slot.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let Some(current) = current else {
        let response = ResponseMessage::error(
            Uuid::new_v4().to_string(),
            &request_id,
            "no request handler registered",
        );
        if let Err(e) = router.send(response).await {
            warn!("failed to answer peer request {request_id}: {e}");
        }
        return None;
    };

    let router = router.clone();
    let task_request_id = request_id.clone();
    let task = tokio::spawn(async move {
        let request_id = task_request_id;
        let mut response = current.handle_request(peer, request).await;
        if response.request_id != request_id {
            debug!(
                "handler answered {request_id} as {}, correlating by the request id",
                response.request_id
            );
            response.request_id = request_id.clone();
        }
        if let Err(e) = router.send(response).await {
            warn!("failed to answer peer request {request_id}: {e}");
        }
    });
    Some((request_id, task))
}
