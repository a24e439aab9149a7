use anyhow::Context;
use anyhow::Result;
use libp2p::multiaddr::Protocol as AddrProtocol;
use libp2p::noise;
use libp2p::swarm::SwarmEvent;
use libp2p::tcp;
use libp2p::yamux;
use libp2p::Swarm;
use libp2p::SwarmBuilder;
use libp2p::{identity, Transport};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod behaviour;
mod discovery;
mod message;
mod protocol;

use behaviour::Behaviour;
use discovery::{handle_kademlia_action, OngoingKademliaQueries};

pub use discovery::*;
pub use message::*;
pub use protocol::*;

pub type Libp2pIncomingMessage = libp2p::request_response::Message<Request, Response>;
pub type ResponseChannel = libp2p::request_response::ResponseChannel<Response>;
pub type PeerId = libp2p::PeerId;
pub type Multiaddr = libp2p::Multiaddr;
pub type Keypair = libp2p::identity::Keypair;
pub type DecodingError = libp2p::identity::DecodingError;
pub type KademliaQueryResult = libp2p::kad::QueryResult;

pub const PROVIDER_STREAM_PROTOCOL: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/provider-node/1.0.0");
pub const DEFAULT_AGENT_VERSION: &str = concat!("provider-node/", env!("CARGO_PKG_VERSION"));

/// Live view of the swarm that outlives the borrow of [`Node`] once it is running.
#[derive(Debug, Clone, Default)]
pub struct NetworkState {
    connected_peers: Arc<AtomicUsize>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

impl NetworkState {
    pub fn peer_count(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }

    /// Addresses the transport has confirmed it is listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        match self.listen_addrs.read() {
            Ok(addrs) => addrs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_peer_count(&self, count: usize) {
        self.connected_peers.store(count, Ordering::Relaxed);
    }

    fn update_listen_addrs(&self, update: impl FnOnce(&mut Vec<Multiaddr>)) {
        let mut addrs = match self.listen_addrs.write() {
            Ok(addrs) => addrs,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut addrs);
    }

    fn clear(&self) {
        self.set_peer_count(0);
        self.update_listen_addrs(Vec::clear);
    }
}

pub struct Node {
    peer_id: PeerId,
    listen_addrs: Vec<Multiaddr>,
    swarm: Swarm<Behaviour>,
    bootnodes: Vec<Multiaddr>,
    relay_enabled: bool,
    relay_addrs: Vec<Multiaddr>,
    cancellation_token: CancellationToken,
    network_state: NetworkState,
    listening: bool,

    // channel for sending incoming messages to the consumer of this library
    incoming_message_tx: tokio::sync::mpsc::Sender<IncomingMessage>,

    // channel for receiving outgoing messages from the consumer of this library
    outgoing_message_rx: tokio::sync::mpsc::Receiver<OutgoingMessage>,

    // channel for receiving kademlia actions from the consumer of this library
    kademlia_action_rx: tokio::sync::mpsc::Receiver<KademliaActionWithChannel>,
}

impl Node {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }

    pub fn network_state(&self) -> NetworkState {
        self.network_state.clone()
    }

    /// Circuit addresses a relay reservation was requested on by [`Node::listen`].
    pub fn relay_addrs(&self) -> &[Multiaddr] {
        &self.relay_addrs
    }

    /// Returns the multiaddresses that this node is listening on, with the peer ID included.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs
            .iter()
            .filter_map(|addr| addr.clone().with_p2p(self.peer_id).ok())
            .collect()
    }

    /// Binds the configured listen addresses and dials the bootnodes. With
    /// relaying enabled every bootnode carrying a peer id is also asked for a
    /// reservation, so the node stays reachable from behind a NAT.
    ///
    /// Bind failures surface here rather than inside [`Node::run`], so callers
    /// can fail their startup before the event loop is spawned.
    pub fn listen(&mut self) -> Result<()> {
        if self.listening {
            return Ok(());
        }

        for addr in &self.listen_addrs {
            self.swarm
                .listen_on(addr.clone())
                .with_context(|| format!("swarm failed to listen on {addr}"))?;
        }

        for bootnode in &self.bootnodes {
            if let Some(AddrProtocol::P2p(peer_id)) = bootnode.iter().last() {
                self.swarm
                    .behaviour_mut()
                    .kademlia()
                    .add_address(&peer_id, bootnode.clone());
            }
            if let Err(e) = self.swarm.dial(bootnode.clone()) {
                warn!("failed to dial bootnode {bootnode}: {e}");
            }
        }

        if self.relay_enabled {
            for bootnode in &self.bootnodes {
                if !matches!(bootnode.iter().last(), Some(AddrProtocol::P2p(_))) {
                    debug!("bootnode {bootnode} has no peer id, not using it as a relay");
                    continue;
                }
                let circuit = bootnode.clone().with(AddrProtocol::P2pCircuit);
                match self.swarm.listen_on(circuit.clone()) {
                    Ok(_) => {
                        info!("requesting relay reservation on {circuit}");
                        self.relay_addrs.push(circuit);
                    }
                    Err(e) => warn!("failed to listen through relay {bootnode}: {e}"),
                }
            }
        }

        if !self.bootnodes.is_empty() {
            if let Err(e) = self.swarm.behaviour_mut().kademlia().bootstrap() {
                debug!("kademlia bootstrap deferred: {e:?}");
            }
        }

        self.listening = true;
        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        use libp2p::futures::StreamExt as _;

        self.listen()?;

        let Node {
            peer_id: _,
            listen_addrs: _,
            mut swarm,
            bootnodes: _,
            relay_enabled: _,
            relay_addrs: _,
            cancellation_token,
            network_state,
            listening: _,
            incoming_message_tx,
            mut outgoing_message_rx,
            mut kademlia_action_rx,
        } = self;

        let mut ongoing_kademlia_queries = OngoingKademliaQueries::new();

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    debug!("cancellation token triggered, shutting down node");
                    break;
                }
                Some(message) = outgoing_message_rx.recv() => {
                    match message {
                        OutgoingMessage::Request((peer, request)) => {
                            swarm.behaviour_mut().request_response().send_request(&peer, request);
                        }
                        OutgoingMessage::Response((channel, response)) => {
                            if let Err(e) = swarm.behaviour_mut().request_response().send_response(channel, response) {
                                warn!("failed to send response: {e:?}");
                            }
                        }
                    }
                }
                Some(action) = kademlia_action_rx.recv() => {
                    if let Err(e) = handle_kademlia_action(swarm.behaviour_mut().kademlia(), action, &mut ongoing_kademlia_queries) {
                        warn!("failed to handle kademlia action: {e:?}");
                    }
                }
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr {
                            listener_id: _,
                            address,
                        } => {
                            info!("new listen address: {address}");
                            network_state.update_listen_addrs(|addrs| addrs.push(address));
                        }
                        SwarmEvent::ExpiredListenAddr { address, .. } => {
                            debug!("listen address expired: {address}");
                            network_state.update_listen_addrs(|addrs| addrs.retain(|a| a != &address));
                        }
                        SwarmEvent::ExternalAddrConfirmed { address } => {
                            info!("external address confirmed: {address}");
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            debug!("connection established with peer {peer_id}");
                            if endpoint.is_dialer() {
                                swarm
                                    .behaviour_mut()
                                    .kademlia()
                                    .add_address(&peer_id, endpoint.get_remote_address().clone());
                            }
                            network_state.set_peer_count(swarm.connected_peers().count());
                        }
                        SwarmEvent::ConnectionClosed {
                            peer_id,
                            cause,
                            ..
                        } => {
                            debug!("connection closed with peer {peer_id}: {cause:?}");
                            network_state.set_peer_count(swarm.connected_peers().count());
                        }
                        SwarmEvent::Behaviour(event) => {
                            swarm
                                .behaviour_mut()
                                .handle_event(event, &incoming_message_tx, &mut ongoing_kademlia_queries)
                                .await;
                        }
                        _ => continue,
                    }
                },
            }
        }

        network_state.clear();
        Ok(())
    }
}

pub struct NodeBuilder {
    port: Option<u16>,
    listen_addrs: Vec<Multiaddr>,
    keypair: Option<identity::Keypair>,
    agent_version: Option<String>,
    protocols: Protocols,
    bootnodes: Vec<Multiaddr>,
    external_addrs: Vec<Multiaddr>,
    mdns_enabled: bool,
    relay_enabled: bool,
    cancellation_token: Option<CancellationToken>,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            port: None,
            listen_addrs: Vec::new(),
            keypair: None,
            agent_version: None,
            protocols: Protocols::new(),
            bootnodes: Vec::new(),
            external_addrs: Vec::new(),
            mdns_enabled: false,
            relay_enabled: false,
            cancellation_token: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_listen_addr(mut self, addr: Multiaddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    pub fn with_keypair(mut self, keypair: identity::Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_agent_version(mut self, agent_version: String) -> Self {
        self.agent_version = Some(agent_version);
        self
    }

    pub fn with_inference(mut self) -> Self {
        self.protocols = self.protocols.with_inference();
        self
    }

    pub fn with_mdns(mut self, enabled: bool) -> Self {
        self.mdns_enabled = enabled;
        self
    }

    pub fn with_relay(mut self, enabled: bool) -> Self {
        self.relay_enabled = enabled;
        self
    }

    pub fn with_bootnode(mut self, bootnode: Multiaddr) -> Self {
        self.bootnodes.push(bootnode);
        self
    }

    pub fn with_bootnodes<I, T>(mut self, bootnodes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Multiaddr>,
    {
        for bootnode in bootnodes {
            self.bootnodes.push(bootnode.into());
        }
        self
    }

    /// Advertises `addr` as publicly reachable, e.g. when serving as a relay.
    pub fn with_external_addr(mut self, addr: Multiaddr) -> Self {
        self.external_addrs.push(addr);
        self
    }

    pub fn with_cancellation_token(mut self, cancellation_token: CancellationToken) -> Self {
        self.cancellation_token = Some(cancellation_token);
        self
    }

    #[allow(clippy::type_complexity)]
    pub fn try_build(
        self,
    ) -> Result<(
        Node,
        tokio::sync::mpsc::Receiver<IncomingMessage>,
        tokio::sync::mpsc::Sender<OutgoingMessage>,
        tokio::sync::mpsc::Sender<KademliaActionWithChannel>,
    )> {
        let Self {
            port,
            mut listen_addrs,
            keypair,
            agent_version,
            protocols,
            bootnodes,
            external_addrs,
            mdns_enabled,
            relay_enabled,
            cancellation_token,
        } = self;

        if protocols.is_empty() {
            anyhow::bail!("at least one protocol must be enabled");
        }

        let keypair = keypair.unwrap_or_else(identity::Keypair::generate_ed25519);
        let peer_id = keypair.public().to_peer_id();

        let transport = create_transport(&keypair)?;
        let agent_version = agent_version.unwrap_or(DEFAULT_AGENT_VERSION.to_string());

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_other_transport(|_| transport)?
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(
                |keypair, relay_client| -> Result<Behaviour, Box<dyn std::error::Error + Send + Sync>> {
                    Ok(Behaviour::new(
                        keypair,
                        protocols,
                        agent_version,
                        mdns_enabled,
                        relay_enabled.then_some(relay_client),
                    )
                    .context("failed to create behaviour")?)
                },
            )?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(Duration::from_secs(u64::MAX)) // don't disconnect from idle peers
            })
            .build();

        for addr in external_addrs {
            swarm.add_external_address(addr);
        }

        if listen_addrs.is_empty() {
            let port = port.unwrap_or(0);
            let listen_addr = format!("/ip4/0.0.0.0/tcp/{port}")
                .parse()
                .context("failed to build default listen multiaddr")?;
            listen_addrs.push(listen_addr);
        }

        let (incoming_message_tx, incoming_message_rx) = tokio::sync::mpsc::channel(100);
        let (outgoing_message_tx, outgoing_message_rx) = tokio::sync::mpsc::channel(100);
        let (kademlia_action_tx, kademlia_action_rx) = tokio::sync::mpsc::channel(100);

        Ok((
            Node {
                peer_id,
                swarm,
                listen_addrs,
                bootnodes,
                relay_enabled,
                relay_addrs: Vec::new(),
                cancellation_token: cancellation_token.unwrap_or_default(),
                network_state: NetworkState::default(),
                listening: false,
                incoming_message_tx,
                outgoing_message_rx,
                kademlia_action_rx,
            },
            incoming_message_rx,
            outgoing_message_tx,
            kademlia_action_tx,
        ))
    }
}

fn create_transport(
    keypair: &identity::Keypair,
) -> Result<libp2p::core::transport::Boxed<(PeerId, libp2p::core::muxing::StreamMuxerBox)>> {
    let transport = tcp::tokio::Transport::new(tcp::Config::default())
        .upgrade(libp2p::core::upgrade::Version::V1)
        .authenticate(noise::Config::new(keypair)?)
        .multiplex(yamux::Config::default())
        .timeout(Duration::from_secs(20))
        .boxed();

    Ok(transport)
}
