use anyhow::Context as _;
use anyhow::Result;
use libp2p::autonat;
use libp2p::connection_limits;
use libp2p::connection_limits::ConnectionLimits;
use libp2p::identify;
use libp2p::identity;
use libp2p::kad;
use libp2p::kad::store::MemoryStore;
use libp2p::mdns;
use libp2p::ping;
use libp2p::relay;
use libp2p::request_response;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use log::{debug, info};
use std::time::Duration;

use crate::discovery::OngoingKademliaQueries;
use crate::message::IncomingMessage;
use crate::message::{Request, Response};
use crate::Protocols;
use crate::PROVIDER_STREAM_PROTOCOL;

const DEFAULT_MAX_PEER_COUNT: u32 = 100;

// inference calls can take minutes on large models
const INFERENCE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
pub(crate) struct Behaviour {
    // connection gating
    connection_limits: connection_limits::Behaviour,

    // discovery
    mdns: Toggle<mdns::tokio::Behaviour>,
    kademlia: kad::Behaviour<MemoryStore>,

    // protocols
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    request_response: request_response::cbor::Behaviour<Request, Response>,

    // nat traversal
    autonat: autonat::Behaviour,
    relay: Toggle<relay::Behaviour>,
    relay_client: Toggle<relay::client::Behaviour>,
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub(crate) enum BehaviourEvent {
    Autonat(autonat::Event),
    Identify(identify::Event),
    Kademlia(kad::Event),
    Mdns(mdns::Event),
    Ping(ping::Event),
    Relay(relay::Event),
    RelayClient(relay::client::Event),
    RequestResponse(request_response::Event<Request, Response>),
}

impl From<void::Void> for BehaviourEvent {
    fn from(_: void::Void) -> Self {
        unreachable!("void::Void cannot be converted to BehaviourEvent")
    }
}

impl From<autonat::Event> for BehaviourEvent {
    fn from(event: autonat::Event) -> Self {
        BehaviourEvent::Autonat(event)
    }
}

impl From<kad::Event> for BehaviourEvent {
    fn from(event: kad::Event) -> Self {
        BehaviourEvent::Kademlia(event)
    }
}

impl From<mdns::Event> for BehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        BehaviourEvent::Mdns(event)
    }
}

impl From<ping::Event> for BehaviourEvent {
    fn from(event: ping::Event) -> Self {
        BehaviourEvent::Ping(event)
    }
}

impl From<identify::Event> for BehaviourEvent {
    fn from(event: identify::Event) -> Self {
        BehaviourEvent::Identify(event)
    }
}

impl From<relay::Event> for BehaviourEvent {
    fn from(event: relay::Event) -> Self {
        BehaviourEvent::Relay(event)
    }
}

impl From<relay::client::Event> for BehaviourEvent {
    fn from(event: relay::client::Event) -> Self {
        BehaviourEvent::RelayClient(event)
    }
}

impl From<request_response::Event<Request, Response>> for BehaviourEvent {
    fn from(event: request_response::Event<Request, Response>) -> Self {
        BehaviourEvent::RequestResponse(event)
    }
}

impl Behaviour {
    pub(crate) fn new(
        keypair: &identity::Keypair,
        protocols: Protocols,
        agent_version: String,
        mdns_enabled: bool,
        relay_client: Option<relay::client::Behaviour>,
    ) -> Result<Self> {
        let peer_id = keypair.public().to_peer_id();

        let protocols = protocols.into_iter().map(|protocol| {
            (
                protocol.as_stream_protocol(),
                request_response::ProtocolSupport::Full,
            )
        });

        let autonat = autonat::Behaviour::new(peer_id, autonat::Config::default());
        let connection_limits = connection_limits::Behaviour::new(
            ConnectionLimits::default().with_max_established(Some(DEFAULT_MAX_PEER_COUNT)),
        );

        let mdns = if mdns_enabled {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                    .context("failed to create mDNS behaviour")?,
            )
        } else {
            None
        };

        let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        // relaying for others and reserving on others go together
        let relay = relay_client
            .is_some()
            .then(|| relay::Behaviour::new(peer_id, relay::Config::default()));

        let identify = identify::Behaviour::new(
            identify::Config::new(PROVIDER_STREAM_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(agent_version),
        );
        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(10)));

        Ok(Self {
            autonat,
            connection_limits,
            kademlia,
            mdns: Toggle::from(mdns),
            identify,
            ping,
            request_response: request_response::cbor::Behaviour::new(
                protocols,
                request_response::Config::default()
                    .with_request_timeout(INFERENCE_REQUEST_TIMEOUT),
            ),
            relay: Toggle::from(relay),
            relay_client: Toggle::from(relay_client),
        })
    }

    pub(crate) fn request_response(
        &mut self,
    ) -> &mut request_response::cbor::Behaviour<Request, Response> {
        &mut self.request_response
    }

    pub(crate) fn kademlia(&mut self) -> &mut kad::Behaviour<MemoryStore> {
        &mut self.kademlia
    }

    pub(crate) async fn handle_event(
        &mut self,
        event: BehaviourEvent,
        message_tx: &tokio::sync::mpsc::Sender<IncomingMessage>,
        ongoing_kademlia_queries: &mut OngoingKademliaQueries,
    ) {
        match event {
            BehaviourEvent::Autonat(event) => {
                debug!("autonat event: {event:?}");
            }
            BehaviourEvent::Identify(event) => {
                if let identify::Event::Received { peer_id, info, .. } = event {
                    debug!(
                        "identified peer {peer_id} running {} with {} listen addrs",
                        info.agent_version,
                        info.listen_addrs.len()
                    );
                    for addr in info.listen_addrs {
                        self.kademlia.add_address(&peer_id, addr);
                    }
                }
            }
            BehaviourEvent::Kademlia(event) => match event {
                kad::Event::OutboundQueryProgressed {
                    id,
                    result,
                    stats: _,
                    step,
                } => {
                    debug!("kademlia query {id:?} progressed with step {step:?}");

                    if let Some(query) = ongoing_kademlia_queries.get(&id) {
                        // receiver may be gone or full; results are advisory
                        let _ = query.result_tx.try_send(Ok(result));
                    }

                    if step.last {
                        ongoing_kademlia_queries.remove(&id);
                    }
                }
                kad::Event::RoutingUpdated { peer, .. } => {
                    debug!("kademlia routing table updated with peer {peer}");
                }
                _ => {}
            },
            BehaviourEvent::Mdns(event) => {
                if let mdns::Event::Discovered(peers) = event {
                    for (peer_id, addr) in peers {
                        debug!("mdns discovered peer {peer_id} at {addr}");
                        self.kademlia.add_address(&peer_id, addr);
                    }
                }
            }
            BehaviourEvent::Ping(_event) => {}
            BehaviourEvent::Relay(event) => {
                debug!("relay event: {event:?}");
            }
            BehaviourEvent::RelayClient(event) => match event {
                relay::client::Event::ReservationReqAccepted {
                    relay_peer_id,
                    renewal,
                    ..
                } => {
                    info!("relay reservation accepted by {relay_peer_id} (renewal: {renewal})");
                }
                event => debug!("relay client event: {event:?}"),
            },
            BehaviourEvent::RequestResponse(event) => match event {
                request_response::Event::Message { peer, message, .. } => {
                    debug!("received message from peer {peer:?}: {message:?}");

                    // if this errors, user dropped their incoming message channel
                    let _ = message_tx.send(IncomingMessage { peer, message }).await;
                }
                request_response::Event::ResponseSent {
                    peer, request_id, ..
                } => {
                    debug!("response sent to peer {peer:?} for request ID {request_id:?}");
                }
                request_response::Event::InboundFailure {
                    peer,
                    request_id,
                    error,
                    ..
                } => {
                    debug!(
                        "inbound failure from peer {peer:?} for request ID {request_id:?}: {error}"
                    );
                }
                request_response::Event::OutboundFailure {
                    peer,
                    request_id,
                    error,
                    ..
                } => {
                    debug!(
                        "outbound failure to peer {peer:?} for request ID {request_id:?}: {error}"
                    );
                }
            },
        }
    }
}
