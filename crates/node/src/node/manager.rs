use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use p2p::{Multiaddr, NetworkState, PeerId};
use shared::models::node::{calculate_uptime, NodeState, NodeStatus, ProviderInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::status::{StatusBoard, Subscription};
use crate::chain::BlockchainService;
use crate::config::{ConfigChanges, NodeConfig, NodeConfigUpdate};
use crate::error::NodeError;
use crate::llm::create_adapter;
use crate::p2p::{P2PConfig, P2PService, PeerRequestHandler};
use crate::proxy::{ProxyServer, RequestHandler, RequestPolicy, UsageTracker};
use crate::state::IdentityStore;

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NodeManagerOptions {
    pub status_interval: Duration,
    pub identity: IdentityStore,
}

impl Default for NodeManagerOptions {
    fn default() -> Self {
        Self {
            status_interval: DEFAULT_STATUS_INTERVAL,
            identity: IdentityStore::new(None),
        }
    }
}

struct Monitor {
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    config: Option<NodeConfig>,
    keypair: Option<p2p::Keypair>,
    p2p: Option<P2PService>,
    blockchain: Option<BlockchainService>,
    proxy: Option<ProxyServer>,
    monitor: Option<Monitor>,
    started_at: Option<DateTime<Utc>>,
}

/// Lifecycle owner of the node's subsystems.
///
/// `Stopped -> Starting -> Running -> Stopped`, with `Error` reachable from
/// `Starting` and `Running`. Leaving `Error` takes an explicit `stop()`.
pub struct NodeManager {
    inner: Mutex<Inner>,
    board: Arc<StatusBoard>,
    tracker: Arc<UsageTracker>,
    handler: Arc<RequestHandler>,
    options: NodeManagerOptions,
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new(NodeManagerOptions::default())
    }
}

impl NodeManager {
    pub fn new(options: NodeManagerOptions) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            board: StatusBoard::new(),
            tracker: Arc::new(UsageTracker::new()),
            handler: Arc::new(RequestHandler::new()),
            options,
        }
    }

    pub async fn initialize(&self, config: NodeConfig) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        if inner.config.is_some() {
            return Err(NodeError::Config(
                "node manager is already initialized, reset it first".to_string(),
            ));
        }

        config.validate()?;
        let keypair = self
            .options
            .identity
            .load_or_create()
            .map_err(|e| NodeError::Config(format!("failed to load p2p identity: {e:#}")))?;
        self.install_adapter(&config)?;

        info!(
            "Node '{}' initialized with {} backend, peer id {}",
            config.node_name,
            config.llm.backend,
            keypair.public().to_peer_id()
        );
        inner.keypair = Some(keypair);
        inner.config = Some(config);
        self.board.update(|status| *status = NodeStatus::default());
        Ok(())
    }

    /// Unbinds the configuration so `initialize` can run again. Only allowed
    /// while stopped.
    pub async fn reset(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        let state = self.board.snapshot().status;
        if state != NodeState::Stopped {
            return Err(NodeError::InvalidState(format!(
                "cannot reset a node that is {state}"
            )));
        }
        inner.config = None;
        inner.keypair = None;
        self.handler.clear_adapters();
        debug!("Node manager reset");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        let config = inner
            .config
            .clone()
            .ok_or(NodeError::NotInitialized("node manager"))?;

        match self.board.snapshot().status {
            NodeState::Running => {
                warn!("Node is already running");
                return Ok(());
            }
            NodeState::Error => {
                return Err(NodeError::InvalidState(
                    "node is in error state, stop it before starting again".to_string(),
                ));
            }
            NodeState::Starting => {
                return Err(NodeError::InvalidState("node is already starting".to_string()));
            }
            NodeState::Stopped => {}
        }

        info!("Starting node '{}'", config.node_name);
        self.board.update(|status| {
            status.status = NodeState::Starting;
            status.last_error = None;
        });

        if let Err(e) = self.bring_up(&mut inner, &config).await {
            error!("Failed to start node: {e}");
            self.board.update(|status| {
                status.status = NodeState::Error;
                status.last_error = Some(e.to_string());
            });
            return Err(e);
        }

        let started_at = Utc::now();
        inner.started_at = Some(started_at);
        let network = inner.p2p.as_ref().and_then(P2PService::network_state);
        inner.monitor = Some(self.spawn_monitor(network.clone(), started_at));

        self.board.update(|status| {
            status.status = NodeState::Running;
            status.started_at = Some(started_at);
            status.uptime_seconds = 0;
            status.peer_count = network.as_ref().map_or(0, NetworkState::peer_count);
            status.last_error = None;
        });
        info!("Node is running");
        Ok(())
    }

    // Subsystems are stored as soon as they exist so a later stop() can tear
    // them down even when a following step fails.
    async fn bring_up(&self, inner: &mut Inner, config: &NodeConfig) -> Result<(), NodeError> {
        let keypair = inner
            .keypair
            .clone()
            .ok_or(NodeError::NotInitialized("p2p identity"))?;
        let mut p2p = P2PService::new(keypair);
        p2p.initialize(&p2p_config(config))?;
        p2p.on_request(self.peer_handler(config));
        inner.p2p.insert(p2p).connect().await?;

        inner.blockchain = Some(BlockchainService::initialize(&config.blockchain)?);

        if config.proxy.enabled {
            let mut proxy = self.new_proxy(config);
            proxy.start(config.proxy.port)?;
            inner.proxy = Some(proxy);
        } else {
            info!("Proxy server disabled");
        }
        Ok(())
    }

    /// Tears down the proxy, then the p2p service. Every step runs; the first
    /// failure is returned afterwards.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        if self.board.snapshot().status == NodeState::Stopped {
            debug!("Node is already stopped");
            return Ok(());
        }

        info!("Stopping node");
        if let Some(monitor) = inner.monitor.take() {
            monitor.cancellation_token.cancel();
            if let Err(e) = monitor.task.await {
                warn!("Status monitor ended abnormally: {e}");
            }
        }

        let mut first_error = None;
        if let Some(mut proxy) = inner.proxy.take() {
            if let Err(e) = proxy.stop().await {
                error!("Failed to stop proxy server: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut p2p) = inner.p2p.take() {
            if let Err(e) = p2p.stop().await {
                error!("Failed to stop p2p service: {e}");
                first_error.get_or_insert(e);
            }
        }
        inner.blockchain = None;
        inner.started_at = None;

        self.board.update(|status| {
            status.status = NodeState::Stopped;
            status.started_at = None;
            status.uptime_seconds = 0;
            status.peer_count = 0;
        });
        info!("Node stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Merges `update` into the bound configuration.
    ///
    /// While running, a proxy change restarts only the proxy server and an LLM
    /// or name change swaps the adapter and republishes the provider record.
    /// P2P and blockchain changes apply on the next start.
    pub async fn update_config(&self, update: NodeConfigUpdate) -> Result<ConfigChanges, NodeError> {
        let mut inner = self.inner.lock().await;
        let mut next = inner
            .config
            .clone()
            .ok_or(NodeError::NotInitialized("node configuration"))?;
        let changes = next.apply(update)?;
        if changes.is_empty() {
            debug!("Configuration update changed nothing");
            return Ok(changes);
        }
        if changes.llm {
            self.install_adapter(&next)?;
        }
        inner.config = Some(next.clone());

        if self.board.snapshot().status != NodeState::Running {
            return Ok(changes);
        }

        if changes.proxy {
            if let Err(e) = self.restart_proxy(&mut inner, &next).await {
                error!("Failed to restart proxy server: {e}");
                self.board.update(|status| {
                    status.status = NodeState::Error;
                    status.last_error = Some(e.to_string());
                });
                return Err(e);
            }
            if let Some(service) = &inner.p2p {
                service.on_request(self.peer_handler(&next));
            }
        }

        if changes.affects_provider_info() {
            if let Some(service) = inner.p2p.as_mut() {
                let info = ProviderInfo {
                    node_id: service.peer_id().to_string(),
                    node_name: next.node_name.clone(),
                    addresses: Vec::new(),
                    capabilities: vec![p2p::LLM_PROXY_CAPABILITY.to_string()],
                    backend: next.llm.backend.to_string(),
                    models: next.llm.models.clone(),
                };
                if let Err(e) = service.register_provider(info).await {
                    warn!("Failed to republish provider info: {e}");
                }
            }
        }

        if changes.p2p || changes.blockchain {
            warn!("P2P and blockchain settings take effect on the next start");
        }
        Ok(changes)
    }

    async fn restart_proxy(&self, inner: &mut Inner, config: &NodeConfig) -> Result<(), NodeError> {
        if let Some(mut proxy) = inner.proxy.take() {
            proxy.stop().await?;
        }
        if config.proxy.enabled {
            let mut proxy = self.new_proxy(config);
            let port = proxy.start(config.proxy.port)?;
            inner.proxy = Some(proxy);
            info!("Proxy server restarted on port {port}");
        } else {
            info!("Proxy server disabled");
        }
        Ok(())
    }

    fn install_adapter(&self, config: &NodeConfig) -> Result<(), NodeError> {
        let adapter = create_adapter(&config.llm)?;
        self.handler
            .replace_adapters(config.llm.backend.as_str(), adapter);
        self.handler.set_policy(RequestPolicy {
            allowed_models: config.llm.models.clone(),
            max_quota: (config.llm.max_quota > 0).then_some(config.llm.max_quota),
        });
        Ok(())
    }

    fn new_proxy(&self, config: &NodeConfig) -> ProxyServer {
        ProxyServer::new(
            self.handler.clone(),
            self.tracker.clone(),
            &config.proxy.host,
            config.proxy.request_timeout(),
        )
    }

    fn peer_handler(&self, config: &NodeConfig) -> Arc<PeerRequestHandler> {
        Arc::new(PeerRequestHandler::new(
            self.handler.clone(),
            self.tracker.clone(),
            config.proxy.request_timeout(),
        ))
    }

    fn spawn_monitor(&self, network: Option<NetworkState>, started_at: DateTime<Utc>) -> Monitor {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let board = self.board.clone();
        let tracker = self.tracker.clone();
        let period = self.options.status_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if board.snapshot().status != NodeState::Running {
                            continue;
                        }
                        let totals = tracker.lifetime_usage();
                        board.update(|status| {
                            status.uptime_seconds = calculate_uptime(started_at);
                            status.peer_count = network.as_ref().map_or(0, NetworkState::peer_count);
                            status.requests_processed = totals.total_requests;
                            status.total_tokens = totals.total_tokens;
                        });
                    }
                }
            }
        });

        Monitor {
            cancellation_token,
            task,
        }
    }

    pub fn on_status_update(
        &self,
        observer: impl Fn(&NodeStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.board.subscribe(observer)
    }

    pub fn get_status(&self) -> NodeStatus {
        let mut status = self.board.snapshot();
        if let (NodeState::Running, Some(started_at)) = (status.status, status.started_at) {
            status.uptime_seconds = calculate_uptime(started_at);
        }
        status
    }

    pub async fn config(&self) -> Option<NodeConfig> {
        self.inner.lock().await.config.clone()
    }

    pub async fn proxy_port(&self) -> Option<u16> {
        self.inner.lock().await.proxy.as_ref().and_then(ProxyServer::port)
    }

    pub async fn peer_id(&self) -> Option<PeerId> {
        self.inner
            .lock()
            .await
            .keypair
            .as_ref()
            .map(|keypair| keypair.public().to_peer_id())
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner
            .lock()
            .await
            .p2p
            .as_ref()
            .map(P2PService::listen_addrs)
            .unwrap_or_default()
    }

    pub async fn provider_info(&self) -> Option<ProviderInfo> {
        self.inner
            .lock()
            .await
            .p2p
            .as_ref()
            .and_then(|p2p| p2p.provider_info().cloned())
    }

    pub async fn wallet_address(&self) -> Option<alloy::primitives::Address> {
        self.inner
            .lock()
            .await
            .blockchain
            .as_ref()
            .and_then(BlockchainService::wallet_address)
    }

    pub fn usage_tracker(&self) -> Arc<UsageTracker> {
        self.tracker.clone()
    }

    pub fn request_handler(&self) -> Arc<RequestHandler> {
        self.handler.clone()
    }
}

fn p2p_config(config: &NodeConfig) -> P2PConfig {
    P2PConfig {
        bootstrap_peers: config.p2p.bootstrap_peers.clone(),
        relay_enabled: config.p2p.relay_enabled,
        mdns_enabled: config.p2p.mdns_enabled,
        port: config.p2p.port,
        node_name: config.node_name.clone(),
        backend: config.llm.backend.to_string(),
        models: config.llm.models.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, LlmConfigUpdate, ProxyConfigUpdate};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(proxy_port: u16) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node_name = "Test Provider".to_string();
        config.p2p.mdns_enabled = false;
        config.p2p.relay_enabled = false;
        config.p2p.port = 0;
        config.proxy.host = "127.0.0.1".to_string();
        config.proxy.port = proxy_port;
        config
    }

    fn manager() -> NodeManager {
        NodeManager::new(NodeManagerOptions {
            status_interval: Duration::from_millis(50),
            identity: IdentityStore::ephemeral(),
        })
    }

    #[tokio::test]
    async fn start_and_stop_cycle() {
        let manager = manager();
        let port = free_port();
        manager.initialize(test_config(port)).await.unwrap();
        assert_eq!(manager.get_status().status, NodeState::Stopped);

        let states = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = states.clone();
        let subscription =
            manager.on_status_update(move |status| sink.lock().unwrap().push(status.status));

        manager.start().await.unwrap();
        let status = manager.get_status();
        assert_eq!(status.status, NodeState::Running);
        assert!(status.started_at.is_some());
        assert_eq!(manager.proxy_port().await, Some(port));
        assert!(manager.provider_info().await.is_some());

        manager.start().await.unwrap();
        assert_eq!(manager.get_status().status, NodeState::Running);

        manager.stop().await.unwrap();
        let status = manager.get_status();
        assert_eq!(status.status, NodeState::Stopped);
        assert!(status.started_at.is_none());
        assert_eq!(manager.proxy_port().await, None);
        subscription.unsubscribe();

        let states = states.lock().unwrap().clone();
        assert_eq!(states.first(), Some(&NodeState::Starting));
        assert!(states.contains(&NodeState::Running));
        assert_eq!(states.last(), Some(&NodeState::Stopped));
    }

    #[tokio::test]
    async fn stop_finishes_teardown_when_proxy_fails() {
        let manager = manager();
        manager.initialize(test_config(free_port())).await.unwrap();
        manager.start().await.unwrap();
        assert!(!manager.listen_addrs().await.is_empty());

        manager
            .inner
            .lock()
            .await
            .proxy
            .as_ref()
            .unwrap()
            .abort_task();

        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, NodeError::Io(_)), "unexpected error: {err:?}");

        let status = manager.get_status();
        assert_eq!(status.status, NodeState::Stopped);
        assert!(status.started_at.is_none());
        assert!(manager.listen_addrs().await.is_empty());
        assert_eq!(manager.proxy_port().await, None);
        assert!(manager.inner.lock().await.p2p.is_none());
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_silent_noop() {
        let manager = manager();
        manager.initialize(test_config(free_port())).await.unwrap();

        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = notifications.clone();
        manager.on_status_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(notifications.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_status().status, NodeState::Stopped);
    }

    #[tokio::test]
    async fn failed_start_enters_error_until_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let manager = manager();
        manager.initialize(test_config(port)).await.unwrap();

        assert_eq!(manager.start().await, Err(NodeError::AddressInUse(port)));
        let status = manager.get_status();
        assert_eq!(status.status, NodeState::Error);
        assert_eq!(
            status.last_error,
            Some(NodeError::AddressInUse(port).to_string())
        );
        assert!(matches!(
            manager.start().await,
            Err(NodeError::InvalidState(_))
        ));

        // p2p came up before the proxy failed and is torn down here
        manager.stop().await.unwrap();
        assert_eq!(manager.get_status().status, NodeState::Stopped);
        assert!(manager.listen_addrs().await.is_empty());

        drop(occupied);
        manager.start().await.unwrap();
        assert_eq!(manager.get_status().status, NodeState::Running);
        assert_eq!(manager.get_status().last_error, None);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn proxy_port_change_restarts_only_the_proxy() {
        let manager = manager();
        let first = free_port();
        manager.initialize(test_config(first)).await.unwrap();
        manager.start().await.unwrap();

        let peer_id = manager.peer_id().await;
        let addrs = manager.listen_addrs().await;
        assert!(!addrs.is_empty());

        let second = free_port();
        let changes = manager
            .update_config(NodeConfigUpdate {
                proxy: Some(ProxyConfigUpdate::port(second)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(changes.proxy);
        assert!(!changes.p2p);
        assert_eq!(manager.proxy_port().await, Some(second));
        assert_eq!(manager.get_status().status, NodeState::Running);
        assert_eq!(manager.peer_id().await, peer_id);
        assert_eq!(manager.listen_addrs().await, addrs);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn llm_change_swaps_adapter_and_republishes() {
        let manager = manager();
        manager.initialize(test_config(free_port())).await.unwrap();
        manager.start().await.unwrap();

        manager
            .update_config(NodeConfigUpdate {
                llm: Some(LlmConfigUpdate {
                    backend: Some(Backend::OpenAi),
                    models: Some(vec!["gpt-4o-mini".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            manager.request_handler().backends(),
            vec!["openai".to_string()]
        );
        let info = manager.provider_info().await.unwrap();
        assert_eq!(info.backend, "openai");
        assert_eq!(info.models, vec!["gpt-4o-mini".to_string()]);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn initialization_rules() {
        let manager = manager();
        assert_eq!(
            manager.update_config(NodeConfigUpdate::default()).await,
            Err(NodeError::NotInitialized("node configuration"))
        );
        assert_eq!(
            manager.start().await,
            Err(NodeError::NotInitialized("node manager"))
        );

        manager.initialize(test_config(free_port())).await.unwrap();
        assert!(matches!(
            manager.initialize(test_config(free_port())).await,
            Err(NodeError::Config(_))
        ));

        manager.reset().await.unwrap();
        manager.initialize(test_config(free_port())).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_update_leaves_config_untouched() {
        let manager = manager();
        let port = free_port();
        manager.initialize(test_config(port)).await.unwrap();

        let result = manager
            .update_config(NodeConfigUpdate {
                proxy: Some(ProxyConfigUpdate::port(80)),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(NodeError::Config(_))));
        assert_eq!(manager.config().await.unwrap().proxy.port, port);
    }

    #[tokio::test]
    async fn periodic_refresh_folds_usage_totals() {
        let manager = manager();
        manager.initialize(test_config(free_port())).await.unwrap();
        manager.start().await.unwrap();

        let tracker = manager.usage_tracker();
        tracker.start_tracking("r1");
        tracker.stop_tracking(
            "r1",
            Some(crate::proxy::UsageData {
                total_tokens: 42,
                ..Default::default()
            }),
        );

        let mut status = manager.get_status();
        for _ in 0..40 {
            if status.requests_processed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            status = manager.get_status();
        }
        assert_eq!(status.requests_processed, 1);
        assert_eq!(status.total_tokens, 42);
        assert_eq!(status.earnings, "0");

        manager.stop().await.unwrap();
    }

    async fn wait_for_requests(manager: &NodeManager, expected: u64) -> NodeStatus {
        let mut status = manager.get_status();
        for _ in 0..40 {
            if status.requests_processed == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            status = manager.get_status();
        }
        status
    }

    #[tokio::test]
    async fn status_counters_survive_history_eviction_and_clear() {
        let manager = manager();
        manager.initialize(test_config(free_port())).await.unwrap();
        manager.start().await.unwrap();

        let tracker = manager.usage_tracker();
        for i in 0..1500 {
            let id = format!("r{i}");
            tracker.start_tracking(&id);
            tracker.stop_tracking(
                &id,
                Some(crate::proxy::UsageData {
                    total_tokens: 2,
                    ..Default::default()
                }),
            );
        }

        let status = wait_for_requests(&manager, 1500).await;
        assert_eq!(status.requests_processed, 1500);
        assert_eq!(status.total_tokens, 3000);

        tracker.clear_history();
        tracker.start_tracking("late");
        tracker.stop_tracking("late", None);

        let status = wait_for_requests(&manager, 1501).await;
        assert_eq!(status.requests_processed, 1501);
        assert_eq!(status.total_tokens, 3000);

        manager.stop().await.unwrap();
    }
}
