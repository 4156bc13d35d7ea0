//! Network manager
//!
//! [`Network`] owns the listener, the peer registry, the mempool and the
//! known-peers store, and runs the custodians. It is a cheap clonable
//! handle; background tasks only keep a [`WeakNetwork`], so dropping the
//! last handle shuts everything down.

use crate::core::{Block, ChainStore, Transaction};
use crate::network::address::{PeerAddress, DEFAULT_PORT};
use crate::network::alert::{Alert, AlertError, AlertObject};
use crate::network::codec::FrameCodec;
use crate::network::custodian;
use crate::network::mempool::Mempool;
use crate::network::message::{
    DataType, Inventory, Message, MAX_INV_ENTRIES, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use crate::network::peer::{Peer, PeerRole};
use crate::network::registry::PeerRegistry;
use crate::network::server::{connect_to_peer, Server};
use crate::storage::{KnownPeers, KNOWN_PEERS_FILE};
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on
    pub port: u16,
    /// Interface to listen on
    pub bind_addr: String,
    /// Holds the known-peers file and the admin key
    pub data_dir: PathBuf,
    pub protocol_version: u16,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    /// Wait between liveness pings
    pub ping_timeout: Duration,
    /// Unanswered pings before a peer is dropped
    pub ping_retries: u32,
    pub chain_custodian_interval: Duration,
    pub peer_custodian_interval: Duration,
    /// Peer count at which the network counts as stable
    pub stable_peer_count: usize,
    /// Below this peer count the peer custodian asks for more peers
    pub wanted_peer_count: usize,
    /// Blocks requested per getchain
    pub getchain_batch: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: "0.0.0.0".to_string(),
            data_dir: PathBuf::from(".freecoin"),
            protocol_version: PROTOCOL_VERSION,
            max_message_size: MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(30),
            ping_retries: 5,
            chain_custodian_interval: Duration::from_secs(5),
            peer_custodian_interval: Duration::from_secs(120),
            stable_peer_count: 4,
            wanted_peer_count: 8,
            getchain_batch: MAX_INV_ENTRIES as u8,
        }
    }
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),
}

/// Network status information
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub local_addr: Option<SocketAddr>,
    pub height: Option<u64>,
    pub peers: usize,
    pub pending_tx: usize,
}

struct ServeState {
    token: CancellationToken,
    /// None while the listener is still binding
    local_addr: Option<SocketAddr>,
}

struct Inner {
    config: NetworkConfig,
    registry: PeerRegistry,
    mempool: RwLock<Mempool>,
    chain: Arc<dyn ChainStore>,
    known_peers: KnownPeers,
    next_peer_id: AtomicU64,
    serving: parking_lot::Mutex<Option<ServeState>>,
    /// Parent of every task and connection token
    root: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Handle to the P2P network
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

/// Non-owning handle held by background tasks
#[derive(Clone)]
pub struct WeakNetwork(Weak<Inner>);

impl WeakNetwork {
    pub fn upgrade(&self) -> Option<Network> {
        self.0.upgrade().map(|inner| Network { inner })
    }
}

impl Network {
    /// Create the network. Nothing is bound until [`Network::serve`].
    ///
    /// An unusable known-peers file is logged and the node runs without
    /// remembered peers.
    pub fn new(config: NetworkConfig, chain: Arc<dyn ChainStore>) -> Self {
        let path = config.data_dir.join(KNOWN_PEERS_FILE);
        let known_peers = KnownPeers::open(path.clone()).unwrap_or_else(|e| {
            log::error!("Known peers unavailable, continuing without them: {}", e);
            KnownPeers::at(path)
        });
        Self {
            inner: Arc::new(Inner {
                config,
                registry: PeerRegistry::new(),
                mempool: RwLock::new(Mempool::new()),
                chain,
                known_peers,
                next_peer_id: AtomicU64::new(1),
                serving: parking_lot::Mutex::new(None),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakNetwork {
        WeakNetwork(Arc::downgrade(&self.inner))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind, accept connections, dial known peers if we have none and start the custodians.
    /// Calling it again while serving is a logged no-op.
    pub async fn serve(&self) -> Result<(), NetworkError> {
        let token = self.inner.root.child_token();
        {
            let mut serving = self.inner.serving.lock();
            if serving.is_some() {
                log::error!("Network is already serving");
                return Ok(());
            }
            *serving = Some(ServeState {
                token: token.clone(),
                local_addr: None,
            });
        }

        let config = &self.inner.config;
        let server = match Server::bind(&config.bind_addr, config.port).await {
            Ok(server) => server,
            Err(source) => {
                self.release_serving(&token);
                return Err(NetworkError::Bind {
                    addr: format!("{}:{}", config.bind_addr, config.port),
                    source,
                });
            }
        };

        {
            let mut serving = self.inner.serving.lock();
            match serving.as_mut() {
                Some(state) if !token.is_cancelled() => {
                    state.local_addr = Some(server.local_addr());
                }
                // Shut down while binding
                _ => return Ok(()),
            }
        }

        tokio::spawn(accept_loop(server, self.downgrade(), token.clone()));

        if self.inner.registry.is_empty().await {
            self.connect_known_peers().await;
        }

        tokio::spawn(custodian::chain_custodian(self.downgrade(), token.clone()));
        tokio::spawn(custodian::peer_custodian(self.downgrade(), token));
        Ok(())
    }

    /// Free the serving slot reserved with `token`. Shutdown cancels the
    /// token when it takes the slot, so a cancelled token owns nothing.
    fn release_serving(&self, token: &CancellationToken) {
        let mut serving = self.inner.serving.lock();
        if !token.is_cancelled() {
            *serving = None;
        }
    }

    /// Stop accepting, stop the custodians and close every peer. Idempotent.
    pub async fn shutdown(&self) {
        let state = {
            let mut serving = self.inner.serving.lock();
            let state = serving.take();
            if let Some(state) = &state {
                state.token.cancel();
            }
            state
        };
        if let Some(state) = state {
            match state.local_addr {
                Some(addr) => log::info!("Network on {} shutting down", addr),
                None => log::info!("Network shutting down"),
            }
        }

        for peer in self.inner.registry.drain().await {
            peer.close();
        }
    }

    pub fn is_serving(&self) -> bool {
        self.inner.serving.lock().is_some()
    }

    /// Address the listener is bound to, while serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.serving.lock().as_ref().and_then(|s| s.local_addr)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Dial a peer. Failed addresses are dropped from the known-peers store,
    /// successful ones recorded.
    ///
    /// Boxed: the peer read loops it spawns may dial through here again.
    pub fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Option<Arc<Peer>>> {
        async move {
            let address = PeerAddress::new(host, port);
            log::info!("Connecting to peer: {}", address);

            match connect_to_peer(host, port, self.inner.config.connect_timeout).await {
                Ok(stream) => {
                    if let Err(e) = self.inner.known_peers.add(&address) {
                        log::error!("Failed to record known peer {}: {}", address, e);
                    }
                    Some(self.spawn_peer(stream, address, PeerRole::Outbound).await)
                }
                Err(e) => {
                    log::error!("Failed to connect to {}: {}", address, e);
                    self.forget_address(&address);
                    None
                }
            }
        }
        .boxed()
    }

    async fn connect_known_peers(&self) {
        let known = match self.inner.known_peers.list() {
            Ok(known) => known,
            Err(e) => {
                log::error!("Failed to read known peers: {}", e);
                return;
            }
        };
        log::info!("Dialing {} known peers", known.len());

        let dials = known
            .iter()
            .map(|address| self.connect(&address.host, address.port));
        futures::future::join_all(dials).await;
    }

    /// Register a connected socket and start its read loop
    async fn spawn_peer(&self, stream: TcpStream, address: PeerAddress, role: PeerRole) -> Arc<Peer> {
        let config = &self.inner.config;
        let id = self.inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (peer, reader) = Peer::new(
            id,
            address,
            role,
            stream,
            FrameCodec::with_max_size(config.max_message_size),
            config.protocol_version,
            self.inner.root.child_token(),
        );

        // Registered before the read loop so the peer is visible to every handler
        self.inner.registry.add(Arc::clone(&peer)).await;
        tokio::spawn(Arc::clone(&peer).run(reader, self.downgrade()));
        peer
    }

    /// Drop an address from the known-peers store, logging failures
    pub fn forget_address(&self, address: &PeerAddress) {
        match self.inner.known_peers.remove(address) {
            Ok(true) => log::info!("Forgot known peer {}", address),
            Ok(false) => {}
            Err(e) => log::error!("Failed to remove known peer {}: {}", address, e),
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn chain(&self) -> &Arc<dyn ChainStore> {
        &self.inner.chain
    }

    pub fn mempool(&self) -> &RwLock<Mempool> {
        &self.inner.mempool
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn known_peers(&self) -> &KnownPeers {
        &self.inner.known_peers
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.registry.all().await
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Whether we have enough peers to stop looking for more
    pub async fn is_stable(&self) -> bool {
        self.peer_count().await >= self.inner.config.stable_peer_count
    }

    pub async fn is_connected_to(&self, address: &PeerAddress) -> bool {
        self.inner.registry.contains_address(address).await
    }

    pub async fn status(&self) -> NetworkStatus {
        NetworkStatus {
            local_addr: self.local_addr(),
            height: self.inner.chain.highest_head(true).map(|head| head.height),
            peers: self.peer_count().await,
            pending_tx: self.inner.mempool.read().await.len(),
        }
    }

    // =========================================================================
    // Broadcasting
    // =========================================================================

    /// Store a locally produced block and announce it to every peer
    pub async fn broadcast_block(&self, block: Block) {
        let hash = block.hash();
        self.inner.chain.append_block(block);
        self.broadcast(Message::Inv(Inventory::new(
            DataType::Block,
            vec![hash],
        )))
        .await;
    }

    /// Add a locally produced transaction to the mempool and announce it to every peer
    pub async fn broadcast_transaction(&self, tx: Transaction) {
        let hash = tx.hash();
        if let Err(e) = self.inner.mempool.write().await.insert(tx) {
            log::warn!("Not broadcasting transaction {}: {}", hash, e);
            return;
        }
        self.broadcast(Message::Inv(Inventory::new(
            DataType::Tx,
            vec![hash],
        )))
        .await;
    }

    /// Sign an alert with the admin key in the data directory and send it to every peer.
    /// Returns the number of peers it reached.
    pub async fn broadcast_alert(
        &self,
        alert_type: u8,
        object: AlertObject,
        message: &str,
    ) -> Result<usize, NetworkError> {
        let alert = Alert::sign_with_key_file(&self.inner.config.data_dir, alert_type, object, message)?;
        Ok(self.broadcast(Message::Alert(alert)).await)
    }

    /// Send a message to all peers, returning how many accepted it
    async fn broadcast(&self, message: Message) -> usize {
        let mut sent = 0;
        for peer in self.peers().await {
            if peer.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

async fn accept_loop(server: Server, network: WeakNetwork, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = server.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                let Some(network) = network.upgrade() else {
                    break;
                };
                log::info!("Incoming connection from {}", remote);
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
                }
                // Inbound peers are known by IP only until they announce a port
                let address = PeerAddress::new(remote.ip().to_string(), 0);
                network.spawn_peer(stream, address, PeerRole::Inbound).await;
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    log::info!("Stopped accepting connections on {}", server.local_addr());
}
