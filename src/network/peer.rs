//! Peer connections
//!
//! A [`Peer`] owns one TCP connection. Its read loop ([`Peer::run`]) decodes
//! frames strictly in order and dispatches them to the `recv_*` handlers;
//! any task may write to it through the `send_*` methods, which serialize on
//! a per-connection write lock.
//!
//! Closing is cooperative: [`Peer::close`] only cancels the connection
//! token. The read loop notices, shuts the socket down and removes the peer
//! from the registry, so teardown happens exactly once.

use crate::core::{Block, Transaction};
use crate::crypto::Hash;
use crate::network::address::PeerAddress;
use crate::network::alert::{Alert, AlertError, AlertObject};
use crate::network::codec::{Frame, FrameCodec, FrameError};
use crate::network::message::{DataType, DecodeError, Inventory, Message, MessageType, Reject, RejectCode};
use crate::network::node::{Network, WeakNetwork};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// How long teardown waits for buffered frames to flush
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub type PeerId = u64;

type PeerWriter = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

/// Read half of a peer connection, consumed by [`Peer::run`]
pub type PeerReader = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),
    #[error("Peer disconnected")]
    Disconnected,
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Inbound,
    Outbound,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Inbound => write!(f, "inbound"),
            PeerRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// A connected remote node
pub struct Peer {
    id: PeerId,
    address: PeerAddress,
    role: PeerRole,
    /// Protocol version stamped on outgoing frames and expected on incoming ones
    version: u16,
    state: parking_lot::RwLock<PeerState>,
    pong_count: AtomicU64,
    writer: Mutex<PeerWriter>,
    cancel: CancellationToken,
}

impl Peer {
    /// Wrap a connected socket. The returned reader must be handed to [`Peer::run`].
    pub fn new(
        id: PeerId,
        address: PeerAddress,
        role: PeerRole,
        stream: TcpStream,
        codec: FrameCodec,
        version: u16,
        cancel: CancellationToken,
    ) -> (Arc<Self>, PeerReader) {
        let (writer, reader) = Framed::new(stream, codec).split();
        let peer = Arc::new(Self {
            id,
            address,
            role,
            version,
            state: parking_lot::RwLock::new(PeerState::Connecting),
            pong_count: AtomicU64::new(0),
            writer: Mutex::new(writer),
            cancel,
        });
        (peer, reader)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    pub fn pong_count(&self) -> u64 {
        self.pong_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the connection to close. Safe to call any number of times from any task.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Handshake, then read and dispatch frames until the connection ends
    pub async fn run(self: Arc<Self>, mut reader: PeerReader, network: WeakNetwork) {
        if let Some(strong) = network.upgrade() {
            self.handshake(&strong).await;
        }

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = reader.next() => next,
            };

            let frame = match next {
                None => {
                    log::info!("Peer {} closed the connection", self.address);
                    break;
                }
                Some(Err(FrameError::TooLarge { size, max })) => {
                    log::warn!(
                        "Peer {} sent a {} byte message (max {}), disconnecting",
                        self.address,
                        size,
                        max
                    );
                    let _ = self
                        .send_reject(RejectCode::MessageMalformed, "message too large")
                        .await;
                    break;
                }
                Some(Err(e)) => {
                    log::error!("Read error from {}: {}", self.address, e);
                    break;
                }
                Some(Ok(frame)) => frame,
            };

            let Some(strong) = network.upgrade() else {
                break;
            };
            if !self.handle_frame(&strong, frame).await {
                break;
            }
        }

        self.teardown(&network).await;
    }

    async fn handshake(self: &Arc<Self>, network: &Network) {
        self.set_state(PeerState::Handshaking);

        let config = network.config();
        tokio::spawn(Arc::clone(self).magic_ping(config.ping_timeout, config.ping_retries));

        if !network.is_stable().await {
            let _ = self.send_getpeers().await;
        }
        let _ = self.send_gethighest().await;

        self.set_state(PeerState::Active);
        log::info!("Peer {} ({}) active", self.address, self.role);
    }

    async fn teardown(&self, network: &WeakNetwork) {
        self.set_state(PeerState::Closed);
        self.cancel.cancel();

        {
            let mut writer = self.writer.lock().await;
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
                Ok(Err(e)) => log::debug!("Error shutting down {}: {}", self.address, e),
                Err(_) => log::debug!("Timed out shutting down {}", self.address),
                Ok(Ok(())) => {}
            }
        }

        if let Some(network) = network.upgrade() {
            network.registry().remove(self.id).await;
        }
        log::info!("Peer lost: {}", self.address);
    }

    /// Liveness check: ping until a pong arrives, close after `retries` silent rounds
    async fn magic_ping(self: Arc<Self>, timeout: Duration, retries: u32) {
        let initial = self.pong_count();
        for _ in 0..retries {
            if self.send_ping().await.is_err() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if self.pong_count() > initial {
                return;
            }
        }
        log::info!(
            "Peer {} did not answer {} pings, disconnecting",
            self.address,
            retries
        );
        self.close();
    }

    /// Returns false when the connection must end
    async fn handle_frame(&self, network: &Network, frame: Frame) -> bool {
        if frame.version != self.version {
            log::warn!(
                "Peer {} speaks protocol version {}, we speak {}",
                self.address,
                frame.version,
                self.version
            );
            let _ = self
                .send_reject(
                    RejectCode::BadVersion,
                    format!("expected version {}", self.version),
                )
                .await;
            network.forget_address(&self.address);
            return false;
        }

        let msg_type = match MessageType::try_from(frame.msg_type) {
            Ok(msg_type) => msg_type,
            Err(_) => {
                log::warn!(
                    "Peer {} sent unknown message type {}",
                    self.address,
                    frame.msg_type
                );
                let _ = self
                    .send_reject(
                        RejectCode::BadCtype,
                        format!("unknown message type {}", frame.msg_type),
                    )
                    .await;
                return true;
            }
        };

        match Message::decode(msg_type, &frame.body) {
            Ok(message) => {
                if let Err(e) = self.dispatch(network, message).await {
                    log::debug!(
                        "Handling {} from {} failed: {}",
                        msg_type.name(),
                        self.address,
                        e
                    );
                }
            }
            Err(e) => self.handle_decode_error(msg_type, e).await,
        }
        true
    }

    async fn handle_decode_error(&self, msg_type: MessageType, error: DecodeError) {
        let (code, reason) = match (msg_type, &error) {
            (MessageType::Peer, _) => {
                log::debug!("Ignoring bad peer address from {}: {}", self.address, error);
                return;
            }
            (MessageType::Reject, _) => {
                log::warn!("Peer {} sent a malformed reject: {}", self.address, error);
                return;
            }
            (_, DecodeError::UnknownDataType(dtype)) => (
                RejectCode::BadDtype,
                format!("{} data type {}", msg_type.name(), dtype),
            ),
            (_, DecodeError::Block(_)) => (
                RejectCode::MessageMalformed,
                "failed to parse block".to_string(),
            ),
            (_, DecodeError::Transaction(_)) => (
                RejectCode::MessageMalformed,
                "failed to parse transaction".to_string(),
            ),
            _ => (RejectCode::MessageMalformed, error.to_string()),
        };
        log::warn!(
            "Malformed {} from {}: {}",
            msg_type.name(),
            self.address,
            error
        );
        let _ = self.send_reject(code, reason).await;
    }

    // =========================================================================
    // Receive handlers
    // =========================================================================

    async fn dispatch(&self, network: &Network, message: Message) -> Result<(), PeerError> {
        log::debug!("Received {} from {}", message.type_name(), self.address);
        match message {
            Message::Reject(reject) => {
                self.recv_reject(&reject);
                Ok(())
            }
            Message::GetHighest => self.recv_gethighest(network).await,
            Message::GetChain { start, count } => self.recv_getchain(network, start, count).await,
            Message::GetTxs => self.recv_gettxs(network).await,
            Message::GetPeers => self.recv_getpeers(network).await,
            Message::Inv(inv) => self.recv_inv(network, inv).await,
            Message::GetData(inv) => self.recv_getdata(network, inv).await,
            Message::Block(block) => self.recv_block(network, block).await,
            Message::Tx(tx) => self.recv_tx(network, tx).await,
            Message::Peer(address) => {
                self.recv_peer(network, address).await;
                Ok(())
            }
            Message::Alert(alert) => {
                self.recv_alert(&alert);
                Ok(())
            }
            Message::Ping => self.send_pong().await,
            Message::Pong => {
                self.pong_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn recv_reject(&self, reject: &Reject) {
        match (reject.code, reject.code()) {
            (None, _) => log::debug!("Peer {} sent a bare reject", self.address),
            (Some(_), Some(code)) => log::warn!(
                "Peer {} rejected our message ({:?}): {}",
                self.address,
                code,
                reject.reason
            ),
            (Some(raw), None) => log::warn!(
                "Peer {} rejected our message (code {}): {}",
                self.address,
                raw,
                reject.reason
            ),
        }
    }

    async fn recv_gethighest(&self, network: &Network) -> Result<(), PeerError> {
        match network.chain().highest_hash(true) {
            Some(hash) => self.send_inv(DataType::Block, vec![hash]).await,
            None => Ok(()),
        }
    }

    /// Send up to `count` blocks walking back from `start`, most recent first
    async fn recv_getchain(
        &self,
        network: &Network,
        start: Hash,
        count: u8,
    ) -> Result<(), PeerError> {
        let chain = network.chain();
        let mut next = start;
        for _ in 0..count {
            let Some(block) = chain.load_block(&next) else {
                break;
            };
            next = block.prev_hash;
            self.send_block(&block).await?;
        }
        Ok(())
    }

    async fn recv_gettxs(&self, network: &Network) -> Result<(), PeerError> {
        let hashes = network.mempool().read().await.hashes();
        self.send_inv(DataType::Tx, hashes).await
    }

    async fn recv_getpeers(&self, network: &Network) -> Result<(), PeerError> {
        for peer in network.registry().outbound_except(self.id).await {
            self.send_peer(peer.address()).await?;
        }
        Ok(())
    }

    /// Ask for exactly the announced objects we do not have
    async fn recv_inv(&self, network: &Network, inv: Inventory) -> Result<(), PeerError> {
        let chain = network.chain();
        let wanted: Vec<Hash> = match inv.data_type {
            DataType::Block => inv
                .hashes
                .into_iter()
                .filter(|hash| !chain.block_exists(hash))
                .collect(),
            DataType::Tx => {
                let mempool = network.mempool().read().await;
                inv.hashes
                    .into_iter()
                    .filter(|hash| !mempool.contains(hash) && !chain.tx_exists(hash))
                    .collect()
            }
            DataType::Peer => return self.send_reject(RejectCode::BadDtype, "inv").await,
        };
        self.send_getdata(inv.data_type, wanted).await
    }

    async fn recv_getdata(&self, network: &Network, inv: Inventory) -> Result<(), PeerError> {
        let chain = network.chain();
        match inv.data_type {
            DataType::Block => {
                for hash in &inv.hashes {
                    if let Some(block) = chain.load_block(hash) {
                        self.send_block(&block).await?;
                    }
                }
            }
            DataType::Tx => {
                for hash in &inv.hashes {
                    let pooled = network.mempool().read().await.get(hash).cloned();
                    if let Some(tx) = pooled.or_else(|| chain.load_tx(hash)) {
                        self.send_tx(&tx).await?;
                    }
                }
            }
            DataType::Peer => return self.send_reject(RejectCode::BadDtype, "getdata").await,
        }
        Ok(())
    }

    async fn recv_block(&self, network: &Network, block: Block) -> Result<(), PeerError> {
        let hash = block.hash();
        if !block.is_pseudo_valid() {
            log::warn!("Peer {} sent invalid block {}", self.address, hash);
            return self
                .send_reject(RejectCode::BlockInvalid, hash.to_hex())
                .await;
        }

        if network.chain().append_block(block.clone()) {
            log::info!(
                "Received block {} at height {} from {}",
                hash,
                block.height,
                self.address
            );
            network.mempool().write().await.remove_included(&block);
        }
        Ok(())
    }

    async fn recv_tx(&self, network: &Network, tx: Transaction) -> Result<(), PeerError> {
        let hash = tx.hash();
        if !tx.is_pseudo_valid() {
            log::warn!("Peer {} sent invalid transaction {}", self.address, hash);
            return self.send_reject(RejectCode::TxInvalid, hash.to_hex()).await;
        }
        if network.chain().tx_exists(&hash) {
            return Ok(());
        }

        match network.mempool().write().await.insert(tx) {
            Ok(true) => log::info!("Added transaction {} from {}", hash, self.address),
            Ok(false) => log::debug!("Transaction {} already in mempool", hash),
            Err(e) => log::warn!("Dropped transaction {}: {}", hash, e),
        }
        Ok(())
    }

    async fn recv_peer(&self, network: &Network, address: PeerAddress) {
        if address.port == 0 {
            return;
        }
        if network.is_stable().await || network.is_connected_to(&address).await {
            return;
        }
        log::info!("Peer {} suggested {}", self.address, address);
        let network = network.clone();
        tokio::spawn(async move {
            network.connect(&address.host, address.port).await;
        });
    }

    fn recv_alert(&self, alert: &Alert) {
        // TODO: verify alert signatures against a configured admin public key
        let object = match alert.object() {
            Some(AlertObject::WarnUser) => "warn user",
            Some(AlertObject::ForceUpdate) => "force update",
            None => "unknown",
        };
        log::info!(
            "Alert from {} (type {}, {}): {}",
            self.address,
            alert.alert_type,
            object,
            alert.message
        );
    }

    // =========================================================================
    // Send operations
    // =========================================================================

    /// Write one message. On failure the connection is closed.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        if self.cancel.is_cancelled() {
            return Err(PeerError::Disconnected);
        }
        let frame = Frame::from_message(self.version, &message);

        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            result = writer.send(frame) => result.map_err(PeerError::from),
            _ = self.cancel.cancelled() => Err(PeerError::Disconnected),
        };
        drop(writer);

        if let Err(e) = &result {
            if !matches!(e, PeerError::Disconnected) {
                log::error!(
                    "Failed to send {} to {}: {}",
                    message.type_name(),
                    self.address,
                    e
                );
            }
            self.close();
        }
        result
    }

    pub async fn send_reject(
        &self,
        code: RejectCode,
        reason: impl Into<String>,
    ) -> Result<(), PeerError> {
        self.send(Message::Reject(Reject::new(code, reason))).await
    }

    pub async fn send_gethighest(&self) -> Result<(), PeerError> {
        self.send(Message::GetHighest).await
    }

    pub async fn send_getchain(&self, start: Hash, count: u8) -> Result<(), PeerError> {
        self.send(Message::GetChain { start, count }).await
    }

    pub async fn send_gettxs(&self) -> Result<(), PeerError> {
        self.send(Message::GetTxs).await
    }

    pub async fn send_getpeers(&self) -> Result<(), PeerError> {
        self.send(Message::GetPeers).await
    }

    /// Announce hashes, split into lists of at most 255. Nothing is sent for an empty list.
    pub async fn send_inv(&self, data_type: DataType, hashes: Vec<Hash>) -> Result<(), PeerError> {
        for inv in Inventory::split(data_type, &hashes) {
            self.send(Message::Inv(inv)).await?;
        }
        Ok(())
    }

    /// Request objects, split into lists of at most 255. Nothing is sent for an empty list.
    pub async fn send_getdata(
        &self,
        data_type: DataType,
        hashes: Vec<Hash>,
    ) -> Result<(), PeerError> {
        for inv in Inventory::split(data_type, &hashes) {
            self.send(Message::GetData(inv)).await?;
        }
        Ok(())
    }

    pub async fn send_block(&self, block: &Block) -> Result<(), PeerError> {
        self.send(Message::Block(block.clone())).await
    }

    pub async fn send_tx(&self, tx: &Transaction) -> Result<(), PeerError> {
        self.send(Message::Tx(tx.clone())).await
    }

    pub async fn send_peer(&self, address: &PeerAddress) -> Result<(), PeerError> {
        self.send(Message::Peer(address.clone())).await
    }

    /// Sign an alert with the admin key stored in `data_dir` and send it.
    /// Nothing is sent if the key cannot be loaded.
    pub async fn send_alert(
        &self,
        data_dir: &Path,
        alert_type: u8,
        object: AlertObject,
        message: &str,
    ) -> Result<(), PeerError> {
        let alert = Alert::sign_with_key_file(data_dir, alert_type, object, message)?;
        self.send(Message::Alert(alert)).await
    }

    pub async fn send_ping(&self) -> Result<(), PeerError> {
        self.send(Message::Ping).await
    }

    pub async fn send_pong(&self) -> Result<(), PeerError> {
        self.send(Message::Pong).await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AdminKey;
    use crate::network::alert::ADMIN_SECRET_FILE;
    use crate::network::message::PROTOCOL_VERSION;
    use tokio::net::TcpListener;

    /// A peer wrapping one end of a loopback connection, and a raw client on the other end
    async fn peer_pair() -> (Arc<Peer>, PeerReader, Framed<TcpStream, FrameCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (peer, reader) = Peer::new(
            1,
            PeerAddress::new("127.0.0.1", 0),
            PeerRole::Inbound,
            server,
            FrameCodec::new(),
            PROTOCOL_VERSION,
            CancellationToken::new(),
        );
        (peer, reader, Framed::new(client, FrameCodec::new()))
    }

    async fn next_message(remote: &mut Framed<TcpStream, FrameCodec>) -> Message {
        let frame = remote.next().await.unwrap().unwrap();
        assert_eq!(frame.version, PROTOCOL_VERSION);
        Message::decode(MessageType::try_from(frame.msg_type).unwrap(), &frame.body).unwrap()
    }

    #[tokio::test]
    async fn test_inventory_is_chunked() {
        let (peer, _reader, mut remote) = peer_pair().await;
        let hashes: Vec<Hash> = (0..300u32)
            .map(|i| Hash::digest(&i.to_be_bytes()))
            .collect();

        peer.send_inv(DataType::Tx, hashes.clone()).await.unwrap();
        // An empty list sends nothing, so the next frame is the ping
        peer.send_getdata(DataType::Block, vec![]).await.unwrap();
        peer.send_ping().await.unwrap();

        match next_message(&mut remote).await {
            Message::Inv(inv) => assert_eq!(inv.hashes, hashes[..255].to_vec()),
            other => panic!("expected inv, got {:?}", other),
        }
        match next_message(&mut remote).await {
            Message::Inv(inv) => assert_eq!(inv.hashes, hashes[255..].to_vec()),
            other => panic!("expected inv, got {:?}", other),
        }
        assert_eq!(next_message(&mut remote).await, Message::Ping);
    }

    #[tokio::test]
    async fn test_magic_ping_closes_silent_peer() {
        let (peer, _reader, mut remote) = peer_pair().await;
        let task = tokio::spawn(Arc::clone(&peer).magic_ping(Duration::from_millis(20), 3));

        for _ in 0..3 {
            assert_eq!(next_message(&mut remote).await, Message::Ping);
        }
        task.await.unwrap();
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_magic_ping_stops_after_pong() {
        let (peer, _reader, mut remote) = peer_pair().await;
        let task = tokio::spawn(Arc::clone(&peer).magic_ping(Duration::from_millis(50), 3));

        assert_eq!(next_message(&mut remote).await, Message::Ping);
        peer.pong_count.fetch_add(1, Ordering::SeqCst);
        task.await.unwrap();
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (peer, _reader, _remote) = peer_pair().await;
        peer.close();
        peer.close();
        assert!(matches!(
            peer.send_ping().await,
            Err(PeerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_send_alert_requires_key() {
        let (peer, _reader, mut remote) = peer_pair().await;
        let dir = tempfile::tempdir().unwrap();

        let result = peer
            .send_alert(dir.path(), 0, AlertObject::WarnUser, "hello")
            .await;
        assert!(matches!(result, Err(PeerError::Alert(_))));
        assert!(!peer.is_closed());

        let key = AdminKey::generate();
        key.save(&dir.path().join(ADMIN_SECRET_FILE)).unwrap();
        peer.send_alert(dir.path(), 0, AlertObject::WarnUser, "hello")
            .await
            .unwrap();

        match next_message(&mut remote).await {
            Message::Alert(alert) => {
                assert_eq!(alert.message, "hello");
                assert!(alert.verify(key.public_key()));
            }
            other => panic!("expected alert, got {:?}", other),
        }
    }
}
