//! Live peer set
//!
//! The registry is the only place that knows which connections are open.
//! Every task that adds, removes or enumerates peers goes through it.

use crate::network::address::PeerAddress;
use crate::network::peer::{Peer, PeerId, PeerRole};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of connected peers
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new peer
    pub async fn add(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.write().await;
        log::debug!("Registered peer {} ({})", peer.address(), peer.role());
        peers.insert(peer.id(), peer);
    }

    /// Remove a peer; `None` if it was already gone
    pub async fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        peers.remove(&id)
    }

    pub async fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.get(&id).cloned()
    }

    /// Snapshot of every connected peer
    pub async fn all(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    /// Snapshot of outbound peers other than `except`
    pub async fn outbound_except(&self, except: PeerId) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.id() != except && p.role() == PeerRole::Outbound)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        let peers = self.peers.read().await;
        peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains_address(&self, address: &PeerAddress) -> bool {
        let peers = self.peers.read().await;
        peers.values().any(|p| p.address() == address)
    }

    /// Remove and return every peer
    pub async fn drain(&self) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        peers.drain().map(|(_, peer)| peer).collect()
    }
}
