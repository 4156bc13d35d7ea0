//! Periodic maintenance tasks
//!
//! The chain custodian chases missing ancestors of orphaned blocks; the peer
//! custodian polls peers for new chain heads and tops up the peer set. Both
//! run once immediately, then on their interval, until the serve token is
//! cancelled.

use crate::network::node::{Network, WeakNetwork};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub async fn chain_custodian(network: WeakNetwork, token: CancellationToken) {
    let Some(period) = network.upgrade().map(|n| n.config().chain_custodian_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(network) = network.upgrade() else {
            break;
        };
        chain_custodian_pass(&network).await;
    }
    log::debug!("Chain custodian stopped");
}

pub async fn peer_custodian(network: WeakNetwork, token: CancellationToken) {
    let Some(period) = network.upgrade().map(|n| n.config().peer_custodian_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(network) = network.upgrade() else {
            break;
        };
        peer_custodian_pass(&network).await;
    }
    log::debug!("Peer custodian stopped");
}

/// If the highest known block is orphaned, ask every peer for the chain
/// leading up to it. Returns the number of peers asked.
pub async fn chain_custodian_pass(network: &Network) -> usize {
    let Some(head) = network.chain().highest_head(false) else {
        return 0;
    };
    if head.chained {
        return 0;
    }

    log::info!(
        "Block {} at height {} is orphaned, requesting ancestors of {}",
        head.hash,
        head.height,
        head.lowest_parent_hash
    );
    let batch = network.config().getchain_batch;
    let mut asked = 0;
    for peer in network.peers().await {
        if peer.send_getchain(head.lowest_parent_hash, batch).await.is_ok() {
            asked += 1;
        }
    }
    asked
}

/// Ask every peer for its highest block, and for more peers while under the wanted count
pub async fn peer_custodian_pass(network: &Network) {
    let peers = network.peers().await;
    if peers.is_empty() {
        log::warn!("No peers connected");
        return;
    }

    let want_more = peers.len() < network.config().wanted_peer_count;
    for peer in &peers {
        if peer.send_gethighest().await.is_err() {
            continue;
        }
        if want_more {
            let _ = peer.send_getpeers().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, ChainStore, MemoryChain};
    use crate::crypto::Hash;
    use crate::network::codec::FrameCodec;
    use crate::network::message::{Message, MessageType};
    use crate::network::node::NetworkConfig;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    async fn serve(dir: &std::path::Path, config: NetworkConfig, chain: Arc<MemoryChain>) -> Network {
        let config = NetworkConfig {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            data_dir: dir.to_path_buf(),
            ..config
        };
        let network = Network::new(config, chain);
        network.serve().await.unwrap();
        network
    }

    async fn connect(network: &Network) -> Framed<TcpStream, FrameCodec> {
        let stream = TcpStream::connect(network.local_addr().unwrap()).await.unwrap();
        let client = Framed::new(stream, FrameCodec::new());
        for _ in 0..250 {
            if network.peer_count().await == 1 {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer never registered");
    }

    async fn next_non_ping(client: &mut Framed<TcpStream, FrameCodec>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = client.next().await.unwrap().unwrap();
                let message =
                    Message::decode(MessageType::try_from(frame.msg_type).unwrap(), &frame.body)
                        .unwrap();
                if message != Message::Ping {
                    return message;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_chain_custodian_requests_orphan_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let chain = Arc::new(MemoryChain::new());
        let network = serve(dir.path(), NetworkConfig::default(), Arc::clone(&chain)).await;
        let mut client = connect(&network).await;

        // Nothing to chase while the highest block is chained
        assert_eq!(chain_custodian_pass(&network).await, 0);

        let missing = Hash([7u8; 32]);
        chain.append_block(Block::new(5, missing, vec![]));
        assert_eq!(chain_custodian_pass(&network).await, 1);

        loop {
            match next_non_ping(&mut client).await {
                Message::GetChain { start, count } => {
                    assert_eq!(start, missing);
                    assert_eq!(count, 255);
                    break;
                }
                Message::GetPeers | Message::GetHighest => {}
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_custodian_asks_for_peers_when_short() {
        let dir = tempfile::tempdir().unwrap();
        // Stable from the start, so the handshake never sends getpeers
        let config = NetworkConfig {
            stable_peer_count: 0,
            wanted_peer_count: 2,
            ..Default::default()
        };
        let network = serve(dir.path(), config, Arc::new(MemoryChain::new())).await;
        let mut client = connect(&network).await;
        assert_eq!(next_non_ping(&mut client).await, Message::GetHighest);

        peer_custodian_pass(&network).await;
        assert_eq!(next_non_ping(&mut client).await, Message::GetHighest);
        assert_eq!(next_non_ping(&mut client).await, Message::GetPeers);
    }

    #[tokio::test]
    async fn test_peer_custodian_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let network = serve(dir.path(), NetworkConfig::default(), Arc::new(MemoryChain::new())).await;
        peer_custodian_pass(&network).await;
        assert_eq!(chain_custodian_pass(&network).await, 0);
    }

    #[tokio::test]
    async fn test_custodians_stop_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig {
            data_dir: dir.path().to_path_buf(),
            chain_custodian_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let network = Network::new(config, Arc::new(MemoryChain::new()));
        let token = CancellationToken::new();

        let chain = tokio::spawn(chain_custodian(network.downgrade(), token.clone()));
        let peers = tokio::spawn(peer_custodian(network.downgrade(), token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!chain.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            chain.await.unwrap();
            peers.await.unwrap();
        })
        .await
        .unwrap();
    }
}
