//! CLI commands for the node
//!
//! Implements the command handlers behind the `freecoin` binary.

use crate::core::MemoryChain;
use crate::crypto::AdminKey;
use crate::network::{AlertObject, Network, NetworkConfig, PeerAddress, ADMIN_SECRET_FILE};
use crate::storage::KnownPeers;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How long `alert` waits for the frame to leave before disconnecting
const ALERT_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Run a node until Ctrl-C
pub async fn cmd_node_start(config: NetworkConfig, peers: &[PeerAddress]) -> CliResult<()> {
    println!("🌐 Starting freecoin node on {}:{}...", config.bind_addr, config.port);

    let network = Network::new(config, Arc::new(MemoryChain::new()));
    network.serve().await?;

    for peer in peers {
        network.connect(&peer.host, peer.port).await;
    }

    let status = network.status().await;
    println!(
        "✅ Node running: {} peers, chain height {}",
        status.peers,
        status.height.unwrap_or(0)
    );

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down node...");
    network.shutdown().await;
    Ok(())
}

/// List known peers
pub fn cmd_peers_list(data_dir: &Path) -> CliResult<()> {
    let known = KnownPeers::in_dir(data_dir)?;
    let peers = known.list()?;

    println!("📒 Known peers ({})", peers.len());
    for peer in peers {
        println!("   └─ {}", peer);
    }
    Ok(())
}

/// Add a known peer
pub fn cmd_peers_add(data_dir: &Path, peer: &PeerAddress) -> CliResult<()> {
    let known = KnownPeers::in_dir(data_dir)?;
    if known.add(peer)? {
        println!("✅ Added {}", peer);
    } else {
        println!("ℹ️  {} is already known", peer);
    }
    Ok(())
}

/// Remove a known peer
pub fn cmd_peers_remove(data_dir: &Path, peer: &PeerAddress) -> CliResult<()> {
    let known = KnownPeers::in_dir(data_dir)?;
    if known.remove(peer)? {
        println!("🗑️  Removed {}", peer);
    } else {
        println!("ℹ️  {} was not known", peer);
    }
    Ok(())
}

/// Generate the admin signing key
pub fn cmd_keygen(data_dir: &Path, force: bool) -> CliResult<()> {
    let path = data_dir.join(ADMIN_SECRET_FILE);
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to replace it)", path.display()).into());
    }

    std::fs::create_dir_all(data_dir)?;
    let key = AdminKey::generate();
    key.save(&path)?;

    println!("🔑 Admin key written to {}", path.display());
    println!("   Public key: {}", hex::encode(key.public_key().serialize()));
    Ok(())
}

/// Sign an alert and send it to one node
pub async fn cmd_alert(
    config: NetworkConfig,
    peer: &PeerAddress,
    alert_type: u8,
    object: AlertObject,
    message: &str,
) -> CliResult<()> {
    let data_dir = config.data_dir.clone();
    let network = Network::new(config, Arc::new(MemoryChain::new()));

    let Some(connection) = network.connect(&peer.host, peer.port).await else {
        return Err(format!("could not connect to {}", peer).into());
    };
    connection
        .send_alert(&data_dir, alert_type, object, message)
        .await?;
    println!("📣 Alert sent to {}", peer);

    tokio::time::sleep(ALERT_FLUSH_DELAY).await;
    network.shutdown().await;
    Ok(())
}
