//! freecoin: peer-to-peer networking for a small cryptocurrency node
//!
//! This crate provides:
//! - A binary wire protocol with 7 byte frame headers
//! - Per-connection peers with liveness checks and in-order message handling
//! - A network manager that accepts and dials peers, gossips inventories and
//!   runs chain and peer custodians
//! - A hash-keyed transaction mempool
//! - Known-peers persistence
//! - Signed administrative alerts (secp256k1)
//!
//! # Example
//!
//! ```no_run
//! use freecoin::core::MemoryChain;
//! use freecoin::network::{Network, NetworkConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let network = Network::new(NetworkConfig::default(), Arc::new(MemoryChain::new()));
//! network.serve().await?;
//! network.connect("seed.example.org", 64720).await;
//!
//! tokio::signal::ctrl_c().await?;
//! network.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{Block, ChainStore, MemoryChain, Transaction};
pub use crypto::{AdminKey, Hash};
pub use network::{Message, Network, NetworkConfig, Peer, PeerAddress};
pub use storage::KnownPeers;
