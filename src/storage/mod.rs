//! Storage layer
//!
//! Persists the set of known peers across restarts.

pub mod known_peers;

pub use known_peers::{KnownPeers, StorageError, KNOWN_PEERS_FILE};
