//! P2P networking
//!
//! Gossips blocks, transactions, peer addresses and admin alerts between
//! freecoin nodes over framed TCP connections.
//!
//! # Features
//! - Length-prefixed binary framing with a version and message type header
//! - Inventory based block and transaction relay
//! - Chain catch-up for orphaned blocks
//! - Peer discovery through known-peers persistence and peer gossip
//! - Liveness checks ("magic ping")
//! - Signed administrative alerts

pub mod address;
pub mod alert;
pub mod codec;
pub mod custodian;
pub mod mempool;
pub mod message;
pub mod node;
pub mod peer;
pub mod registry;
pub mod server;

pub use address::{AddressError, PeerAddress, DEFAULT_PORT};
pub use alert::{Alert, AlertError, AlertObject, ADMIN_SECRET_FILE, MAX_ALERT_MESSAGE};
pub use codec::{Frame, FrameCodec, FrameError, HEADER_SIZE};
pub use mempool::{Mempool, MempoolError};
pub use message::{
    DataType, DecodeError, Inventory, Message, MessageType, Reject, RejectCode, MAX_INV_ENTRIES,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
pub use node::{Network, NetworkConfig, NetworkError, NetworkStatus, WeakNetwork};
pub use peer::{Peer, PeerError, PeerId, PeerRole, PeerState};
pub use registry::PeerRegistry;
pub use server::{connect_to_peer, Server};
