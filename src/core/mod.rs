//! Core chain objects
//!
//! This module contains:
//! - Transactions and blocks with their binary wire formats
//! - Cheap pseudo-validity checks run before accepting gossiped objects
//! - The [`ChainStore`] boundary used by the network layer, with an
//!   in-memory implementation

pub mod block;
pub mod blockchain;
pub mod transaction;

pub use block::{Block, BlockError, BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE, MAX_BLOCK_TXS};
pub use blockchain::{BlockHead, ChainStore, MemoryChain};
pub use transaction::{Transaction, TransactionError, TxInput, TxOutput, MAX_TX_SIZE};
