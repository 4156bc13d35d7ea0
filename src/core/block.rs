//! Block format
//!
//! A block is a small header (height, parent hash, timestamp, nonce) followed
//! by its transactions, each prefixed by its encoded length.

use crate::core::transaction::{read_hash, Transaction, TransactionError};
use crate::crypto::{Hash, HASH_SIZE};
use bytes::{Buf, BufMut};
use thiserror::Error;

// =============================================================================
// Block Constants
// =============================================================================

/// Maximum encoded block size in bytes, kept below the frame limit
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum number of transactions per block
pub const MAX_BLOCK_TXS: usize = 10_000;

/// Encoded header size: height + prev_hash + timestamp + nonce
pub const BLOCK_HEADER_SIZE: usize = 8 + HASH_SIZE + 8 + 8;

/// How far into the future a block timestamp may lie (2 hours)
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

// =============================================================================
// Block Errors
// =============================================================================

/// Block decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block truncated: need {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Transaction {index} malformed: {source}")]
    BadTransaction {
        index: usize,
        #[source]
        source: TransactionError,
    },
    #[error("Trailing bytes after block: {0}")]
    TrailingBytes(usize),
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Distance from genesis
    pub height: u64,
    /// Hash of the parent block
    pub prev_hash: Hash,
    /// Creation time (unix seconds)
    pub timestamp: u64,
    pub nonce: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(height: u64, prev_hash: Hash, transactions: Vec<Transaction>) -> Self {
        Self {
            height,
            prev_hash,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            nonce: 0,
            transactions,
        }
    }

    /// The fixed genesis block every node starts from
    pub fn genesis() -> Self {
        Self {
            height: 0,
            prev_hash: Hash::ZERO,
            timestamp: 1_438_000_000,
            nonce: 0,
            transactions: Vec::new(),
        }
    }

    /// Hash of the header fields followed by every transaction hash
    pub fn hash(&self) -> Hash {
        let mut data = Vec::with_capacity(BLOCK_HEADER_SIZE + self.transactions.len() * HASH_SIZE);
        self.write_header(&mut data);
        for tx in &self.transactions {
            data.put_slice(tx.hash().as_bytes());
        }
        Hash::digest(&data)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_hash == Hash::ZERO
    }

    /// Cheap structural check performed before handing a block to the chain
    pub fn is_pseudo_valid(&self) -> bool {
        // Genesis is built in, never gossiped
        if self.height == 0 {
            return false;
        }
        if self.transactions.len() > MAX_BLOCK_TXS {
            return false;
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if self.timestamp > now + MAX_FUTURE_BLOCK_TIME {
            return false;
        }
        if !self.transactions.iter().all(Transaction::is_pseudo_valid) {
            return false;
        }
        self.encoded_len() <= MAX_BLOCK_SIZE
    }

    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_SIZE
            + 2
            + self
                .transactions
                .iter()
                .map(|tx| 4 + tx.encoded_len())
                .sum::<usize>()
    }

    fn write_header(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.height);
        buf.put_slice(self.prev_hash.as_bytes());
        buf.put_u64(self.timestamp);
        buf.put_u64(self.nonce);
    }

    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_header(&mut buf);
        buf.put_u16(self.transactions.len() as u16);
        for tx in &self.transactions {
            buf.put_u32(tx.encoded_len() as u32);
            tx.write_to(&mut buf);
        }
        buf
    }

    /// Deserialize from the wire format; the whole slice must be consumed
    pub fn from_bytes(data: &[u8]) -> Result<Self, BlockError> {
        let mut buf = data;
        need(&buf, BLOCK_HEADER_SIZE + 2)?;
        let height = buf.get_u64();
        let prev_hash = read_hash(&mut buf);
        let timestamp = buf.get_u64();
        let nonce = buf.get_u64();
        let tx_count = buf.get_u16() as usize;

        let mut transactions = Vec::with_capacity(tx_count.min(MAX_BLOCK_TXS));
        for index in 0..tx_count {
            need(&buf, 4)?;
            let len = buf.get_u32() as usize;
            need(&buf, len)?;
            let (tx_bytes, rest) = buf.split_at(len);
            let tx = Transaction::from_bytes(tx_bytes)
                .map_err(|source| BlockError::BadTransaction { index, source })?;
            transactions.push(tx);
            buf = rest;
        }

        if buf.has_remaining() {
            return Err(BlockError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            height,
            prev_hash,
            timestamp,
            nonce,
            transactions,
        })
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), BlockError> {
    if buf.remaining() < len {
        return Err(BlockError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{TxInput, TxOutput};

    fn sample_tx(amount: u64) -> Transaction {
        Transaction {
            timestamp: 1_700_000_000,
            inputs: vec![TxInput {
                prev_tx: Hash([9u8; 32]),
                index: 1,
            }],
            outputs: vec![TxOutput {
                amount,
                recipient: Hash([3u8; 32]),
            }],
        }
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.hash(), Block::genesis().hash());
        assert!(!genesis.is_pseudo_valid());
    }

    #[test]
    fn test_bytes_roundtrip_with_transactions() {
        let block = Block::new(
            1,
            Block::genesis().hash(),
            vec![sample_tx(10), sample_tx(20)],
        );
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), block.encoded_len());
        assert_eq!(Block::from_bytes(&bytes).unwrap(), block);
    }

    #[test]
    fn test_hash_covers_transactions() {
        let a = Block::new(1, Hash::ZERO, vec![sample_tx(10)]);
        let mut b = a.clone();
        b.transactions[0].outputs[0].amount = 11;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_malformed_blocks() {
        let bytes = Block::new(1, Hash::ZERO, vec![sample_tx(10)]).to_bytes();

        assert!(matches!(
            Block::from_bytes(&bytes[..10]),
            Err(BlockError::Truncated { .. })
        ));
        assert!(matches!(
            Block::from_bytes(&bytes[..bytes.len() - 3]),
            Err(BlockError::Truncated { .. })
        ));

        let mut trailing = bytes.clone();
        trailing.extend_from_slice(&[0, 0]);
        assert_eq!(Block::from_bytes(&trailing), Err(BlockError::TrailingBytes(2)));
    }

    #[test]
    fn test_pseudo_validity() {
        let block = Block::new(1, Hash::ZERO, vec![sample_tx(10)]);
        assert!(block.is_pseudo_valid());

        let mut future = block.clone();
        future.timestamp += MAX_FUTURE_BLOCK_TIME + 3600;
        assert!(!future.is_pseudo_valid());

        let bad_tx = Block::new(1, Hash::ZERO, vec![sample_tx(0)]);
        assert!(!bad_tx.is_pseudo_valid());
    }
}
