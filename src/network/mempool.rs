//! Transaction pool (mempool) for pending transactions
//!
//! Holds transactions heard from peers that are not yet part of a stored
//! block. Entries are keyed by content hash, so the same transaction relayed
//! by several peers is stored once.

use crate::core::{Block, Transaction};
use crate::crypto::Hash;
use std::collections::HashMap;
use thiserror::Error;

/// Default maximum mempool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 10_000;

/// Mempool errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Mempool full ({0} transactions)")]
    MempoolFull(usize),
}

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    /// When the transaction was added (Unix timestamp)
    pub added_time: i64,
}

/// Memory pool for pending transactions
#[derive(Debug)]
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    /// Hashes in order of arrival
    by_time: Vec<Hash>,
    max_size: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_time: Vec::new(),
            max_size,
        }
    }

    /// Insert a transaction keyed by its hash.
    /// Returns `Ok(false)` if a transaction with the same hash is already held.
    pub fn insert(&mut self, tx: Transaction) -> Result<bool, MempoolError> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return Ok(false);
        }
        if self.entries.len() >= self.max_size {
            return Err(MempoolError::MempoolFull(self.max_size));
        }
        self.entries.insert(
            hash,
            MempoolEntry {
                tx,
                added_time: chrono::Utc::now().timestamp(),
            },
        );
        self.by_time.push(hash);
        Ok(true)
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let entry = self.entries.remove(hash)?;
        self.by_time.retain(|h| h != hash);
        Some(entry.tx)
    }

    /// Drop every transaction included in `block`; returns how many were removed
    pub fn remove_included(&mut self, block: &Block) -> usize {
        block
            .transactions
            .iter()
            .filter(|tx| self.remove(&tx.hash()).is_some())
            .count()
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.entries.get(hash).map(|entry| &entry.tx)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Hashes of every held transaction, oldest first
    pub fn hashes(&self) -> Vec<Hash> {
        self.by_time.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxOutput;

    fn tx(amount: u64) -> Transaction {
        Transaction {
            timestamp: 1_700_000_000,
            inputs: vec![],
            outputs: vec![TxOutput {
                amount,
                recipient: Hash([1u8; 32]),
            }],
        }
    }

    #[test]
    fn test_insert_dedupes_by_hash() {
        let mut pool = Mempool::new();
        assert_eq!(pool.insert(tx(10)), Ok(true));
        // A separately built but identical transaction
        assert_eq!(pool.insert(tx(10)), Ok(false));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&tx(10).hash()));
    }

    #[test]
    fn test_hashes_in_arrival_order() {
        let mut pool = Mempool::new();
        pool.insert(tx(3)).unwrap();
        pool.insert(tx(1)).unwrap();
        pool.insert(tx(2)).unwrap();
        assert_eq!(pool.hashes(), vec![tx(3).hash(), tx(1).hash(), tx(2).hash()]);
    }

    #[test]
    fn test_full_pool() {
        let mut pool = Mempool::with_capacity(1);
        pool.insert(tx(1)).unwrap();
        assert_eq!(pool.insert(tx(2)), Err(MempoolError::MempoolFull(1)));
        // Duplicates are still reported as such
        assert_eq!(pool.insert(tx(1)), Ok(false));
    }

    #[test]
    fn test_remove_included() {
        let mut pool = Mempool::new();
        pool.insert(tx(1)).unwrap();
        pool.insert(tx(2)).unwrap();

        let block = Block::new(1, Hash::ZERO, vec![tx(1), tx(5)]);
        assert_eq!(pool.remove_included(&block), 1);
        assert_eq!(pool.hashes(), vec![tx(2).hash()]);
    }
}
