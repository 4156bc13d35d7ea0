//! Chain storage
//!
//! The network layer talks to the chain only through [`ChainStore`]. The
//! in-memory [`MemoryChain`] keeps every block it is given, including blocks
//! whose ancestry has not arrived yet, and tracks which of them are linked
//! all the way back to genesis.

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::crypto::Hash;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Summary of a chain tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHead {
    pub hash: Hash,
    pub height: u64,
    /// Whether the ancestry of this block reaches genesis
    pub chained: bool,
    /// Parent hash of the lowest block known in this head's ancestry.
    /// For an unchained head this is the first missing block.
    pub lowest_parent_hash: Hash,
}

/// Block and transaction storage consumed by the network layer
pub trait ChainStore: Send + Sync {
    /// Highest known head; with `chained_only` orphaned heads are ignored
    fn highest_head(&self, chained_only: bool) -> Option<BlockHead>;

    fn highest_hash(&self, chained_only: bool) -> Option<Hash> {
        self.highest_head(chained_only).map(|head| head.hash)
    }

    fn load_block(&self, hash: &Hash) -> Option<Block>;

    /// Store a block, chaining it if its parent is chained.
    /// Returns false if the block was already known.
    fn append_block(&self, block: Block) -> bool;

    fn block_exists(&self, hash: &Hash) -> bool {
        self.load_block(hash).is_some()
    }

    fn tx_exists(&self, hash: &Hash) -> bool {
        self.load_tx(hash).is_some()
    }

    /// Load a transaction included in a stored block
    fn load_tx(&self, hash: &Hash) -> Option<Transaction>;
}

#[derive(Default)]
struct ChainState {
    blocks: HashMap<Hash, Block>,
    chained: HashSet<Hash>,
    /// Parent hash -> blocks waiting on it
    children: HashMap<Hash, Vec<Hash>>,
    transactions: HashMap<Hash, Transaction>,
    /// Arrival order, used to break height ties
    arrival: HashMap<Hash, u64>,
    next_arrival: u64,
}

impl ChainState {
    /// Mark `hash` and every stored descendant as chained
    fn chain_from(&mut self, hash: Hash) {
        let mut pending = vec![hash];
        while let Some(current) = pending.pop() {
            if !self.chained.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                pending.extend(children.iter().copied());
            }
        }
    }

    fn lowest_parent_hash(&self, head: &Block) -> Hash {
        let mut current = head;
        while let Some(parent) = self.blocks.get(&current.prev_hash) {
            current = parent;
        }
        current.prev_hash
    }
}

/// In-memory chain store
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        let chain = Self {
            state: RwLock::new(ChainState::default()),
        };
        let genesis = Block::genesis();
        let hash = genesis.hash();
        {
            let mut state = chain.state.write();
            state.blocks.insert(hash, genesis);
            state.arrival.insert(hash, 0);
            state.next_arrival = 1;
            state.chained.insert(hash);
        }
        chain
    }

    pub fn genesis_hash(&self) -> Hash {
        Block::genesis().hash()
    }

    /// Number of stored blocks, genesis included
    pub fn len(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().blocks.is_empty()
    }

    pub fn is_chained(&self, hash: &Hash) -> bool {
        self.state.read().chained.contains(hash)
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainStore for MemoryChain {
    fn highest_head(&self, chained_only: bool) -> Option<BlockHead> {
        let state = self.state.read();
        let (hash, block) = state
            .blocks
            .iter()
            .filter(|(hash, _)| !chained_only || state.chained.contains(*hash))
            .max_by(|(a_hash, a), (b_hash, b)| {
                a.height.cmp(&b.height).then_with(|| {
                    // Earlier arrival wins a tie
                    let a_seq = state.arrival.get(*a_hash).copied().unwrap_or(u64::MAX);
                    let b_seq = state.arrival.get(*b_hash).copied().unwrap_or(u64::MAX);
                    b_seq.cmp(&a_seq)
                })
            })?;

        Some(BlockHead {
            hash: *hash,
            height: block.height,
            chained: state.chained.contains(hash),
            lowest_parent_hash: state.lowest_parent_hash(block),
        })
    }

    fn load_block(&self, hash: &Hash) -> Option<Block> {
        self.state.read().blocks.get(hash).cloned()
    }

    fn append_block(&self, block: Block) -> bool {
        let hash = block.hash();
        let mut state = self.state.write();
        if state.blocks.contains_key(&hash) {
            return false;
        }

        for tx in &block.transactions {
            state.transactions.insert(tx.hash(), tx.clone());
        }
        let seq = state.next_arrival;
        state.next_arrival += 1;
        state.arrival.insert(hash, seq);
        state.children.entry(block.prev_hash).or_default().push(hash);

        let parent_chained = state.chained.contains(&block.prev_hash);
        state.blocks.insert(hash, block);

        if parent_chained {
            state.chain_from(hash);
        }
        log::debug!("Stored block {} (chained: {})", hash, state.chained.contains(&hash));
        true
    }

    fn block_exists(&self, hash: &Hash) -> bool {
        self.state.read().blocks.contains_key(hash)
    }

    fn tx_exists(&self, hash: &Hash) -> bool {
        self.state.read().transactions.contains_key(hash)
    }

    fn load_tx(&self, hash: &Hash) -> Option<Transaction> {
        self.state.read().transactions.get(hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TxOutput;

    fn child_of(parent: &Block, nonce: u64) -> Block {
        let mut block = Block::new(parent.height + 1, parent.hash(), vec![]);
        block.nonce = nonce;
        block
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = MemoryChain::new();
        assert_eq!(chain.len(), 1);

        let head = chain.highest_head(true).unwrap();
        assert_eq!(head.hash, chain.genesis_hash());
        assert!(head.chained);
        assert_eq!(head.height, 0);
    }

    #[test]
    fn test_append_chained_block() {
        let chain = MemoryChain::new();
        let b1 = child_of(&Block::genesis(), 1);

        assert!(chain.append_block(b1.clone()));
        assert!(!chain.append_block(b1.clone()));

        assert_eq!(chain.highest_hash(true), Some(b1.hash()));
        assert!(chain.block_exists(&b1.hash()));
    }

    #[test]
    fn test_orphan_head_and_late_parent() {
        let chain = MemoryChain::new();
        let b1 = child_of(&Block::genesis(), 1);
        let b2 = child_of(&b1, 2);
        let b3 = child_of(&b2, 3);

        chain.append_block(b3.clone());
        chain.append_block(b2.clone());

        // Orphans are visible only when unchained heads are included
        assert_eq!(chain.highest_hash(true), Some(chain.genesis_hash()));
        let head = chain.highest_head(false).unwrap();
        assert_eq!(head.hash, b3.hash());
        assert!(!head.chained);
        assert_eq!(head.lowest_parent_hash, b1.hash());

        chain.append_block(b1);
        let head = chain.highest_head(false).unwrap();
        assert!(head.chained);
        assert!(chain.is_chained(&b2.hash()));
        assert_eq!(chain.highest_hash(true), Some(b3.hash()));
    }

    #[test]
    fn test_transactions_indexed() {
        let chain = MemoryChain::new();
        let tx = Transaction::new(
            vec![],
            vec![TxOutput {
                amount: 5,
                recipient: Hash([4u8; 32]),
            }],
        );
        let block = Block::new(1, chain.genesis_hash(), vec![tx.clone()]);
        chain.append_block(block);

        assert!(chain.tx_exists(&tx.hash()));
        assert_eq!(chain.load_tx(&tx.hash()), Some(tx));
    }
}
