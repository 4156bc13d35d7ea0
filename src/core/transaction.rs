//! Transaction format
//!
//! Transactions travel as a compact big-endian binary encoding. Only the
//! cheap structural checks the network layer needs live here; spending
//! rules belong to the chain collaborator.

use crate::crypto::{Hash, HASH_SIZE};
use bytes::{Buf, BufMut};
use std::collections::HashSet;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded transaction size in bytes
pub const MAX_TX_SIZE: usize = 100_000;

/// Encoded size of one input
const INPUT_SIZE: usize = HASH_SIZE + 4;

/// Encoded size of one output
const OUTPUT_SIZE: usize = 8 + HASH_SIZE;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction truncated: need {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Trailing bytes after transaction: {0}")]
    TrailingBytes(usize),
}

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxInput {
    pub prev_tx: Hash,
    pub index: u32,
}

/// Amount paid to a recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u64,
    pub recipient: Hash,
}

/// A transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub timestamp: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            inputs,
            outputs,
        }
    }

    /// Content hash identifying this transaction
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.to_bytes())
    }

    /// Total amount across all outputs, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Cheap structural check performed before a transaction enters the mempool
    pub fn is_pseudo_valid(&self) -> bool {
        if self.outputs.is_empty() || self.outputs.iter().any(|o| o.amount == 0) {
            return false;
        }
        if self.total_output().is_none() {
            return false;
        }
        let mut seen = HashSet::new();
        if !self.inputs.iter().all(|input| seen.insert(input)) {
            return false;
        }
        self.encoded_len() <= MAX_TX_SIZE
    }

    pub fn encoded_len(&self) -> usize {
        8 + 2 + self.inputs.len() * INPUT_SIZE + 2 + self.outputs.len() * OUTPUT_SIZE
    }

    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.timestamp);
        buf.put_u16(self.inputs.len() as u16);
        for input in &self.inputs {
            buf.put_slice(input.prev_tx.as_bytes());
            buf.put_u32(input.index);
        }
        buf.put_u16(self.outputs.len() as u16);
        for output in &self.outputs {
            buf.put_u64(output.amount);
            buf.put_slice(output.recipient.as_bytes());
        }
    }

    /// Deserialize from the wire format; the whole slice must be consumed
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransactionError> {
        let mut buf = data;
        let tx = Self::read_from(&mut buf)?;
        if buf.has_remaining() {
            return Err(TransactionError::TrailingBytes(buf.remaining()));
        }
        Ok(tx)
    }

    pub(crate) fn read_from(buf: &mut &[u8]) -> Result<Self, TransactionError> {
        need(buf, 8 + 2)?;
        let timestamp = buf.get_u64();
        let input_count = buf.get_u16() as usize;

        need(buf, input_count * INPUT_SIZE + 2)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let prev_tx = read_hash(buf);
            let index = buf.get_u32();
            inputs.push(TxInput { prev_tx, index });
        }

        let output_count = buf.get_u16() as usize;
        need(buf, output_count * OUTPUT_SIZE)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let amount = buf.get_u64();
            let recipient = read_hash(buf);
            outputs.push(TxOutput { amount, recipient });
        }

        Ok(Self {
            timestamp,
            inputs,
            outputs,
        })
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), TransactionError> {
    if buf.remaining() < len {
        return Err(TransactionError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}

/// Read a hash; the caller has already checked the length
pub(crate) fn read_hash(buf: &mut &[u8]) -> Hash {
    let mut bytes = [0u8; HASH_SIZE];
    buf.copy_to_slice(&mut bytes);
    Hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            timestamp: 1_700_000_000,
            inputs: vec![TxInput {
                prev_tx: Hash([1u8; 32]),
                index: 0,
            }],
            outputs: vec![TxOutput {
                amount: 50,
                recipient: Hash([2u8; 32]),
            }],
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.to_bytes();
        assert_eq!(bytes.len(), tx.encoded_len());
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_hash_is_content_based() {
        let a = sample_tx();
        let b = sample_tx();
        assert_eq!(a.hash(), b.hash());

        let mut c = sample_tx();
        c.outputs[0].amount = 51;
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample_tx().to_bytes();
        for cut in [0, 5, 12, bytes.len() - 1] {
            assert!(matches!(
                Transaction::from_bytes(&bytes[..cut]),
                Err(TransactionError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_tx().to_bytes();
        bytes.push(0);
        assert_eq!(
            Transaction::from_bytes(&bytes),
            Err(TransactionError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_pseudo_validity() {
        assert!(sample_tx().is_pseudo_valid());

        let mut no_outputs = sample_tx();
        no_outputs.outputs.clear();
        assert!(!no_outputs.is_pseudo_valid());

        let mut zero_amount = sample_tx();
        zero_amount.outputs[0].amount = 0;
        assert!(!zero_amount.is_pseudo_valid());

        let mut double_spend = sample_tx();
        double_spend.inputs.push(double_spend.inputs[0].clone());
        assert!(!double_spend.is_pseudo_valid());

        let mut overflow = sample_tx();
        overflow.outputs.push(TxOutput {
            amount: u64::MAX,
            recipient: Hash::ZERO,
        });
        assert!(!overflow.is_pseudo_valid());
    }
}
