//! Cryptographic hashing utilities
//!
//! SHA-256 based hashing used for block hashes and transaction ids, plus the
//! fixed-size [`Hash`] type that travels on the wire.

use sha2::{Digest, Sha256};
use std::fmt;

/// Size of a hash on the wire
pub const HASH_SIZE: usize = 32;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    sha256(&sha256(data))
}

/// A 32-byte content hash identifying a block or transaction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash, used as the genesis parent
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Hash arbitrary data with double SHA-256
    pub fn digest(data: &[u8]) -> Self {
        Hash(double_sha256(data))
    }

    /// Build a hash from a slice that must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(array))
    }

    /// Parse a lower- or upper-case hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }
}
