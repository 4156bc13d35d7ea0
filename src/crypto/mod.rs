//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256 hashing and the wire [`Hash`] type
//! - secp256k1 admin keys for signing network alerts

pub mod hash;
pub mod keys;

pub use hash::{double_sha256, sha256, Hash, HASH_SIZE};
pub use keys::{verify_signature, AdminKey, KeyError, SIGNATURE_SIZE};
