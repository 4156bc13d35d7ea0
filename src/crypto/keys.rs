//! Administrative alert keys
//!
//! Alerts are signed with a secp256k1 key kept in a secret file on the node
//! that broadcasts them. Signatures are compact (64 byte) ECDSA over the
//! SHA-256 of the signed document.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::hash::sha256;

/// Length of a compact signature on the wire
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur while loading or using the admin key
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Admin key unavailable at {path}: {source}")]
    Unavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Key used to sign administrative alerts
#[derive(Clone)]
pub struct AdminKey {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl AdminKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        let public_key = PublicKey::from_secret_key(&Secp256k1::new(), &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Load the key from a secret file holding the hex private key
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let contents = fs::read_to_string(path).map_err(|source| KeyError::Unavailable {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_private_key_hex(&contents)
    }

    /// Write the key to a secret file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.private_key_hex())
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign a document
    pub fn sign(&self, document: &[u8]) -> Result<[u8; SIGNATURE_SIZE], KeyError> {
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(&sha256(document))?;
        Ok(secp
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact())
    }
}

/// Verify a compact signature over a document
pub fn verify_signature(
    public_key: &PublicKey,
    document: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();
    let message = Message::from_digest_slice(&sha256(document))?;
    let sig = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;
    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}
