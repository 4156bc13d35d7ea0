//! Administrative alerts
//!
//! Alerts are broadcast by the network operators to warn users or force an
//! upgrade. The signed document is `alert_type:1 | object_type:1 |
//! timestamp:4 | message`; on the wire it is preceded by the message length
//! and the compact signature.

use crate::crypto::{verify_signature, AdminKey, KeyError, SIGNATURE_SIZE};
use bytes::BufMut;
use secp256k1::PublicKey;
use std::path::Path;
use thiserror::Error;

/// File name of the admin signing key inside the data directory
pub const ADMIN_SECRET_FILE: &str = "admin_secret";

/// Longest message that fits the one-byte length prefix
pub const MAX_ALERT_MESSAGE: usize = u8::MAX as usize;

/// What the client should do with an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertObject {
    /// Display a warning to the user, visible at all times
    WarnUser = 0,
    /// Do not allow the user to do anything until the client is updated
    ForceUpdate = 1,
}

impl AlertObject {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AlertObject::WarnUser),
            1 => Some(AlertObject::ForceUpdate),
            _ => None,
        }
    }
}

/// Alert signing errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert key error: {0}")]
    Key(#[from] KeyError),
    #[error("Alert message too long: {0} bytes (max: 255)")]
    MessageTooLong(usize),
    #[error("Alert message must be ASCII")]
    NotAscii,
}

/// A signed administrative alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub alert_type: u8,
    pub object_type: u8,
    /// Unix seconds at signing time
    pub timestamp: u32,
    pub message: String,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Alert {
    /// Build and sign an alert with the given key
    pub fn sign(
        key: &AdminKey,
        alert_type: u8,
        object: AlertObject,
        message: &str,
    ) -> Result<Self, AlertError> {
        if message.len() > MAX_ALERT_MESSAGE {
            return Err(AlertError::MessageTooLong(message.len()));
        }
        if !message.is_ascii() {
            return Err(AlertError::NotAscii);
        }
        let timestamp = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let document = signed_document(alert_type, object as u8, timestamp, message);
        let signature = key.sign(&document)?;
        Ok(Self {
            alert_type,
            object_type: object as u8,
            timestamp,
            message: message.to_string(),
            signature,
        })
    }

    /// Load the admin key from `data_dir` and sign an alert.
    /// A missing key is an error; an unsigned alert is never produced.
    pub fn sign_with_key_file(
        data_dir: &Path,
        alert_type: u8,
        object: AlertObject,
        message: &str,
    ) -> Result<Self, AlertError> {
        let key = AdminKey::load(&data_dir.join(ADMIN_SECRET_FILE))?;
        Self::sign(&key, alert_type, object, message)
    }

    pub fn object(&self) -> Option<AlertObject> {
        AlertObject::from_u8(self.object_type)
    }

    /// The bytes covered by the signature
    pub fn document(&self) -> Vec<u8> {
        signed_document(
            self.alert_type,
            self.object_type,
            self.timestamp,
            &self.message,
        )
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        verify_signature(public_key, &self.document(), &self.signature).unwrap_or(false)
    }
}

fn signed_document(alert_type: u8, object_type: u8, timestamp: u32, message: &str) -> Vec<u8> {
    let mut doc = Vec::with_capacity(6 + message.len());
    doc.put_u8(alert_type);
    doc.put_u8(object_type);
    doc.put_u32(timestamp);
    doc.put_slice(message.as_bytes());
    doc
}
