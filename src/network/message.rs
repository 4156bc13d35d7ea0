//! Network message types for P2P communication
//!
//! Every message is a 7 byte header (see [`crate::network::codec`]) followed
//! by a body whose layout depends on the message type:
//!
//! | type | body |
//! |------|------|
//! | reject | `code:1 \| ascii reason`, or empty for a bare reject |
//! | getchain | `start hash:32 \| count:1` |
//! | inv, getdata | `data type:1 \| count:1 \| hashes:32*n` |
//! | block, tx | object bytes |
//! | peer | `port:2 \| len:1 \| ascii host` |
//! | alert | `len:1 \| signature:64 \| alert type:1 \| object type:1 \| timestamp:4 \| message` |
//! | gethighest, gettxs, getpeers, ping, pong | empty |
//!
//! Decoding never panics: bad input yields a [`DecodeError`] that the peer
//! turns into a `reject`.

use crate::core::{Block, BlockError, Transaction, TransactionError};
use crate::crypto::{Hash, HASH_SIZE, SIGNATURE_SIZE};
use crate::network::address::{AddressError, PeerAddress};
use crate::network::alert::Alert;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum body size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of hashes in an inv/getdata list
pub const MAX_INV_ENTRIES: usize = 255;

/// Shortest meaningful inv/getdata body: type, count and one hash
pub const MIN_INV_BODY: usize = 2 + HASH_SIZE;

/// getchain body: start hash and count
pub const GETCHAIN_BODY: usize = HASH_SIZE + 1;

/// Fixed part of an alert body before the message text
const ALERT_FIXED: usize = 1 + SIGNATURE_SIZE + 1 + 1 + 4;

/// Message decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("Unknown data type: {0}")]
    UnknownDataType(u8),
    #[error("{0}")]
    Malformed(&'static str),
    #[error("Bad block: {0}")]
    Block(#[from] BlockError),
    #[error("Bad transaction: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Bad peer address: {0}")]
    Address(#[from] AddressError),
}

/// Message type ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Reject = 0,
    GetHighest = 1,
    GetChain = 2,
    GetTxs = 3,
    GetPeers = 4,
    Inv = 5,
    GetData = 6,
    Block = 7,
    Tx = 8,
    Peer = 9,
    Alert = 10,
    Ping = 11,
    Pong = 12,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Reject => "reject",
            MessageType::GetHighest => "gethighest",
            MessageType::GetChain => "getchain",
            MessageType::GetTxs => "gettxs",
            MessageType::GetPeers => "getpeers",
            MessageType::Inv => "inv",
            MessageType::GetData => "getdata",
            MessageType::Block => "block",
            MessageType::Tx => "tx",
            MessageType::Peer => "peer",
            MessageType::Alert => "alert",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageType::Reject,
            1 => MessageType::GetHighest,
            2 => MessageType::GetChain,
            3 => MessageType::GetTxs,
            4 => MessageType::GetPeers,
            5 => MessageType::Inv,
            6 => MessageType::GetData,
            7 => MessageType::Block,
            8 => MessageType::Tx,
            9 => MessageType::Peer,
            10 => MessageType::Alert,
            11 => MessageType::Ping,
            12 => MessageType::Pong,
            other => return Err(DecodeError::UnknownMessageType(other)),
        })
    }
}

/// Kind of object referenced by an inventory list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Block = 0,
    Tx = 1,
    Peer = 2,
}

impl TryFrom<u8> for DataType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::Block),
            1 => Ok(DataType::Tx),
            2 => Ok(DataType::Peer),
            other => Err(DecodeError::UnknownDataType(other)),
        }
    }
}

/// Reject codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    BadVersion = 1,
    BadCtype = 2,
    BadDtype = 3,
    BadAtype = 4,
    MessageMalformed = 5,
    /// Reserved; blacklisting is not implemented
    BlockBlacklisted = 6,
    BlockInvalid = 7,
    TxInvalid = 8,
}

impl RejectCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RejectCode::BadVersion,
            2 => RejectCode::BadCtype,
            3 => RejectCode::BadDtype,
            4 => RejectCode::BadAtype,
            5 => RejectCode::MessageMalformed,
            6 => RejectCode::BlockBlacklisted,
            7 => RejectCode::BlockInvalid,
            8 => RejectCode::TxInvalid,
            _ => return None,
        })
    }
}

/// Reject message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reject {
    /// Raw code, kept as-is so unknown codes can still be logged.
    /// None for a bare reject.
    pub code: Option<u8>,
    pub reason: String,
}

impl Reject {
    pub fn new(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code as u8),
            reason: reason.into(),
        }
    }

    /// Reject with an empty body
    pub fn bare() -> Self {
        Self::default()
    }

    pub fn code(&self) -> Option<RejectCode> {
        self.code.and_then(RejectCode::from_u8)
    }
}

/// Inventory list carried by inv and getdata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub data_type: DataType,
    pub hashes: Vec<Hash>,
}

impl Inventory {
    pub fn new(data_type: DataType, hashes: Vec<Hash>) -> Self {
        Self { data_type, hashes }
    }

    /// Split a hash list into inventories of at most [`MAX_INV_ENTRIES`]
    pub fn split(data_type: DataType, hashes: &[Hash]) -> impl Iterator<Item = Self> + '_ {
        hashes
            .chunks(MAX_INV_ENTRIES)
            .map(move |chunk| Self::new(data_type, chunk.to_vec()))
    }

    /// Only the first [`MAX_INV_ENTRIES`] hashes fit in one message; use
    /// [`Inventory::split`] for longer lists.
    fn encode(&self, buf: &mut Vec<u8>) {
        let hashes = &self.hashes[..self.hashes.len().min(MAX_INV_ENTRIES)];
        buf.put_u8(self.data_type as u8);
        buf.put_u8(hashes.len() as u8);
        for hash in hashes {
            buf.put_slice(hash.as_bytes());
        }
    }

    fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        if body.len() < MIN_INV_BODY {
            return Err(DecodeError::Malformed("inventory impossibly short"));
        }
        // The count byte is informational; the list length is authoritative
        let list = &body[2..];
        if list.len() > MAX_INV_ENTRIES * HASH_SIZE {
            return Err(DecodeError::Malformed("inventory list too large"));
        }
        if list.len() % HASH_SIZE != 0 {
            return Err(DecodeError::Malformed("invalid inventory list size"));
        }
        let data_type = DataType::try_from(body[0])?;
        let hashes = list
            .chunks_exact(HASH_SIZE)
            .filter_map(Hash::from_slice)
            .collect();
        Ok(Self { data_type, hashes })
    }
}

/// Network messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Reject(Reject),
    /// Ask for the highest chained block
    GetHighest,
    /// Ask for up to `count` ancestors walking back from `start`
    GetChain { start: Hash, count: u8 },
    /// Ask for the mempool inventory
    GetTxs,
    /// Ask for reachable peers
    GetPeers,
    Inv(Inventory),
    GetData(Inventory),
    Block(Block),
    Tx(Transaction),
    Peer(PeerAddress),
    Alert(Alert),
    Ping,
    Pong,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Reject(_) => MessageType::Reject,
            Message::GetHighest => MessageType::GetHighest,
            Message::GetChain { .. } => MessageType::GetChain,
            Message::GetTxs => MessageType::GetTxs,
            Message::GetPeers => MessageType::GetPeers,
            Message::Inv(_) => MessageType::Inv,
            Message::GetData(_) => MessageType::GetData,
            Message::Block(_) => MessageType::Block,
            Message::Tx(_) => MessageType::Tx,
            Message::Peer(_) => MessageType::Peer,
            Message::Alert(_) => MessageType::Alert,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        self.message_type().name()
    }

    /// Serialize the message body
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::Reject(reject) => {
                if let Some(code) = reject.code {
                    buf.put_u8(code);
                    buf.put_slice(reject.reason.as_bytes());
                }
            }
            Message::GetChain { start, count } => {
                buf.put_slice(start.as_bytes());
                buf.put_u8(*count);
            }
            Message::Inv(inv) | Message::GetData(inv) => inv.encode(&mut buf),
            Message::Block(block) => buf = block.to_bytes(),
            Message::Tx(tx) => buf = tx.to_bytes(),
            Message::Peer(addr) => buf = addr.to_bytes(),
            Message::Alert(alert) => {
                buf.put_u8(alert.message.len().min(u8::MAX as usize) as u8);
                buf.put_slice(&alert.signature);
                buf.put_slice(&alert.document());
            }
            Message::GetHighest
            | Message::GetTxs
            | Message::GetPeers
            | Message::Ping
            | Message::Pong => {}
        }
        buf
    }

    /// Deserialize a message body of the given type
    pub fn decode(msg_type: MessageType, body: &[u8]) -> Result<Self, DecodeError> {
        Ok(match msg_type {
            MessageType::Reject => match body.split_first() {
                None => Message::Reject(Reject::bare()),
                Some((code, reason)) => Message::Reject(Reject {
                    code: Some(*code),
                    reason: String::from_utf8_lossy(reason).into_owned(),
                }),
            },
            MessageType::GetHighest => Message::GetHighest,
            MessageType::GetChain => {
                if body.len() < GETCHAIN_BODY {
                    return Err(DecodeError::Malformed("getchain too short"));
                }
                let start = Hash::from_slice(&body[..HASH_SIZE])
                    .ok_or(DecodeError::Malformed("getchain too short"))?;
                Message::GetChain {
                    start,
                    count: body[HASH_SIZE],
                }
            }
            MessageType::GetTxs => Message::GetTxs,
            MessageType::GetPeers => Message::GetPeers,
            MessageType::Inv => Message::Inv(Inventory::decode(body)?),
            MessageType::GetData => Message::GetData(Inventory::decode(body)?),
            MessageType::Block => Message::Block(Block::from_bytes(body)?),
            MessageType::Tx => Message::Tx(Transaction::from_bytes(body)?),
            MessageType::Peer => Message::Peer(PeerAddress::from_bytes(body)?),
            MessageType::Alert => Message::Alert(decode_alert(body)?),
            MessageType::Ping => Message::Ping,
            MessageType::Pong => Message::Pong,
        })
    }
}

fn decode_alert(body: &[u8]) -> Result<Alert, DecodeError> {
    if body.len() < ALERT_FIXED {
        return Err(DecodeError::Malformed("alert too short"));
    }
    let mut buf = body;
    let message_len = buf.get_u8() as usize;
    let mut signature = [0u8; SIGNATURE_SIZE];
    buf.copy_to_slice(&mut signature);
    let alert_type = buf.get_u8();
    let object_type = buf.get_u8();
    let timestamp = buf.get_u32();
    if buf.remaining() != message_len {
        return Err(DecodeError::Malformed("alert message length mismatch"));
    }
    let message = std::str::from_utf8(buf)
        .ok()
        .filter(|m| m.is_ascii())
        .ok_or(DecodeError::Malformed("alert message not ascii"))?
        .to_string();
    Ok(Alert {
        alert_type,
        object_type,
        timestamp,
        message,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TxInput, TxOutput};
    use crate::crypto::AdminKey;
    use crate::network::alert::AlertObject;

    fn sample_tx() -> Transaction {
        Transaction {
            timestamp: 1_700_000_000,
            inputs: vec![TxInput {
                prev_tx: Hash([5u8; 32]),
                index: 3,
            }],
            outputs: vec![TxOutput {
                amount: 42,
                recipient: Hash([6u8; 32]),
            }],
        }
    }

    fn inv_body(dtype: u8, list_len: usize) -> Vec<u8> {
        let mut body = vec![dtype, (list_len / HASH_SIZE) as u8];
        body.extend(std::iter::repeat(0xAB).take(list_len));
        body
    }

    #[test]
    fn test_every_message_roundtrips() {
        let key = AdminKey::generate();
        let messages = vec![
            Message::Reject(Reject::new(RejectCode::TxInvalid, "deadbeef")),
            Message::GetHighest,
            Message::GetChain {
                start: Hash([1u8; 32]),
                count: 255,
            },
            Message::GetTxs,
            Message::GetPeers,
            Message::Inv(Inventory::new(DataType::Block, vec![Hash([2u8; 32])])),
            Message::GetData(Inventory::new(
                DataType::Tx,
                (0..MAX_INV_ENTRIES as u8).map(|i| Hash([i; 32])).collect(),
            )),
            Message::Block(Block::new(7, Hash([3u8; 32]), vec![sample_tx()])),
            Message::Tx(sample_tx()),
            Message::Peer(PeerAddress::new("192.168.1.20", 64720)),
            Message::Alert(Alert::sign(&key, 0, AlertObject::WarnUser, "maintenance").unwrap()),
            Message::Ping,
            Message::Pong,
        ];

        for msg in messages {
            let body = msg.encode_body();
            let decoded = Message::decode(msg.message_type(), &body).unwrap();
            assert_eq!(decoded, msg, "{} did not roundtrip", msg.type_name());
        }
    }

    #[test]
    fn test_message_type_ids() {
        for id in 0..=12u8 {
            assert_eq!(MessageType::try_from(id).unwrap() as u8, id);
        }
        assert_eq!(
            MessageType::try_from(13),
            Err(DecodeError::UnknownMessageType(13))
        );
    }

    #[test]
    fn test_inventory_list_not_multiple_of_hash_size() {
        for msg_type in [MessageType::Inv, MessageType::GetData] {
            let result = Message::decode(msg_type, &inv_body(0, HASH_SIZE + 5));
            assert_eq!(
                result,
                Err(DecodeError::Malformed("invalid inventory list size"))
            );
        }
    }

    #[test]
    fn test_inventory_list_too_large() {
        let body = inv_body(1, (MAX_INV_ENTRIES + 1) * HASH_SIZE);
        assert_eq!(
            Message::decode(MessageType::Inv, &body),
            Err(DecodeError::Malformed("inventory list too large"))
        );
        assert_eq!(
            Message::decode(MessageType::GetData, &body),
            Err(DecodeError::Malformed("inventory list too large"))
        );
    }

    #[test]
    fn test_inventory_too_short_and_bad_dtype() {
        assert_eq!(
            Message::decode(MessageType::Inv, &[0, 1, 2, 3]),
            Err(DecodeError::Malformed("inventory impossibly short"))
        );
        assert_eq!(
            Message::decode(MessageType::GetData, &inv_body(9, HASH_SIZE)),
            Err(DecodeError::UnknownDataType(9))
        );
    }

    #[test]
    fn test_getchain_too_short() {
        assert_eq!(
            Message::decode(MessageType::GetChain, &[0u8; 32]),
            Err(DecodeError::Malformed("getchain too short"))
        );
    }

    #[test]
    fn test_truncated_objects_are_typed_errors() {
        let tx = sample_tx().to_bytes();
        assert!(matches!(
            Message::decode(MessageType::Tx, &tx[..tx.len() - 1]),
            Err(DecodeError::Transaction(_))
        ));
        assert!(matches!(
            Message::decode(MessageType::Block, &[1, 2, 3]),
            Err(DecodeError::Block(_))
        ));
        assert!(matches!(
            Message::decode(MessageType::Peer, &[0x20]),
            Err(DecodeError::Address(_))
        ));
        assert_eq!(
            Message::decode(MessageType::Alert, &[0u8; 10]),
            Err(DecodeError::Malformed("alert too short"))
        );
    }

    #[test]
    fn test_empty_reject_is_bare() {
        let bare = Message::decode(MessageType::Reject, &[]).unwrap();
        assert_eq!(bare, Message::Reject(Reject::bare()));
        match &bare {
            Message::Reject(reject) => assert_eq!(reject.code(), None),
            _ => unreachable!(),
        }
        assert!(bare.encode_body().is_empty());
    }

    #[test]
    fn test_oversized_inventory_encodes_first_entries() {
        let hashes: Vec<Hash> = (0..300u32)
            .map(|i| Hash::digest(&i.to_be_bytes()))
            .collect();
        let body = Message::Inv(Inventory::new(DataType::Block, hashes.clone())).encode_body();
        assert_eq!(body[1] as usize, MAX_INV_ENTRIES);

        match Message::decode(MessageType::Inv, &body).unwrap() {
            Message::Inv(inv) => assert_eq!(inv.hashes, hashes[..MAX_INV_ENTRIES].to_vec()),
            other => panic!("expected inv, got {:?}", other),
        }

        let sizes: Vec<usize> = Inventory::split(DataType::Block, &hashes)
            .map(|inv| inv.hashes.len())
            .collect();
        assert_eq!(sizes, vec![255, 45]);
    }

    #[test]
    fn test_inventory_wire_layout() {
        let inv = Inventory::new(DataType::Tx, vec![Hash([7u8; 32]), Hash([8u8; 32])]);
        let body = Message::Inv(inv).encode_body();
        assert_eq!(body.len(), 2 + 2 * HASH_SIZE);
        assert_eq!(&body[..2], &[1, 2]);
        assert_eq!(&body[2..34], &[7u8; 32]);
    }
}
