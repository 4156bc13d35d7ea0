//! Frame codec
//!
//! Every frame starts with a fixed 7 byte header:
//!
//! ```text
//! +-------------+-----------+--------+
//! | body length |  version  |  type  |
//! |  4 bytes BE | 2 bytes BE| 1 byte |
//! +-------------+-----------+--------+
//! |        body (length bytes)       |
//! +----------------------------------+
//! ```
//!
//! The codec only frames; the version and type are checked by the peer so it
//! can answer with the right reject code.

use crate::network::message::{Message, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Header size: length (4) + version (2) + type (1)
pub const HEADER_SIZE: usize = 7;

/// Framing errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Message too large: {size} bytes, max {max} bytes")]
    TooLarge { size: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A raw frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub msg_type: u8,
    pub body: Bytes,
}

impl Frame {
    /// Frame a message for the given protocol version
    pub fn from_message(version: u16, message: &Message) -> Self {
        Self {
            version,
            msg_type: message.message_type() as u8,
            body: Bytes::from(message.encode_body()),
        }
    }
}

/// Length-prefixed frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Refuse before buffering the body
        if length > self.max_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let version = src.get_u16();
        let msg_type = src.get_u8();
        let body = src.split_to(length).freeze();

        Ok(Some(Frame {
            version,
            msg_type,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.body.len();
        if length > self.max_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_u16(item.version);
        dst.put_u8(item.msg_type);
        dst.put_slice(&item.body);
        Ok(())
    }
}
