//! Peer addresses
//!
//! A peer is identified by the host and port it can be dialled on. The text
//! form `host:port` is used by the known-peers file; the wire form is
//! `port:2 | len:1 | ascii host`.

use bytes::{Buf, BufMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default protocol port (hex 0xfcd0)
pub const DEFAULT_PORT: u16 = 64720;

/// Longest host that fits the one-byte length prefix
pub const MAX_HOST_LEN: usize = u8::MAX as usize;

/// Address parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Missing ':' separator in {0:?}")]
    MissingPort(String),
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),
    #[error("Invalid host in {0:?}")]
    InvalidHost(String),
    #[error("Address truncated")]
    Truncated,
}

/// Address of a remote node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Hosts must be non-empty printable ASCII without whitespace
    fn valid_host(host: &str) -> bool {
        !host.is_empty()
            && host.len() <= MAX_HOST_LEN
            && host.bytes().all(|b| b.is_ascii_graphic())
    }

    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let host = self.host.as_bytes();
        let len = host.len().min(MAX_HOST_LEN);
        let mut buf = Vec::with_capacity(3 + len);
        buf.put_u16(self.port);
        buf.put_u8(len as u8);
        buf.put_slice(&host[..len]);
        buf
    }

    /// Deserialize from the wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self, AddressError> {
        let mut buf = data;
        if buf.remaining() < 3 {
            return Err(AddressError::Truncated);
        }
        let port = buf.get_u16();
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(AddressError::Truncated);
        }
        let host = std::str::from_utf8(&buf[..len])
            .map_err(|_| AddressError::InvalidHost(String::from_utf8_lossy(&buf[..len]).into()))?;
        if !Self::valid_host(host) {
            return Err(AddressError::InvalidHost(host.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        if !Self::valid_host(host) {
            return Err(AddressError::InvalidHost(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_form() {
        let addr: PeerAddress = "10.0.0.7:64720".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("10.0.0.7", DEFAULT_PORT));
        assert_eq!(addr.to_string(), "10.0.0.7:64720");
    }

    #[test]
    fn test_bad_text_forms() {
        assert!(matches!(
            "10.0.0.7".parse::<PeerAddress>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            "10.0.0.7:99999".parse::<PeerAddress>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            ":8333".parse::<PeerAddress>(),
            Err(AddressError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_wire_form() {
        let addr = PeerAddress::new("node.example.org", 8333);
        let bytes = addr.to_bytes();
        assert_eq!(&bytes[..3], &[0x20, 0x8d, 16]);
        assert_eq!(PeerAddress::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn test_truncated_wire_form() {
        let bytes = PeerAddress::new("node.example.org", 8333).to_bytes();
        assert_eq!(
            PeerAddress::from_bytes(&bytes[..2]),
            Err(AddressError::Truncated)
        );
        assert_eq!(
            PeerAddress::from_bytes(&bytes[..bytes.len() - 1]),
            Err(AddressError::Truncated)
        );
    }
}
