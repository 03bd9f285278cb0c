//! Signaling channel nonce
//!
//! Fixed 24-byte layout:
//!
//! ```text
//! cookie(16) | source(1) | destination(1) | overflow(2, BE) | sequence(4, BE)
//! ```
//!
//! The nonce doubles as the authenticated-encryption nonce for every frame
//! and as the carrier of the addressing and ordering metadata.

use crate::error::ValidationError;
use crate::protocol::cookie::{Cookie, COOKIE_LEN};
use crate::protocol::csn::CombinedSequenceSnapshot;

/// Total nonce length in bytes
pub const NONCE_LEN: usize = 24;

/// The server address
pub const ADDR_SERVER: Address = Address(0x00);

/// The placeholder address before assignment
pub const ADDR_UNKNOWN: Address = Address(0x00);

/// The initiator address
pub const ADDR_INITIATOR: Address = Address(0x01);

/// A signaling channel address byte
///
/// `0x00` is the server, `0x01` the initiator, `0x02..=0xff` responder
/// slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub u8);

impl Address {
    pub fn is_server(self) -> bool {
        self.0 == 0x00
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0x00
    }

    pub fn is_initiator(self) -> bool {
        self.0 == 0x01
    }

    pub fn is_responder(self) -> bool {
        self.0 >= 0x02
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A parsed 24-byte signaling nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce {
    cookie: Cookie,
    source: Address,
    destination: Address,
    csn: CombinedSequenceSnapshot,
}

impl Nonce {
    pub fn new(
        cookie: Cookie,
        source: Address,
        destination: Address,
        csn: CombinedSequenceSnapshot,
    ) -> Self {
        Self {
            cookie,
            source,
            destination,
            csn,
        }
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn csn(&self) -> CombinedSequenceSnapshot {
        self.csn
    }

    /// Serialize to the wire layout
    pub fn to_bytes(&self) -> [u8; NONCE_LEN] {
        let mut buf = [0u8; NONCE_LEN];
        buf[0..16].copy_from_slice(self.cookie.as_bytes());
        buf[16] = self.source.0;
        buf[17] = self.destination.0;
        buf[18..20].copy_from_slice(&self.csn.overflow_number().to_be_bytes());
        buf[20..24].copy_from_slice(&self.csn.sequence_number().to_be_bytes());
        buf
    }

    /// Parse from the wire layout
    pub fn from_bytes(data: &[u8]) -> Result<Self, ValidationError> {
        if data.len() != NONCE_LEN {
            return Err(ValidationError::ByteLength {
                field: "nonce",
                expected: NONCE_LEN,
                got: data.len(),
            });
        }

        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&data[0..16]);

        let overflow = u16::from_be_bytes([data[18], data[19]]);
        let sequence = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

        Ok(Self {
            cookie: Cookie::from(cookie),
            source: Address(data[16]),
            destination: Address(data[17]),
            csn: CombinedSequenceSnapshot::new(overflow, sequence),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_nonce() -> Nonce {
        Nonce::new(
            Cookie::from([0xab; COOKIE_LEN]),
            Address(0x01),
            Address(0x03),
            CombinedSequenceSnapshot::new(0x0102, 0x0304_0506),
        )
    }

    #[test]
    fn test_roundtrip() {
        let nonce = test_nonce();
        let bytes = nonce.to_bytes();
        assert_eq!(Nonce::from_bytes(&bytes).unwrap(), nonce);
    }

    #[test]
    fn test_layout_is_big_endian() {
        let bytes = test_nonce().to_bytes();
        assert_eq!(&bytes[0..16], &[0xab; 16]);
        assert_eq!(bytes[16], 0x01);
        assert_eq!(bytes[17], 0x03);
        assert_eq!(&bytes[18..20], &[0x01, 0x02]);
        assert_eq!(&bytes[20..24], &[0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(Nonce::from_bytes(&[0u8; 23]).is_err());
        assert!(Nonce::from_bytes(&[0u8; 25]).is_err());
        assert!(Nonce::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_address_classification() {
        assert!(Address(0x00).is_server());
        assert!(Address(0x00).is_unknown());
        assert!(Address(0x01).is_initiator());
        assert!(Address(0x02).is_responder());
        assert!(Address(0xff).is_responder());
        assert!(!Address(0x01).is_responder());
        assert!(!Address(0x02).is_initiator());
    }
}
