//! Frame forms on the signaling channel
//!
//! Every frame is `nonce(24) || payload`. A [`ByteBox`] is the raw form
//! with an opaque payload (ciphertext, or cleartext for the first two
//! server handshake messages); an [`OpenBox`] pairs the nonce with a
//! decoded message.

use crate::crypto::{AuthToken, SharedKeyStore};
use crate::error::{Result, SaltlinkError, SerializationError};
use crate::protocol::messages::Message;
use crate::protocol::nonce::{Nonce, NONCE_LEN};

/// A raw frame: parsed nonce plus opaque payload bytes
#[derive(Debug, Clone)]
pub struct ByteBox {
    pub nonce: Nonce,
    pub bytes: Vec<u8>,
}

impl ByteBox {
    pub fn new(nonce: Nonce, bytes: Vec<u8>) -> Self {
        Self { nonce, bytes }
    }

    /// Split a transport frame into nonce and payload
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        if frame.len() <= NONCE_LEN {
            return Err(SerializationError::Decode(format!(
                "frame too short: {} bytes",
                frame.len()
            ))
            .into());
        }
        let nonce = Nonce::from_bytes(&frame[..NONCE_LEN]).map_err(SaltlinkError::from)?;
        Ok(Self {
            nonce,
            bytes: frame[NONCE_LEN..].to_vec(),
        })
    }

    /// Serialize to a transport frame
    pub fn into_bytes(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(NONCE_LEN + self.bytes.len());
        frame.extend_from_slice(&self.nonce.to_bytes());
        frame.extend_from_slice(&self.bytes);
        frame
    }

    /// Parse the payload as a cleartext catalog message
    pub fn decode(self) -> Result<OpenBox> {
        let message = Message::from_bytes(&self.bytes)?;
        Ok(OpenBox {
            nonce: self.nonce,
            message,
        })
    }

    /// Decrypt with a shared key, then parse as a catalog message
    pub fn decrypt(self, key: &SharedKeyStore) -> Result<OpenBox> {
        let payload = key.decrypt(&self.bytes, &self.nonce.to_bytes())?;
        let message = Message::from_bytes(&payload)?;
        Ok(OpenBox {
            nonce: self.nonce,
            message,
        })
    }

    /// Decrypt with the auth token, then parse as a catalog message
    pub fn decrypt_token(self, token: &AuthToken) -> Result<OpenBox> {
        let payload = token.decrypt(&self.bytes, &self.nonce.to_bytes())?;
        let message = Message::from_bytes(&payload)?;
        Ok(OpenBox {
            nonce: self.nonce,
            message,
        })
    }
}

/// A decoded frame: nonce plus typed message
#[derive(Debug, Clone)]
pub struct OpenBox {
    pub nonce: Nonce,
    pub message: Message,
}

impl OpenBox {
    pub fn new(message: Message, nonce: Nonce) -> Self {
        Self { nonce, message }
    }

    /// Encode without encryption (cleartext handshake frames)
    pub fn encode(self) -> Result<ByteBox> {
        let bytes = self.message.to_bytes()?;
        Ok(ByteBox::new(self.nonce, bytes))
    }

    /// Encode and encrypt with a shared key
    pub fn encrypt(self, key: &SharedKeyStore) -> Result<ByteBox> {
        let payload = self.message.to_bytes()?;
        let bytes = key.encrypt(&payload, &self.nonce.to_bytes())?;
        Ok(ByteBox::new(self.nonce, bytes))
    }

    /// Encode and encrypt with the auth token
    pub fn encrypt_token(self, token: &AuthToken) -> Result<ByteBox> {
        let payload = self.message.to_bytes()?;
        let bytes = token.encrypt(&payload, &self.nonce.to_bytes())?;
        Ok(ByteBox::new(self.nonce, bytes))
    }
}
