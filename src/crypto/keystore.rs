//! Key material containers
//!
//! Three kinds of keys live here:
//! - [`KeyStore`]: an X25519 keypair (permanent or per-session)
//! - [`SharedKeyStore`]: a precomputed symmetric key for one peer
//! - [`AuthToken`]: the one-use symmetric token shared out-of-band

use zeroize::Zeroizing;

use crate::crypto::cipher::{self, KEY_LEN, NONCE_LEN, SYMMETRIC_KEY_LEN};
use crate::error::{ConfigError, CryptoError};

/// An X25519 keypair
pub struct KeyStore {
    public_key: [u8; KEY_LEN],
    secret_key: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyStore {
    /// Generate a fresh keypair
    pub fn new() -> Self {
        let (secret, public) = cipher::generate_keypair();
        Self {
            public_key: public,
            secret_key: Zeroizing::new(secret),
        }
    }

    /// Restore a keypair from an existing secret key
    pub fn from_secret_key(secret_key: [u8; KEY_LEN]) -> Self {
        Self {
            public_key: cipher::public_key(&secret_key),
            secret_key: Zeroizing::new(secret_key),
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public_key
    }

    /// Precompute the shared key towards a peer
    pub fn shared_with(&self, peer_public: &[u8; KEY_LEN]) -> SharedKeyStore {
        SharedKeyStore {
            key: Zeroizing::new(cipher::shared_key(&self.secret_key, peer_public)),
            remote_public_key: *peer_public,
        }
    }

    /// One-shot box encryption without caching the shared key
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_LEN],
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        cipher::box_encrypt(&self.secret_key, peer_public, nonce, plaintext)
    }

    /// One-shot box decryption without caching the shared key
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        cipher::box_decrypt(&self.secret_key, peer_public, nonce, ciphertext)
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("public_key", &hex::encode(self.public_key))
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// A precomputed shared key towards one peer
#[derive(Clone)]
pub struct SharedKeyStore {
    key: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
    remote_public_key: [u8; KEY_LEN],
}

impl SharedKeyStore {
    pub fn remote_public_key(&self) -> &[u8; KEY_LEN] {
        &self.remote_public_key
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        cipher::secretbox_encrypt(&self.key, nonce, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        cipher::secretbox_decrypt(&self.key, nonce, ciphertext)
    }
}

impl std::fmt::Debug for SharedKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeyStore")
            .field("remote_public_key", &hex::encode(self.remote_public_key))
            .field("key", &"[redacted]")
            .finish()
    }
}

/// The one-use symmetric auth token
///
/// Known to both parties out-of-band; encrypts exactly one message, the
/// responder's `token`.
#[derive(Clone)]
pub struct AuthToken {
    token: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
}

impl AuthToken {
    /// Generate a fresh random token
    pub fn new() -> Self {
        use rand::RngCore;
        let mut token = [0u8; SYMMETRIC_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut token);
        Self {
            token: Zeroizing::new(token),
        }
    }

    /// Restore a token received out-of-band
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let token: [u8; SYMMETRIC_KEY_LEN] =
            bytes.try_into().map_err(|_| ConfigError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_LEN,
                got: bytes.len(),
            })?;
        Ok(Self {
            token: Zeroizing::new(token),
        })
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.token
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        cipher::secretbox_encrypt(&self.token, nonce, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CryptoError> {
        cipher::secretbox_decrypt(&self.token, nonce, ciphertext)
    }
}

impl Default for AuthToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken([redacted])")
    }
}
