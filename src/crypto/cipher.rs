//! Authenticated encryption primitives for the signaling channel
//!
//! Implements the NaCl-style `box` and `secretbox` operations the protocol
//! relies on: X25519 key agreement, a BLAKE2s-256 derivation of the shared
//! key, and XChaCha20-Poly1305 with the 24-byte signaling nonce.

use blake2::{Blake2s256, Digest};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// Public and secret key length
pub const KEY_LEN: usize = 32;

/// Symmetric key length (auth token, derived shared keys)
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Nonce length on the signaling channel
pub const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// Generate a new X25519 keypair
///
/// Returns (secret_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key from a secret key
pub fn public_key(secret_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*secret_key);
    PublicKey::from(&secret).to_bytes()
}

/// Precompute the symmetric key for a (secret key, public key) pair
///
/// X25519 followed by BLAKE2s-256 over the raw shared point. Both sides of
/// a box derive the same key, so the result can be cached per peer.
pub fn shared_key(secret_key: &[u8; KEY_LEN], peer_public: &[u8; KEY_LEN]) -> [u8; SYMMETRIC_KEY_LEN] {
    let secret = StaticSecret::from(*secret_key);
    let public = PublicKey::from(*peer_public);
    let point = secret.diffie_hellman(&public);

    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, point.as_bytes());
    hasher.finalize().into()
}

/// Encrypt with a 32-byte symmetric key and a 24-byte nonce (`secretbox`)
///
/// Deterministic in (key, nonce, plaintext).
pub fn secretbox_encrypt(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate a `secretbox` ciphertext
pub fn secretbox_decrypt(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// Public-key authenticated encryption (`box`)
pub fn box_encrypt(
    our_secret: &[u8; KEY_LEN],
    peer_public: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = shared_key(our_secret, peer_public);
    secretbox_encrypt(&key, nonce, plaintext)
}

/// Inverse of [`box_encrypt`]
pub fn box_decrypt(
    our_secret: &[u8; KEY_LEN],
    peer_public: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let key = shared_key(our_secret, peer_public);
    secretbox_decrypt(&key, nonce, ciphertext)
}
