//! Cryptographic building blocks for the signaling protocol
//!
//! - NaCl-style box / secretbox primitives (cipher)
//! - Keypair, shared-key and auth-token containers (keystore)

pub mod cipher;
pub mod keystore;

pub use cipher::{KEY_LEN, NONCE_LEN, SYMMETRIC_KEY_LEN, TAG_LEN};
pub use keystore::{AuthToken, KeyStore, SharedKeyStore};
