//! saltlink - SaltyRTC signaling client
//!
//! An end-to-end encrypted signaling client used to bootstrap peer-to-peer
//! sessions (typically WebRTC) between an *initiator* and a *responder*
//! through an untrusted relay server.
//!
//! # Features
//!
//! - Both signaling roles (initiator and responder)
//! - Chained server and peer handshakes over a single WebSocket
//! - Three key contexts (permanent, session, auth token) with NaCl-style
//!   authenticated encryption
//! - Cookie, nonce and combined-sequence-number replay protection
//! - Task negotiation; the selected task takes over the encrypted channel
//! - Trusted-key mode that skips the token exchange on reconnects
//! - Optional server key pinning with signed-keys verification
//!
//! # Usage (responder)
//!
//! ```no_run
//! use saltlink::{
//!     ConnectionSettings, KeyStore, AuthToken, ResponderConfig, Signaling, SignalingClient,
//! };
//!
//! # fn tasks() -> Vec<Box<dyn saltlink::Task>> { vec![] }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let initiator_key = [0u8; 32]; // received out-of-band
//!     let auth_token = AuthToken::from_bytes(&[0u8; 32])?;
//!
//!     let config = ResponderConfig::new(KeyStore::new())
//!         .with_initiator_key(initiator_key, auth_token);
//!     let signaling = Signaling::new_responder(config, tasks())?;
//!
//!     let settings = ConnectionSettings::new("server.example.org", 8765);
//!     let mut client = SignalingClient::new(signaling, settings);
//!     client.connect().await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod protocol;
pub mod task;

/// The WebSocket subprotocol spoken by this crate
pub const SUBPROTOCOL: &str = "saltyrtc-1.0";

pub use client::SignalingClient;
pub use config::{ConnectionSettings, InitiatorConfig, ResponderConfig};
pub use crypto::{AuthToken, KeyStore};
pub use error::{CloseCode, SaltlinkError};
pub use events::{Event, EventKind, EventRegistry};
pub use protocol::{Signaling, SignalingChannel, SignalingState, TaskMessage};
pub use task::{SignalingHandle, Task};
