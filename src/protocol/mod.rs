//! The SaltyRTC signaling protocol core
//!
//! This module contains the transport-independent protocol logic:
//! - Nonce layout and addressing (nonce)
//! - Combined sequence numbers (csn)
//! - Cookies (cookie)
//! - The typed message catalog and MessagePack codec (messages)
//! - Frame forms (boxes)
//! - Per-peer records (peers)
//! - The state machine shared by both roles (signaling) and the
//!   role-specific peer handshakes (initiator, responder)

pub mod boxes;
pub mod cookie;
pub mod csn;
mod initiator;
pub mod messages;
pub mod nonce;
pub mod peers;
pub mod signaling;
pub mod state;
mod responder;

pub use boxes::{ByteBox, OpenBox};
pub use cookie::{Cookie, CookiePair, COOKIE_LEN};
pub use csn::{CombinedSequence, CombinedSequenceSnapshot, CsnPair};
pub use messages::{Message, TaskMessage};
pub use nonce::{Address, Nonce, ADDR_INITIATOR, ADDR_SERVER, NONCE_LEN};
pub use signaling::{ClientIdentity, HandleAction, Signaling};
pub use state::{
    InitiatorHandshakeState, ResponderHandshakeState, Role, ServerHandshakeState,
    SignalingChannel, SignalingState,
};
