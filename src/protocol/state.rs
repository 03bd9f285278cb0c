//! Connection and handshake state enums

/// Global signaling connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    New,
    WsConnecting,
    ServerHandshake,
    PeerHandshake,
    Task,
    Closing,
    Closed,
    Error,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::WsConnecting => "ws-connecting",
            Self::ServerHandshake => "server-handshake",
            Self::PeerHandshake => "peer-handshake",
            Self::Task => "task",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// The channel currently carrying signaling messages
///
/// Starts on the WebSocket; a completed handover moves it to a task-provided
/// data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingChannel {
    WebSocket,
    DataChannel,
}

impl std::fmt::Display for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::DataChannel => f.write_str("data-channel"),
        }
    }
}

/// Server handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHandshakeState {
    /// Nothing received yet, expecting cleartext `server-hello`
    New,
    /// `client-hello` sent (responder only)
    HelloSent,
    /// `client-auth` sent, expecting `server-auth`
    AuthSent,
    Done,
}

/// Handshake progress of the initiator, as tracked by a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorHandshakeState {
    New,
    TokenSent,
    KeySent,
    KeyReceived,
    AuthSent,
    AuthReceived,
}

/// Handshake progress of a responder, as tracked by the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderHandshakeState {
    /// Expecting `token` (skipped for a trusted responder)
    New,
    /// Permanent key known, expecting `key`
    TokenReceived,
    /// Session keys exchanged, expecting `auth`
    KeyReceived,
    AuthReceived,
}

/// The two protocol roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
