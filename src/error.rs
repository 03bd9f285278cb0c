//! Error types for the saltlink signaling client

use thiserror::Error;

/// WebSocket close codes used by the signaling protocol.
///
/// Codes below 3000 are standard WebSocket codes, codes from 3000 onwards
/// are defined by the SaltyRTC protocol.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    ClosingNormal = 1000,
    GoingAway = 1001,
    SubprotocolError = 1002,
    Abnormal = 1006,
    PathFull = 3000,
    ProtocolError = 3001,
    InternalError = 3002,
    Handover = 3003,
    DroppedByInitiator = 3004,
    InitiatorCouldNotDecrypt = 3005,
    NoSharedTask = 3006,
}

impl CloseCode {
    /// Numeric value as sent on the wire.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this code may appear as the `reason` of a c2c `close` message.
    pub fn is_valid_close_reason(code: u16) -> bool {
        CloseCode::try_from(code)
            .map(|c| c.as_u16() >= 3000 && c != CloseCode::PathFull)
            .unwrap_or(false)
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            1000 => Ok(Self::ClosingNormal),
            1001 => Ok(Self::GoingAway),
            1002 => Ok(Self::SubprotocolError),
            1006 => Ok(Self::Abnormal),
            3000 => Ok(Self::PathFull),
            3001 => Ok(Self::ProtocolError),
            3002 => Ok(Self::InternalError),
            3003 => Ok(Self::Handover),
            3004 => Ok(Self::DroppedByInitiator),
            3005 => Ok(Self::InitiatorCouldNotDecrypt),
            3006 => Ok(Self::NoSharedTask),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::ClosingNormal => "closing normal",
            Self::GoingAway => "going away",
            Self::SubprotocolError => "no shared subprotocol",
            Self::Abnormal => "abnormal closure",
            Self::PathFull => "path full",
            Self::ProtocolError => "protocol error",
            Self::InternalError => "internal error",
            Self::Handover => "handover of the signaling channel",
            Self::DroppedByInitiator => "dropped by initiator",
            Self::InitiatorCouldNotDecrypt => "initiator could not decrypt",
            Self::NoSharedTask => "no shared task found",
        };
        write!(f, "{} ({})", text, self.as_u16())
    }
}

/// Main error type for saltlink
#[derive(Error, Debug)]
pub enum SaltlinkError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message content validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Message codec errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Transport errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Local state invariant violations
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

/// Configuration errors, raised at construction time
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot specify both a trusted key and a public key / auth token pair")]
    TrustedKeyConflict,

    #[error("Either a trusted key or a public key / auth token pair must be specified")]
    MissingInitiatorKnowledge,

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Could not decrypt first peer handshake message")]
    InitialHandshakeDecryption,
}

/// Protocol-level errors: state machine or framing contract violations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Received {got} message in {state} state")]
    UnexpectedMessage { state: &'static str, got: String },

    #[error("Bad nonce source: {source_addr:#04x}")]
    BadSource { source_addr: u8 },

    #[error("Bad nonce destination: {destination:#04x}")]
    BadDestination { destination: u8 },

    #[error("Cannot assign address {address:#04x} to a client with role {role}")]
    BadAddressAssignment { address: u8, role: &'static str },

    #[error("CSN of peer {peer:#04x} has not increased")]
    CsnRegression { peer: u8 },

    #[error("First message from peer {peer:#04x} must carry overflow number 0")]
    NonZeroInitialOverflow { peer: u8 },

    #[error("Cookie from peer {peer:#04x} is identical to our own cookie")]
    CookieIdentical { peer: u8 },

    #[error("Cookie from peer {peer:#04x} has changed")]
    CookieChanged { peer: u8 },

    #[error("Repeated cookie does not match our own cookie")]
    RepeatedCookieMismatch,

    #[error("Received text frame on the signaling channel")]
    TextFrame,

    #[error("Bad receiver byte: {receiver:#04x}")]
    BadReceiver { receiver: u8 },

    #[error("Unknown peer: {address:#04x}")]
    UnknownPeer { address: u8 },

    #[error("Verification of signed_keys failed")]
    SignedKeysMismatch,

    #[error("No shared task could be negotiated")]
    NoSharedTask,

    #[error("Peer selected a task we did not offer: {task}")]
    UnknownTask { task: String },

    #[error("Auth message carries the wrong task negotiation fields for our role")]
    MisdirectedAuth,

    #[error("send-error id does not reference a peer of ours: {id:#04x}")]
    SendErrorMismatch { id: u8 },
}

/// Malformed message content
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{field} must be {expected} bytes, got {got}")]
    ByteLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{field} must be in range {min:#04x}..={max:#04x}, got {got:#04x}")]
    AddressRange {
        field: &'static str,
        min: u8,
        max: u8,
        got: u8,
    },

    #[error("{field} contains duplicate entries")]
    Duplicates { field: &'static str },

    #[error("Auth message must carry either a task or a tasks field")]
    MissingTaskField,

    #[error("Auth message may not carry both a task and a tasks field")]
    AmbiguousTaskField,

    #[error("Task data is missing an entry for task {task}")]
    MissingTaskData { task: String },

    #[error("Invalid close reason: {reason}")]
    InvalidCloseReason { reason: u16 },
}

/// Codec failures
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Deserialization failed: {0}")]
    Decode(String),

    #[error("Serialization failed: {0}")]
    Encode(String),

    #[error("Message is not a map")]
    NotAMap,

    #[error("Message does not contain a type field")]
    MissingType,

    #[error("Message type must be a string")]
    TypeNotString,

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

/// Transport-level failures
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Could not connect to server: {0}")]
    Connect(String),

    #[error("Connection attempt timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Connect attempts exhausted after {attempts} tries")]
    AttemptsExhausted { attempts: u32 },

    #[error("WebSocket send failed: {0}")]
    Send(String),

    #[error("Signaling channel is not open")]
    NotOpen,
}

/// Invariant violations in local state
#[derive(Error, Debug)]
pub enum InternalError {
    #[error("Combined sequence number space exhausted")]
    SequenceExhausted,

    #[error("Session key missing")]
    MissingSessionKey,

    #[error("Local session key already set")]
    SessionKeyAlreadySet,

    #[error("No free responder address on this path")]
    PathFull,

    #[error("State invariant violated: {0}")]
    Invariant(&'static str),
}

impl SaltlinkError {
    /// Map an error to the close code `reset_connection` must use.
    ///
    /// Connection errors are never translated to a close code; they surface
    /// to the application and move the signaling state to `Error`.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Protocol(ProtocolError::NoSharedTask) => CloseCode::NoSharedTask,
            Self::Crypto(CryptoError::InitialHandshakeDecryption) => {
                CloseCode::InitiatorCouldNotDecrypt
            }
            Self::Internal(InternalError::PathFull) => CloseCode::PathFull,
            Self::Internal(_) => CloseCode::InternalError,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Result type alias for saltlink operations
pub type Result<T> = std::result::Result<T, SaltlinkError>;
