//! The signaling state machine
//!
//! All state transitions happen here and in the role-specific modules.
//! Instead of executing side effects directly (like writing to the
//! WebSocket), every entry point returns a list of [`HandleAction`]s for
//! the transport glue to execute. This keeps the protocol logic free of
//! network code and directly testable.
//!
//! Errors raised while handling an inbound frame never propagate to the
//! transport callback; they are translated into a connection reset with the
//! close code the error maps to.

use std::collections::HashMap;

use rmpv::Value;
use tracing::{debug, error, info, warn};

use crate::crypto::{AuthToken, KeyStore, SharedKeyStore, KEY_LEN};
use crate::error::{CloseCode, ConnectionError, InternalError, ProtocolError, Result};
use crate::events::Event;
use crate::protocol::boxes::ByteBox;
use crate::protocol::cookie::Cookie;
use crate::protocol::messages::{self, ClientAuth, ClientHello, Message, TaskMessage};
use crate::protocol::nonce::{Address, Nonce, ADDR_INITIATOR, ADDR_SERVER};
use crate::protocol::peers::{InitiatorContext, Peer, ResponderContext, ServerContext};
use crate::protocol::state::{
    InitiatorHandshakeState, Role, ServerHandshakeState, SignalingChannel, SignalingState,
};
use crate::task::Task;

/// A side effect produced by the state machine
#[derive(Debug)]
pub enum HandleAction {
    /// Send this frame on the signaling channel
    Reply(ByteBox),
    /// Close the transport with the given code
    Close(CloseCode),
    /// Surface this event to the application
    Event(Event),
    /// The peer handshake completed and the task took over the channel
    HandshakeDone,
}

/// The client's assigned identity on the signaling path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdentity {
    Unknown,
    Initiator,
    Responder(u8),
}

impl ClientIdentity {
    pub fn address(self) -> Address {
        match self {
            Self::Unknown => Address(0x00),
            Self::Initiator => ADDR_INITIATOR,
            Self::Responder(address) => Address(address),
        }
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Initiator => f.write_str("initiator"),
            Self::Responder(address) => write!(f, "responder {:#04x}", address),
        }
    }
}

/// Role-specific signaling data
pub(crate) enum RoleState {
    Initiator(InitiatorRole),
    Responder(ResponderRole),
}

pub(crate) struct InitiatorRole {
    /// Responders in their peer handshake, keyed by address
    pub responders: HashMap<Address, ResponderContext>,
    /// The responder that completed the peer handshake
    pub peer: Option<ResponderContext>,
    /// Token handed out out-of-band; `None` when a trusted key is used
    pub auth_token: Option<AuthToken>,
    pub trusted_responder_key: Option<[u8; KEY_LEN]>,
}

pub(crate) struct ResponderRole {
    pub initiator: InitiatorContext,
    /// Token for the one-use `token` message; `None` when trusted
    pub auth_token: Option<AuthToken>,
}

/// Outcome of the per-frame nonce validation
enum NonceCheck {
    Ok,
    /// Drop the frame with a warning, without failing the connection
    Drop(&'static str),
}

enum EnvelopeKey {
    Shared(SharedKeyStore),
    Token(AuthToken),
}

/// The signaling state machine, shared by both roles
pub struct Signaling {
    pub(crate) role: RoleState,
    pub(crate) identity: ClientIdentity,
    pub(crate) state: SignalingState,
    pub(crate) channel: SignalingChannel,
    pub(crate) permanent_key: KeyStore,
    pub(crate) server: ServerContext,
    pub(crate) expected_server_key: Option<[u8; KEY_LEN]>,
    pub(crate) ping_interval: u32,
    /// Task candidates advertised during the peer handshake
    pub(crate) tasks: Vec<Box<dyn Task>>,
    /// The selected task, once negotiation is done
    pub(crate) task: Option<Box<dyn Task>>,
    pub(crate) actions: Vec<HandleAction>,
}

impl Signaling {
    pub(crate) fn new(
        role: RoleState,
        permanent_key: KeyStore,
        tasks: Vec<Box<dyn Task>>,
        expected_server_key: Option<[u8; KEY_LEN]>,
        ping_interval: u32,
    ) -> Self {
        Self {
            role,
            identity: ClientIdentity::Unknown,
            state: SignalingState::New,
            channel: SignalingChannel::WebSocket,
            permanent_key,
            server: ServerContext::new(),
            expected_server_key,
            ping_interval,
            tasks,
            task: None,
            actions: Vec::new(),
        }
    }

    /// Create an initiator signaling instance.
    ///
    /// Unless a responder key is pinned, a fresh auth token is generated; it
    /// must reach the responder out-of-band (see [`Signaling::auth_token`]).
    pub fn new_initiator(config: crate::config::InitiatorConfig, tasks: Vec<Box<dyn Task>>) -> Self {
        let auth_token = match config.responder_trusted_key {
            Some(_) => None,
            None => Some(AuthToken::new()),
        };
        Self::new(
            RoleState::Initiator(InitiatorRole {
                responders: HashMap::new(),
                peer: None,
                auth_token,
                trusted_responder_key: config.responder_trusted_key,
            }),
            config.permanent_key,
            tasks,
            config.expected_server_key,
            config.ping_interval,
        )
    }

    /// Create a responder signaling instance.
    ///
    /// Requires either a trusted initiator key or the initiator public key
    /// together with the out-of-band auth token; both at once or neither is
    /// a configuration error.
    pub fn new_responder(
        config: crate::config::ResponderConfig,
        tasks: Vec<Box<dyn Task>>,
    ) -> std::result::Result<Self, crate::error::ConfigError> {
        use crate::error::ConfigError;

        let (initiator, auth_token) = match (
            config.initiator_trusted_key,
            config.initiator_public_key,
            config.auth_token,
        ) {
            (Some(trusted), None, None) => {
                let mut context = InitiatorContext::new(trusted, &config.permanent_key);
                context.handshake_state = InitiatorHandshakeState::TokenSent;
                (context, None)
            }
            (Some(_), _, _) => return Err(ConfigError::TrustedKeyConflict),
            (None, Some(public_key), Some(token)) => (
                InitiatorContext::new(public_key, &config.permanent_key),
                Some(token),
            ),
            (None, _, _) => return Err(ConfigError::MissingInitiatorKnowledge),
        };

        Ok(Self::new(
            RoleState::Responder(ResponderRole {
                initiator,
                auth_token,
            }),
            config.permanent_key,
            tasks,
            config.expected_server_key,
            config.ping_interval,
        ))
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleState::Initiator(_) => Role::Initiator,
            RoleState::Responder(_) => Role::Responder,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn channel(&self) -> SignalingChannel {
        self.channel
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    pub fn server_handshake_state(&self) -> ServerHandshakeState {
        self.server.handshake_state()
    }

    pub fn permanent_public_key(&self) -> &[u8; KEY_LEN] {
        self.permanent_key.public_key()
    }

    /// The auth token to hand to the peer out-of-band (initiator, untrusted)
    pub fn auth_token(&self) -> Option<&AuthToken> {
        match &self.role {
            RoleState::Initiator(role) => role.auth_token.as_ref(),
            RoleState::Responder(role) => role.auth_token.as_ref(),
        }
    }

    /// The selected task, available once the peer handshake is done
    pub fn task(&self) -> Option<&dyn Task> {
        self.task.as_deref()
    }

    pub fn task_mut(&mut self) -> Option<&mut Box<dyn Task>> {
        self.task.as_mut()
    }

    /// The WebSocket path for this connection: hex of the initiator's
    /// permanent public key
    pub fn websocket_path(&self) -> String {
        match &self.role {
            RoleState::Initiator(_) => hex::encode(self.permanent_key.public_key()),
            RoleState::Responder(role) => hex::encode(role.initiator.permanent_public_key()),
        }
    }

    /// The peer's address, once the peer handshake completed
    pub fn peer_address(&self) -> Option<Address> {
        match &self.role {
            RoleState::Initiator(role) => role.peer.as_ref().map(|peer| peer.address()),
            RoleState::Responder(role) => {
                if role.initiator.handshake_state == InitiatorHandshakeState::AuthReceived {
                    Some(ADDR_INITIATOR)
                } else {
                    None
                }
            }
        }
    }

    fn peer_session_shared(&self) -> Option<&SharedKeyStore> {
        match &self.role {
            RoleState::Initiator(role) => role.peer.as_ref().and_then(|peer| peer.session_shared()),
            RoleState::Responder(role) => role.initiator.session_shared(),
        }
    }

    // Transport lifecycle ---------------------------------------------------

    /// The transport started connecting
    pub fn on_connecting(&mut self) -> Vec<HandleAction> {
        self.set_state(SignalingState::WsConnecting);
        std::mem::take(&mut self.actions)
    }

    /// The transport is open; the server speaks first
    pub fn on_transport_open(&mut self) -> Vec<HandleAction> {
        self.set_state(SignalingState::ServerHandshake);
        std::mem::take(&mut self.actions)
    }

    /// A binary frame arrived on the transport
    pub fn handle_binary(&mut self, frame: &[u8]) -> Vec<HandleAction> {
        if let Err(e) = self.process_frame(frame) {
            error!("Signaling failure: {}", e);
            // Partially built replies must not reach the wire
            self.actions.clear();
            self.reset_connection(e.close_code());
        }
        std::mem::take(&mut self.actions)
    }

    /// A text frame arrived; only binary frames are valid
    pub fn handle_text_frame(&mut self) -> Vec<HandleAction> {
        error!("{}", ProtocolError::TextFrame);
        self.reset_connection(CloseCode::ProtocolError);
        std::mem::take(&mut self.actions)
    }

    /// The transport closed with the given close code
    pub fn handle_transport_close(&mut self, code: Option<u16>) -> Vec<HandleAction> {
        let close_code = code.and_then(|c| CloseCode::try_from(c).ok());

        if close_code == Some(CloseCode::Handover) && self.channel == SignalingChannel::DataChannel
        {
            // The WebSocket leg ends here, signaling continues on the
            // task's channel; the connection is still in the task state.
            info!("WebSocket closed for handover");
            return std::mem::take(&mut self.actions);
        }

        match close_code {
            Some(CloseCode::ClosingNormal) => info!("WebSocket closed"),
            Some(CloseCode::GoingAway) => error!("Server is being shut down"),
            Some(CloseCode::SubprotocolError) => error!("No shared sub-protocol could be found"),
            Some(CloseCode::PathFull) => error!("Path full (no free responder byte)"),
            Some(CloseCode::ProtocolError) => error!("Closed due to a protocol error"),
            Some(CloseCode::InternalError) => error!("Internal server error"),
            Some(CloseCode::DroppedByInitiator) => warn!("Dropped by initiator"),
            Some(other) => warn!("WebSocket closed with code {}", other),
            None => warn!("WebSocket closed without a close code"),
        }

        if self.state != SignalingState::Closed {
            self.set_state(SignalingState::Closed);
        }
        self.actions.push(HandleAction::Event(Event::Closed(close_code)));
        std::mem::take(&mut self.actions)
    }

    /// The transport could not be established
    pub fn on_connect_error(&mut self) -> Vec<HandleAction> {
        self.set_state(SignalingState::Error);
        std::mem::take(&mut self.actions)
    }

    /// Application-initiated disconnect
    pub fn disconnect(&mut self) -> Vec<HandleAction> {
        self.close_with(CloseCode::ClosingNormal)
    }

    /// Close the transport with an explicit close code
    pub fn close_with(&mut self, code: CloseCode) -> Vec<HandleAction> {
        self.set_state(SignalingState::Closing);
        self.actions.push(HandleAction::Close(code));
        std::mem::take(&mut self.actions)
    }

    /// The task's channel is up; close the WebSocket leg with the handover
    /// code. The signaling state stays in the task state.
    pub fn initiate_handover(&mut self) -> Result<Vec<HandleAction>> {
        if self.state != SignalingState::Task {
            return Err(ConnectionError::NotOpen.into());
        }
        self.set_channel(SignalingChannel::DataChannel);
        self.actions.push(HandleAction::Close(CloseCode::Handover));
        Ok(std::mem::take(&mut self.actions))
    }

    /// Reset the connection: close the transport, notify the task, clear
    /// all per-connection state.
    pub fn reset_connection(&mut self, code: CloseCode) {
        self.set_state(SignalingState::Closing);
        self.actions.push(HandleAction::Close(code));

        if let Some(task) = self.task.as_mut() {
            task.close(code);
        }

        self.server = ServerContext::new();
        self.identity = ClientIdentity::Unknown;
        match &mut self.role {
            RoleState::Initiator(role) => {
                role.responders.clear();
                role.peer = None;
            }
            RoleState::Responder(role) => {
                let initiator_key = *role.initiator.permanent_public_key();
                role.initiator = InitiatorContext::new(initiator_key, &self.permanent_key);
                if role.auth_token.is_none() {
                    role.initiator.handshake_state = InitiatorHandshakeState::TokenSent;
                }
            }
        }

        self.set_state(SignalingState::Closed);
        debug!("Connection reset (close code {})", code);
    }

    // Outbound application traffic ------------------------------------------

    /// Encrypt a task message for the peer
    pub fn encode_task_message(&mut self, message: &TaskMessage) -> Result<ByteBox> {
        if self.state != SignalingState::Task {
            return Err(ConnectionError::NotOpen.into());
        }
        let receiver = self
            .peer_address()
            .ok_or(InternalError::Invariant("no peer established"))?;
        let payload = message.to_bytes()?;
        self.build_packet_raw(&payload, &message.message_type, receiver, true)
    }

    /// Encrypt an `application` message for the peer
    pub fn encode_application(&mut self, data: Value) -> Result<ByteBox> {
        if self.state != SignalingState::Task {
            return Err(ConnectionError::NotOpen.into());
        }
        let receiver = self
            .peer_address()
            .ok_or(InternalError::Invariant("no peer established"))?;
        self.build_packet(Message::Application(messages::Application { data }), receiver, true)
    }

    // Frame processing ------------------------------------------------------

    fn process_frame(&mut self, frame: &[u8]) -> Result<()> {
        let bbox = ByteBox::from_slice(frame)?;
        debug!(
            "Received frame ({} bytes) from {}",
            frame.len(),
            bbox.nonce.source()
        );

        match self.validate_nonce(&bbox.nonce)? {
            NonceCheck::Drop(reason) => {
                warn!("Dropping frame: {}", reason);
                return Ok(());
            }
            NonceCheck::Ok => {}
        }

        match self.state {
            SignalingState::ServerHandshake => self.on_server_handshake_message(bbox),
            SignalingState::PeerHandshake => match &self.role {
                RoleState::Initiator(_) => self.initiator_on_peer_handshake_message(bbox),
                RoleState::Responder(_) => self.responder_on_peer_handshake_message(bbox),
            },
            SignalingState::Task => self.on_task_state_message(bbox),
            other => {
                warn!("Received message in {} state, ignoring", other);
                Ok(())
            }
        }
    }

    /// Validate addressing, CSN advance and cookie consistency of an
    /// inbound nonce. Runs for every frame, in every phase.
    fn validate_nonce(&mut self, nonce: &Nonce) -> Result<NonceCheck> {
        // Destination must target our assigned identity. The first message
        // carrying a non-zero destination after the handshake started
        // assigns our address; it must fit our role.
        let destination = nonce.destination();
        if self.identity == ClientIdentity::Unknown
            && !destination.is_unknown()
            && self.server.handshake_state() != ServerHandshakeState::New
        {
            match self.role() {
                Role::Initiator if destination.is_initiator() => {
                    self.identity = ClientIdentity::Initiator;
                    debug!("Assigned identity: {}", self.identity);
                }
                Role::Responder if destination.is_responder() => {
                    self.identity = ClientIdentity::Responder(destination.0);
                    debug!("Assigned identity: {}", self.identity);
                }
                role => {
                    return Err(ProtocolError::BadAddressAssignment {
                        address: destination.0,
                        role: role.name(),
                    }
                    .into())
                }
            }
        }
        if destination != self.identity.address() {
            return Err(ProtocolError::BadDestination {
                destination: destination.0,
            }
            .into());
        }

        // Source must be plausible for our role. Frames from the wrong
        // class of sender are dropped with a warning, not fatal.
        let source = nonce.source();
        if source.is_initiator() && !matches!(self.identity, ClientIdentity::Responder(_)) {
            return Ok(NonceCheck::Drop("initiator frame, but we are not a responder"));
        }
        if source.is_responder() && self.identity != ClientIdentity::Initiator {
            return Ok(NonceCheck::Drop("responder frame, but we are not the initiator"));
        }

        let peer = self
            .peer_mut(source)
            .ok_or(ProtocolError::UnknownPeer { address: source.0 })?;

        // CSN: the first message from a peer must carry overflow 0; every
        // later message must advance the 48-bit value strictly.
        let current = nonce.csn();
        let csn_pair = peer.csn_pair_mut();
        match &mut csn_pair.theirs {
            Some(last) => {
                if current <= *last {
                    return Err(ProtocolError::CsnRegression { peer: source.0 }.into());
                }
                *last = current;
            }
            None => {
                if current.overflow_number() != 0 {
                    return Err(ProtocolError::NonZeroInitialOverflow { peer: source.0 }.into());
                }
                csn_pair.theirs = Some(current);
            }
        }

        // Cookie: pinned by the peer's first message, immutable afterwards,
        // never equal to ours.
        let cookie_pair = peer.cookie_pair_mut();
        match &cookie_pair.theirs {
            Some(cookie) => {
                if nonce.cookie() != cookie {
                    return Err(ProtocolError::CookieChanged { peer: source.0 }.into());
                }
            }
            None => {
                if *nonce.cookie() == cookie_pair.ours {
                    return Err(ProtocolError::CookieIdentical { peer: source.0 }.into());
                }
                cookie_pair.theirs = Some(nonce.cookie().clone());
            }
        }

        Ok(NonceCheck::Ok)
    }

    fn peer_mut(&mut self, address: Address) -> Option<&mut dyn Peer> {
        if address.is_server() {
            return Some(&mut self.server);
        }
        match &mut self.role {
            RoleState::Responder(role) if address.is_initiator() => Some(&mut role.initiator),
            RoleState::Initiator(role) if address.is_responder() => {
                if role.peer.as_ref().map(|peer| peer.address()) == Some(address) {
                    role.peer.as_mut().map(|peer| peer as &mut dyn Peer)
                } else {
                    role.responders
                        .get_mut(&address)
                        .map(|responder| responder as &mut dyn Peer)
                }
            }
            _ => None,
        }
    }

    pub(crate) fn server_shared(&self) -> Result<&SharedKeyStore> {
        self.server
            .shared_key()
            .ok_or_else(|| InternalError::MissingSessionKey.into())
    }

    // Server handshake ------------------------------------------------------

    fn on_server_handshake_message(&mut self, bbox: ByteBox) -> Result<()> {
        // The server-hello is the only cleartext inbound frame
        let obox = match self.server.handshake_state() {
            ServerHandshakeState::New => bbox.decode()?,
            _ => {
                let shared = self.server_shared()?.clone();
                bbox.decrypt(&shared)?
            }
        };

        match (self.server.handshake_state(), obox.message) {
            (ServerHandshakeState::New, Message::ServerHello(msg)) => {
                debug!("Received server-hello");
                self.handle_server_hello(msg)?;
                self.send_client_hello()?;
                self.send_client_auth()?;
            }
            (ServerHandshakeState::AuthSent, Message::ServerAuth(msg)) => {
                debug!("Received server-auth");
                self.handle_server_auth(msg, &obox.nonce)?;
            }
            (state, message) => {
                return Err(ProtocolError::UnexpectedMessage {
                    state: match state {
                        ServerHandshakeState::New => "server-handshake (new)",
                        ServerHandshakeState::HelloSent => "server-handshake (hello-sent)",
                        ServerHandshakeState::AuthSent => "server-handshake (auth-sent)",
                        ServerHandshakeState::Done => "server-handshake (done)",
                    },
                    got: message.message_type().to_owned(),
                }
                .into())
            }
        }

        if self.server.handshake_state() == ServerHandshakeState::Done {
            info!("Server handshake completed");
            self.set_state(SignalingState::PeerHandshake);
            self.init_peer_handshake()?;
        }
        Ok(())
    }

    fn handle_server_hello(&mut self, msg: messages::ServerHello) -> Result<()> {
        let key = messages::key_array("key", &msg.key)?;
        self.server.set_session_key(key)?;
        let shared = self.permanent_key.shared_with(&key);
        self.server.set_shared_key(shared);
        Ok(())
    }

    /// Responders announce their permanent key in cleartext; initiators
    /// skip this step.
    fn send_client_hello(&mut self) -> Result<()> {
        if let RoleState::Initiator(_) = self.role {
            return Ok(());
        }
        let msg = Message::ClientHello(ClientHello {
            key: self.permanent_key.public_key().to_vec().into(),
        });
        self.send_message(msg, ADDR_SERVER, false)?;
        self.server.set_handshake_state(ServerHandshakeState::HelloSent);
        Ok(())
    }

    fn send_client_auth(&mut self) -> Result<()> {
        let their_cookie = self
            .server
            .cookie_pair()
            .theirs
            .clone()
            .ok_or(InternalError::Invariant("server cookie not yet known"))?;
        let msg = Message::ClientAuth(ClientAuth {
            your_cookie: their_cookie.as_bytes().to_vec().into(),
            subprotocols: Some(vec![crate::SUBPROTOCOL.to_owned()]),
            ping_interval: Some(self.ping_interval),
            your_key: self.expected_server_key.map(|key| key.to_vec().into()),
        });
        self.send_message(msg, ADDR_SERVER, true)?;
        self.server.set_handshake_state(ServerHandshakeState::AuthSent);
        Ok(())
    }

    fn handle_server_auth(&mut self, msg: messages::ServerAuth, nonce: &Nonce) -> Result<()> {
        // The nonce destination assigned our address during validation
        if self.identity == ClientIdentity::Unknown {
            return Err(InternalError::Invariant("no identity assigned").into());
        }

        // The repeated cookie must be the one we sent to the server
        let repeated = Cookie::from_bytes(&msg.your_cookie)?;
        if repeated != self.server.cookie_pair().ours {
            return Err(ProtocolError::RepeatedCookieMismatch.into());
        }

        // Verify the signed keys iff a server key is pinned
        match (&self.expected_server_key, &msg.signed_keys) {
            (Some(expected), Some(signed_keys)) => {
                self.validate_signed_keys(signed_keys, nonce, expected)?;
                debug!("Verified signed keys");
            }
            (Some(_), None) => return Err(ProtocolError::SignedKeysMismatch.into()),
            (None, Some(_)) => {
                warn!("Server sent signed keys, but no server key is pinned");
            }
            (None, None) => {}
        }

        match &mut self.role {
            RoleState::Initiator(role) => {
                if msg.initiator_connected.is_some() {
                    return Err(ProtocolError::UnexpectedMessage {
                        state: "server-handshake (auth-sent)",
                        got: "server-auth with initiator_connected".to_owned(),
                    }
                    .into());
                }
                let responders = msg.responders.ok_or(ProtocolError::UnexpectedMessage {
                    state: "server-handshake (auth-sent)",
                    got: "server-auth without responders".to_owned(),
                })?;
                for id in responders {
                    let address = Address(id);
                    let context = match role.trusted_responder_key {
                        Some(trusted) => {
                            ResponderContext::new_trusted(address, trusted, &self.permanent_key)
                        }
                        None => ResponderContext::new(address),
                    };
                    role.responders.insert(address, context);
                }
                debug!("Known responders: {}", role.responders.len());
            }
            RoleState::Responder(role) => {
                if msg.responders.is_some() {
                    return Err(ProtocolError::UnexpectedMessage {
                        state: "server-handshake (auth-sent)",
                        got: "server-auth with responders".to_owned(),
                    }
                    .into());
                }
                let connected =
                    msg.initiator_connected
                        .ok_or(ProtocolError::UnexpectedMessage {
                            state: "server-handshake (auth-sent)",
                            got: "server-auth without initiator_connected".to_owned(),
                        })?;
                role.initiator.connected = connected;
                debug!(
                    "Initiator is {}connected",
                    if connected { "" } else { "not " }
                );
            }
        }

        self.server.set_handshake_state(ServerHandshakeState::Done);
        Ok(())
    }

    /// Decrypt `signed_keys` with the pinned server key and the message
    /// nonce; the plaintext must be our view of both public keys.
    fn validate_signed_keys(
        &self,
        signed_keys: &[u8],
        nonce: &Nonce,
        expected_server_key: &[u8; KEY_LEN],
    ) -> Result<()> {
        let decrypted = self
            .permanent_key
            .decrypt(signed_keys, &nonce.to_bytes(), expected_server_key)
            .map_err(|_| ProtocolError::SignedKeysMismatch)?;

        let session_key = self
            .server
            .session_key()
            .ok_or(InternalError::MissingSessionKey)?;
        let mut expected = Vec::with_capacity(2 * KEY_LEN);
        expected.extend_from_slice(session_key);
        expected.extend_from_slice(self.permanent_key.public_key());

        if decrypted != expected {
            return Err(ProtocolError::SignedKeysMismatch.into());
        }
        Ok(())
    }

    pub(crate) fn init_peer_handshake(&mut self) -> Result<()> {
        let responder_plan = match &self.role {
            RoleState::Initiator(_) => {
                debug!("Waiting for responders to start their handshakes");
                None
            }
            RoleState::Responder(role) => {
                Some((role.initiator.connected, role.auth_token.is_none()))
            }
        };
        if let Some((initiator_connected, trusted)) = responder_plan {
            if initiator_connected {
                if !trusted {
                    self.send_token()?;
                }
                self.send_key()?;
            } else {
                debug!("No initiator connected so far");
            }
        }
        Ok(())
    }

    // Task state ------------------------------------------------------------

    fn on_task_state_message(&mut self, bbox: ByteBox) -> Result<()> {
        let source = bbox.nonce.source();
        if source.is_server() {
            let shared = self.server_shared()?.clone();
            let obox = bbox.decrypt(&shared)?;
            match &self.role {
                RoleState::Initiator(_) => self.initiator_on_server_task_message(obox),
                RoleState::Responder(_) => self.responder_on_server_task_message(obox),
            }
        } else {
            self.on_peer_task_message(bbox)
        }
    }

    /// Post-handshake traffic from the peer: session envelope, arbitrary
    /// message types routed to the task.
    fn on_peer_task_message(&mut self, bbox: ByteBox) -> Result<()> {
        let shared = self
            .peer_session_shared()
            .ok_or(InternalError::MissingSessionKey)?
            .clone();
        let payload = shared.decrypt(&bbox.bytes, &bbox.nonce.to_bytes())?;
        let value = messages::decode_value(&payload)?;
        let task_message = TaskMessage::from_value(value)?;

        match task_message.message_type.as_str() {
            "close" => {
                let message = Message::from_value(task_message.value)?;
                if let Message::Close(msg) = message {
                    info!("Peer closed the connection ({})", msg.reason);
                }
                self.reset_connection(CloseCode::GoingAway);
                Ok(())
            }
            "application" => {
                let message = Message::from_value(task_message.value)?;
                if let Message::Application(msg) = message {
                    debug!("Received application message");
                    self.actions.push(HandleAction::Event(Event::Data(msg.data)));
                }
                Ok(())
            }
            message_type => {
                let supported = self
                    .task
                    .as_ref()
                    .map(|task| {
                        task.supported_message_types()
                            .iter()
                            .any(|supported| *supported == message_type)
                    })
                    .unwrap_or(false);
                if !supported {
                    return Err(ProtocolError::UnexpectedMessage {
                        state: "task",
                        got: message_type.to_owned(),
                    }
                    .into());
                }
                debug!("Forwarding {} message to task", message_type);
                if let Some(task) = self.task.as_mut() {
                    task.on_task_message(task_message);
                }
                Ok(())
            }
        }
    }

    // Packet construction ---------------------------------------------------

    pub(crate) fn send_message(
        &mut self,
        message: Message,
        receiver: Address,
        encrypt: bool,
    ) -> Result<()> {
        debug!("Sending {}", message.message_type());
        let bbox = self.build_packet(message, receiver, encrypt)?;
        self.actions.push(HandleAction::Reply(bbox));
        Ok(())
    }

    pub(crate) fn build_packet(
        &mut self,
        message: Message,
        receiver: Address,
        encrypt: bool,
    ) -> Result<ByteBox> {
        let message_type = message.message_type();
        let payload = message.to_bytes()?;
        self.build_packet_raw(&payload, message_type, receiver, encrypt)
    }

    fn build_packet_raw(
        &mut self,
        payload: &[u8],
        message_type: &str,
        receiver: Address,
        encrypt: bool,
    ) -> Result<ByteBox> {
        let (csn, cookie) = {
            let peer = self
                .peer_mut(receiver)
                .ok_or(ProtocolError::UnknownPeer { address: receiver.0 })?;
            let csn = peer.csn_pair_mut().ours.next()?;
            (csn, peer.cookie_pair().ours.clone())
        };
        let nonce = Nonce::new(cookie, self.identity.address(), receiver, csn);

        if !encrypt {
            return Ok(ByteBox::new(nonce, payload.to_vec()));
        }

        let nonce_bytes = nonce.to_bytes();
        let ciphertext = match self.envelope_for(receiver, message_type)? {
            EnvelopeKey::Shared(key) => key.encrypt(payload, &nonce_bytes)?,
            EnvelopeKey::Token(token) => token.encrypt(payload, &nonce_bytes)?,
        };
        Ok(ByteBox::new(nonce, ciphertext))
    }

    /// Select the encryption envelope for an outbound message, based on the
    /// receiver and the message type.
    fn envelope_for(&self, receiver: Address, message_type: &str) -> Result<EnvelopeKey> {
        if receiver.is_server() {
            return Ok(EnvelopeKey::Shared(self.server_shared()?.clone()));
        }

        match &self.role {
            RoleState::Responder(role) => {
                if receiver != ADDR_INITIATOR {
                    return Err(ProtocolError::BadReceiver { receiver: receiver.0 }.into());
                }
                match message_type {
                    "token" => role
                        .auth_token
                        .clone()
                        .map(EnvelopeKey::Token)
                        .ok_or_else(|| {
                            InternalError::Invariant("token requested without auth token").into()
                        }),
                    "key" => Ok(EnvelopeKey::Shared(role.initiator.permanent_shared().clone())),
                    _ => role
                        .initiator
                        .session_shared()
                        .cloned()
                        .map(EnvelopeKey::Shared)
                        .ok_or_else(|| InternalError::MissingSessionKey.into()),
                }
            }
            RoleState::Initiator(role) => {
                if !receiver.is_responder() {
                    return Err(ProtocolError::BadReceiver { receiver: receiver.0 }.into());
                }
                let context = role
                    .responders
                    .get(&receiver)
                    .or_else(|| {
                        role.peer
                            .as_ref()
                            .filter(|peer| peer.address() == receiver)
                    })
                    .ok_or(ProtocolError::UnknownPeer { address: receiver.0 })?;
                match message_type {
                    "key" => context
                        .permanent_shared()
                        .cloned()
                        .map(EnvelopeKey::Shared)
                        .ok_or_else(|| {
                            InternalError::Invariant("responder permanent key unknown").into()
                        }),
                    _ => context
                        .session_shared()
                        .cloned()
                        .map(EnvelopeKey::Shared)
                        .ok_or_else(|| InternalError::MissingSessionKey.into()),
                }
            }
        }
    }

    // State bookkeeping -----------------------------------------------------

    pub(crate) fn set_state(&mut self, state: SignalingState) {
        if self.state != state {
            debug!("Signaling state: {} -> {}", self.state, state);
            self.state = state;
            self.actions
                .push(HandleAction::Event(Event::StateChanged(state)));
        }
    }

    fn set_channel(&mut self, channel: SignalingChannel) {
        if self.channel != channel {
            debug!("Signaling channel: {} -> {}", self.channel, channel);
            self.channel = channel;
            self.actions
                .push(HandleAction::Event(Event::ChannelChanged(channel)));
        }
    }
}
