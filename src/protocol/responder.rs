//! Responder-role peer handshake
//!
//! The responder drives the token / key / auth dance towards the initiator:
//! it sends `token` (unless trusted) and `key` as soon as the server
//! handshake reports the initiator as connected, answers the initiator's
//! `key` with `auth`, and completes when the initiator's `auth` selects one
//! of the advertised tasks.

use rmpv::Value;
use tracing::{debug, info, warn};

use crate::crypto::KeyStore;
use crate::error::{CloseCode, InternalError, ProtocolError, Result, ValidationError};
use crate::events::Event;
use crate::protocol::boxes::{ByteBox, OpenBox};
use crate::protocol::cookie::Cookie;
use crate::protocol::messages::{self, Auth, Disconnected, Key, Message, SendError, Token};
use crate::protocol::nonce::{Address, Nonce, ADDR_INITIATOR};
use crate::protocol::peers::{InitiatorContext, Peer};
use crate::protocol::signaling::{HandleAction, RoleState, Signaling};
use crate::protocol::state::{InitiatorHandshakeState, SignalingState};

impl Signaling {
    pub(crate) fn responder_on_peer_handshake_message(&mut self, bbox: ByteBox) -> Result<()> {
        let source = bbox.nonce.source();

        if source.is_server() {
            let shared = self.server_shared()?.clone();
            let obox = bbox.decrypt(&shared)?;
            match obox.message {
                Message::NewInitiator(_) => {
                    debug!("Received new-initiator");
                    self.responder_handle_new_initiator()
                }
                Message::SendError(msg) => {
                    debug!("Received send-error");
                    self.responder_handle_send_error(msg)
                }
                Message::Disconnected(msg) => {
                    debug!("Received disconnected");
                    self.responder_handle_disconnected(msg)
                }
                other => Err(ProtocolError::UnexpectedMessage {
                    state: "peer-handshake",
                    got: other.message_type().to_owned(),
                }
                .into()),
            }
        } else if source.is_initiator() {
            let obox = self.decrypt_initiator_message(bbox)?;
            let state = self.initiator_handshake_state()?;
            match (state, obox.message) {
                (InitiatorHandshakeState::KeySent, Message::Key(msg)) => {
                    debug!("Received key");
                    self.responder_handle_key(msg)?;
                    self.responder_send_auth(&obox.nonce)
                }
                (InitiatorHandshakeState::AuthSent, Message::Auth(msg)) => {
                    debug!("Received auth");
                    self.responder_handle_auth(msg)?;
                    self.set_state(SignalingState::Task);
                    info!("Peer handshake done");
                    self.actions.push(HandleAction::HandshakeDone);
                    Ok(())
                }
                (_, message) => Err(ProtocolError::UnexpectedMessage {
                    state: "peer-handshake",
                    got: message.message_type().to_owned(),
                }
                .into()),
            }
        } else {
            Err(ProtocolError::BadSource { source_addr: source.0 }.into())
        }
    }

    /// Server pushes after the handshake completed
    pub(crate) fn responder_on_server_task_message(&mut self, obox: OpenBox) -> Result<()> {
        match obox.message {
            Message::NewInitiator(_) => {
                // A new initiator replaced the one we authenticated with
                debug!("Received new-initiator after the peer handshake, closing");
                self.reset_connection(CloseCode::ClosingNormal);
                Ok(())
            }
            Message::SendError(msg) => self.responder_handle_send_error(msg),
            Message::Disconnected(msg) => self.responder_handle_disconnected(msg),
            other => {
                warn!(
                    "Ignoring {} from server in task state",
                    other.message_type()
                );
                Ok(())
            }
        }
    }

    /// Select the decryption envelope for an initiator message based on the
    /// handshake sub-state.
    fn decrypt_initiator_message(&self, bbox: ByteBox) -> Result<OpenBox> {
        let initiator = self.initiator_context()?;
        match initiator.handshake_state {
            InitiatorHandshakeState::New
            | InitiatorHandshakeState::TokenSent
            | InitiatorHandshakeState::KeyReceived => Err(ProtocolError::UnexpectedMessage {
                state: "peer-handshake",
                got: "initiator message before key exchange".to_owned(),
            }
            .into()),
            InitiatorHandshakeState::KeySent => {
                // Expect a key message, encrypted with the permanent keys
                bbox.decrypt(initiator.permanent_shared())
            }
            InitiatorHandshakeState::AuthSent | InitiatorHandshakeState::AuthReceived => {
                let session = initiator
                    .session_shared()
                    .ok_or(InternalError::MissingSessionKey)?;
                bbox.decrypt(session)
            }
        }
    }

    /// Send our token to the initiator (auth-token envelope)
    pub(crate) fn send_token(&mut self) -> Result<()> {
        let msg = Message::Token(Token {
            key: self.permanent_key.public_key().to_vec().into(),
        });
        self.send_message(msg, ADDR_INITIATOR, true)?;
        self.initiator_context_mut()?.handshake_state = InitiatorHandshakeState::TokenSent;
        Ok(())
    }

    /// Generate our session keypair and send its public key (permanent
    /// envelope)
    pub(crate) fn send_key(&mut self) -> Result<()> {
        let session_key = KeyStore::new();
        let public_key = *session_key.public_key();
        self.initiator_context_mut()?
            .set_tmp_local_session_key(session_key)?;

        let msg = Message::Key(Key {
            key: public_key.to_vec().into(),
        });
        self.send_message(msg, ADDR_INITIATOR, true)?;
        self.initiator_context_mut()?.handshake_state = InitiatorHandshakeState::KeySent;
        Ok(())
    }

    /// The initiator sent its public session key
    fn responder_handle_key(&mut self, msg: Key) -> Result<()> {
        let their_key = messages::key_array("key", &msg.key)?;
        let initiator = self.initiator_context_mut()?;
        let local_session_key = initiator.take_tmp_local_session_key()?;
        initiator.set_session_shared(local_session_key.shared_with(&their_key));
        initiator.handshake_state = InitiatorHandshakeState::KeyReceived;
        Ok(())
    }

    /// Repeat the initiator's cookie and advertise our tasks
    fn responder_send_auth(&mut self, nonce: &Nonce) -> Result<()> {
        let their_cookie = nonce.cookie().clone();
        if their_cookie == self.initiator_context()?.cookie_pair().ours {
            return Err(ProtocolError::CookieIdentical { peer: 0x01 }.into());
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut data = std::collections::HashMap::new();
        for task in &self.tasks {
            tasks.push(task.name().to_owned());
            data.insert(task.name().to_owned(), task.data().unwrap_or(Value::Nil));
        }

        let msg = Message::Auth(Auth {
            your_cookie: their_cookie.as_bytes().to_vec().into(),
            task: None,
            tasks: Some(tasks),
            data,
        });
        self.send_message(msg, ADDR_INITIATOR, true)?;
        self.initiator_context_mut()?.handshake_state = InitiatorHandshakeState::AuthSent;
        Ok(())
    }

    /// The initiator repeated our cookie and selected a task
    fn responder_handle_auth(&mut self, msg: Auth) -> Result<()> {
        let repeated = Cookie::from_bytes(&msg.your_cookie)?;
        if repeated != self.initiator_context()?.cookie_pair().ours {
            return Err(ProtocolError::RepeatedCookieMismatch.into());
        }

        // The initiator variant carries a single selected task
        let task_name = msg.task.as_ref().ok_or(ProtocolError::MisdirectedAuth)?;
        let index = self
            .tasks
            .iter()
            .position(|task| task.name() == task_name.as_str())
            .ok_or_else(|| ProtocolError::UnknownTask {
                task: task_name.clone(),
            })?;
        let mut task = self.tasks.swap_remove(index);

        let peer_data = msg.data.get(task_name).cloned().unwrap_or(Value::Nil);
        info!("Task {} has been selected", task.name());
        task.init(&peer_data)?;
        self.task = Some(task);

        self.initiator_context_mut()?.handshake_state = InitiatorHandshakeState::AuthReceived;
        debug!("Initiator authenticated");
        Ok(())
    }

    /// A new initiator replaced the old one; restart the peer handshake.
    ///
    /// The permanent key is necessarily unchanged, it is part of the
    /// WebSocket path.
    fn responder_handle_new_initiator(&mut self) -> Result<()> {
        match &mut self.role {
            RoleState::Responder(role) => {
                let initiator_key = *role.initiator.permanent_public_key();
                role.initiator = InitiatorContext::new(initiator_key, &self.permanent_key);
                if role.auth_token.is_none() {
                    role.initiator.handshake_state = InitiatorHandshakeState::TokenSent;
                }
                role.initiator.connected = true;
            }
            RoleState::Initiator(_) => {
                return Err(InternalError::Invariant("new-initiator handled as initiator").into())
            }
        }
        self.init_peer_handshake()
    }

    /// A message towards the initiator could not be delivered
    fn responder_handle_send_error(&mut self, msg: SendError) -> Result<()> {
        let receiver = msg.id[1];
        if receiver != ADDR_INITIATOR.0 {
            return Err(ProtocolError::SendErrorMismatch { id: receiver }.into());
        }
        warn!("Message to initiator could not be delivered");
        self.actions
            .push(HandleAction::Event(Event::ConnectionLost(ADDR_INITIATOR)));
        self.reset_connection(CloseCode::ProtocolError);
        Ok(())
    }

    fn responder_handle_disconnected(&mut self, msg: Disconnected) -> Result<()> {
        if msg.id != ADDR_INITIATOR.0 {
            return Err(ValidationError::AddressRange {
                field: "id",
                min: 0x01,
                max: 0x01,
                got: msg.id,
            }
            .into());
        }
        debug!("Initiator disconnected from the path");
        self.actions
            .push(HandleAction::Event(Event::PeerDisconnected(Address(msg.id))));
        Ok(())
    }

    fn initiator_context(&self) -> Result<&InitiatorContext> {
        match &self.role {
            RoleState::Responder(role) => Ok(&role.initiator),
            RoleState::Initiator(_) => {
                Err(InternalError::Invariant("initiator context on initiator role").into())
            }
        }
    }

    fn initiator_context_mut(&mut self) -> Result<&mut InitiatorContext> {
        match &mut self.role {
            RoleState::Responder(role) => Ok(&mut role.initiator),
            RoleState::Initiator(_) => {
                Err(InternalError::Invariant("initiator context on initiator role").into())
            }
        }
    }

    fn initiator_handshake_state(&self) -> Result<InitiatorHandshakeState> {
        Ok(self.initiator_context()?.handshake_state)
    }
}
