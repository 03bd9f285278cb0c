//! Initiator-role peer handshake
//!
//! The initiator waits for responders to announce themselves, walks each
//! one through the token / key / auth exchange and promotes the first
//! responder that authenticates to the peer slot, dropping all others.

use std::collections::HashMap;

use rmpv::Value;
use tracing::{debug, info, warn};

use crate::crypto::KeyStore;
use crate::error::{
    CloseCode, CryptoError, InternalError, ProtocolError, Result, SaltlinkError, ValidationError,
};
use crate::events::Event;
use crate::protocol::boxes::{ByteBox, OpenBox};
use crate::protocol::cookie::Cookie;
use crate::protocol::messages::{
    self, Auth, Disconnected, DropResponder, Key, Message, SendError, Token,
};
use crate::protocol::nonce::{Address, Nonce, ADDR_SERVER};
use crate::protocol::peers::{Peer, ResponderContext};
use crate::protocol::signaling::{HandleAction, RoleState, Signaling};
use crate::protocol::state::{ResponderHandshakeState, SignalingState};

impl Signaling {
    pub(crate) fn initiator_on_peer_handshake_message(&mut self, bbox: ByteBox) -> Result<()> {
        let source = bbox.nonce.source();

        if source.is_server() {
            let shared = self.server_shared()?.clone();
            let obox = bbox.decrypt(&shared)?;
            match obox.message {
                Message::NewResponder(msg) => {
                    debug!("Received new-responder ({:#04x})", msg.id);
                    self.initiator_handle_new_responder(msg.id)
                }
                Message::SendError(msg) => {
                    debug!("Received send-error");
                    self.initiator_handle_send_error(msg)
                }
                Message::Disconnected(msg) => {
                    debug!("Received disconnected");
                    self.initiator_handle_disconnected(msg)
                }
                other => Err(ProtocolError::UnexpectedMessage {
                    state: "peer-handshake",
                    got: other.message_type().to_owned(),
                }
                .into()),
            }
        } else if source.is_responder() {
            self.initiator_on_responder_message(bbox)
        } else {
            Err(ProtocolError::BadSource { source_addr: source.0 }.into())
        }
    }

    /// Server pushes after the handshake completed
    pub(crate) fn initiator_on_server_task_message(&mut self, obox: OpenBox) -> Result<()> {
        match obox.message {
            Message::NewResponder(msg) => {
                // The peer slot is taken; turn latecomers away
                debug!("Dropping responder {:#04x} that joined after the handshake", msg.id);
                let drop = Message::DropResponder(DropResponder {
                    id: msg.id,
                    reason: Some(CloseCode::DroppedByInitiator.as_u16()),
                });
                self.send_message(drop, ADDR_SERVER, true)
            }
            Message::SendError(msg) => self.initiator_handle_send_error(msg),
            Message::Disconnected(msg) => self.initiator_handle_disconnected(msg),
            other => {
                warn!(
                    "Ignoring {} from server in task state",
                    other.message_type()
                );
                Ok(())
            }
        }
    }

    /// Dispatch a responder frame by that responder's handshake sub-state
    fn initiator_on_responder_message(&mut self, bbox: ByteBox) -> Result<()> {
        let source = bbox.nonce.source();
        let (state, trusted) = {
            let role = self.initiator_role()?;
            let context = role
                .responders
                .get(&source)
                .ok_or(ProtocolError::UnknownPeer { address: source.0 })?;
            (context.handshake_state, role.trusted_responder_key.is_some())
        };

        match state {
            ResponderHandshakeState::New => {
                // Expect a token, encrypted with the auth token. A trusted
                // responder never reaches this state; its record starts
                // beyond the token exchange.
                let token = self
                    .initiator_role()?
                    .auth_token
                    .clone()
                    .ok_or(InternalError::Invariant("auth token missing"))?;
                let obox = match bbox.decrypt_token(&token) {
                    Ok(obox) => obox,
                    Err(SaltlinkError::Crypto(_)) => {
                        return Err(CryptoError::InitialHandshakeDecryption.into())
                    }
                    Err(e) => return Err(e),
                };
                match obox.message {
                    Message::Token(msg) => {
                        debug!("Received token");
                        self.initiator_handle_token(source, msg)
                    }
                    other => Err(ProtocolError::UnexpectedMessage {
                        state: "peer-handshake",
                        got: other.message_type().to_owned(),
                    }
                    .into()),
                }
            }
            ResponderHandshakeState::TokenReceived => {
                // Expect a key, encrypted with the permanent keys
                let shared = {
                    let context = self.responder_context(source)?;
                    context
                        .permanent_shared()
                        .cloned()
                        .ok_or(InternalError::Invariant("responder permanent key unknown"))?
                };
                let obox = match bbox.decrypt(&shared) {
                    Ok(obox) => obox,
                    // For a trusted responder this is the first message we
                    // can fail to decrypt
                    Err(SaltlinkError::Crypto(_)) if trusted => {
                        return Err(CryptoError::InitialHandshakeDecryption.into())
                    }
                    Err(e) => return Err(e),
                };
                match obox.message {
                    Message::Key(msg) => {
                        debug!("Received key");
                        self.initiator_handle_key(source, msg)
                    }
                    other => Err(ProtocolError::UnexpectedMessage {
                        state: "peer-handshake",
                        got: other.message_type().to_owned(),
                    }
                    .into()),
                }
            }
            ResponderHandshakeState::KeyReceived => {
                // Expect an auth, encrypted with the session keys
                let shared = {
                    let context = self.responder_context(source)?;
                    context
                        .session_shared()
                        .cloned()
                        .ok_or(InternalError::MissingSessionKey)?
                };
                let obox = bbox.decrypt(&shared)?;
                match obox.message {
                    Message::Auth(msg) => {
                        debug!("Received auth");
                        self.initiator_handle_auth(source, msg, &obox.nonce)
                    }
                    other => Err(ProtocolError::UnexpectedMessage {
                        state: "peer-handshake",
                        got: other.message_type().to_owned(),
                    }
                    .into()),
                }
            }
            ResponderHandshakeState::AuthReceived => {
                Err(InternalError::Invariant("responder already authenticated").into())
            }
        }
    }

    /// An untrusted responder proved knowledge of the auth token and
    /// announced its permanent key
    fn initiator_handle_token(&mut self, source: Address, msg: Token) -> Result<()> {
        let key = messages::key_array("key", &msg.key)?;
        match &mut self.role {
            RoleState::Initiator(role) => {
                let context = role
                    .responders
                    .get_mut(&source)
                    .ok_or(ProtocolError::UnknownPeer { address: source.0 })?;
                context.set_permanent_shared(self.permanent_key.shared_with(&key));
                context.handshake_state = ResponderHandshakeState::TokenReceived;
            }
            RoleState::Responder(_) => {
                return Err(InternalError::Invariant("token handled as responder").into())
            }
        }
        Ok(())
    }

    /// The responder sent its session key; answer with ours
    fn initiator_handle_key(&mut self, source: Address, msg: Key) -> Result<()> {
        let their_key = messages::key_array("key", &msg.key)?;
        let session_key = KeyStore::new();
        let public_key = *session_key.public_key();

        match &mut self.role {
            RoleState::Initiator(role) => {
                let context = role
                    .responders
                    .get_mut(&source)
                    .ok_or(ProtocolError::UnknownPeer { address: source.0 })?;
                context.set_session_shared(session_key.shared_with(&their_key));
                context.set_local_session_key(session_key);
                context.handshake_state = ResponderHandshakeState::KeyReceived;
            }
            RoleState::Responder(_) => {
                return Err(InternalError::Invariant("key handled as responder").into())
            }
        }

        let reply = Message::Key(Key {
            key: public_key.to_vec().into(),
        });
        self.send_message(reply, source, true)
    }

    /// The responder repeated our cookie and advertised its tasks; select
    /// one, confirm it, and promote the responder to the peer slot
    fn initiator_handle_auth(&mut self, source: Address, msg: Auth, nonce: &Nonce) -> Result<()> {
        let repeated = Cookie::from_bytes(&msg.your_cookie)?;
        if repeated != self.responder_context(source)?.cookie_pair().ours {
            return Err(ProtocolError::RepeatedCookieMismatch.into());
        }

        // The responder variant carries the advertised task list; pick the
        // first name (in the responder's order) that we also offer
        let offered = msg.tasks.as_ref().ok_or(ProtocolError::MisdirectedAuth)?;
        let chosen_name = offered
            .iter()
            .find(|name| self.tasks.iter().any(|task| task.name() == name.as_str()))
            .cloned()
            .ok_or(ProtocolError::NoSharedTask)?;
        let index = self
            .tasks
            .iter()
            .position(|task| task.name() == chosen_name)
            .ok_or(ProtocolError::NoSharedTask)?;
        let mut task = self.tasks.swap_remove(index);

        // Confirm the selection, echoing the responder's cookie
        let mut data = HashMap::new();
        data.insert(chosen_name.clone(), task.data().unwrap_or(Value::Nil));
        let reply = Message::Auth(Auth {
            your_cookie: nonce.cookie().as_bytes().to_vec().into(),
            task: Some(chosen_name.clone()),
            tasks: None,
            data,
        });
        self.send_message(reply, source, true)?;

        let peer_data = msg.data.get(&chosen_name).cloned().unwrap_or(Value::Nil);
        info!("Task {} has been selected", chosen_name);
        task.init(&peer_data)?;
        self.task = Some(task);

        // Promote the authenticated responder, drop everyone else
        let others: Vec<Address> = {
            let role = self.initiator_role_mut()?;
            role.responders
                .get_mut(&source)
                .ok_or(ProtocolError::UnknownPeer { address: source.0 })?
                .handshake_state = ResponderHandshakeState::AuthReceived;
            role.responders
                .keys()
                .copied()
                .filter(|address| *address != source)
                .collect()
        };
        for address in others {
            debug!("Dropping responder {}", address);
            let drop = Message::DropResponder(DropResponder {
                id: address.0,
                reason: Some(CloseCode::DroppedByInitiator.as_u16()),
            });
            self.send_message(drop, ADDR_SERVER, true)?;
        }
        {
            let role = self.initiator_role_mut()?;
            role.peer = role.responders.remove(&source);
            role.responders.clear();
            // The token is spent; a reconnect needs a fresh one
            role.auth_token = None;
        }

        self.set_state(SignalingState::Task);
        info!("Peer handshake done");
        self.actions.push(HandleAction::HandshakeDone);
        Ok(())
    }

    /// Register a responder announced by the server
    fn initiator_handle_new_responder(&mut self, id: u8) -> Result<()> {
        let address = Address(id);
        match &mut self.role {
            RoleState::Initiator(role) => {
                if role.responders.contains_key(&address) {
                    warn!("Responder {} already known, replacing", address);
                }
                let context = match role.trusted_responder_key {
                    Some(trusted) => {
                        ResponderContext::new_trusted(address, trusted, &self.permanent_key)
                    }
                    None => ResponderContext::new(address),
                };
                role.responders.insert(address, context);
            }
            RoleState::Responder(_) => {
                return Err(InternalError::Invariant("new-responder handled as responder").into())
            }
        }
        Ok(())
    }

    /// A message towards a responder could not be delivered
    fn initiator_handle_send_error(&mut self, msg: SendError) -> Result<()> {
        let receiver = msg.id[1];
        let address = Address(receiver);
        if !address.is_responder() {
            return Err(ProtocolError::SendErrorMismatch { id: receiver }.into());
        }

        warn!("Message to responder {} could not be delivered", address);
        self.actions
            .push(HandleAction::Event(Event::ConnectionLost(address)));

        if self.peer_address() == Some(address) {
            // The established peer is gone, the connection is dead
            self.reset_connection(CloseCode::ProtocolError);
        } else if let RoleState::Initiator(role) = &mut self.role {
            role.responders.remove(&address);
        }
        Ok(())
    }

    fn initiator_handle_disconnected(&mut self, msg: Disconnected) -> Result<()> {
        let address = Address(msg.id);
        if !address.is_responder() {
            return Err(ValidationError::AddressRange {
                field: "id",
                min: 0x02,
                max: 0xff,
                got: msg.id,
            }
            .into());
        }
        debug!("Responder {} disconnected from the path", address);
        if let RoleState::Initiator(role) = &mut self.role {
            role.responders.remove(&address);
        }
        self.actions
            .push(HandleAction::Event(Event::PeerDisconnected(address)));
        Ok(())
    }

    fn initiator_role(&self) -> Result<&crate::protocol::signaling::InitiatorRole> {
        match &self.role {
            RoleState::Initiator(role) => Ok(role),
            RoleState::Responder(_) => {
                Err(InternalError::Invariant("initiator role on responder").into())
            }
        }
    }

    fn initiator_role_mut(&mut self) -> Result<&mut crate::protocol::signaling::InitiatorRole> {
        match &mut self.role {
            RoleState::Initiator(role) => Ok(role),
            RoleState::Responder(_) => {
                Err(InternalError::Invariant("initiator role on responder").into())
            }
        }
    }

    fn responder_context(&self, address: Address) -> Result<&ResponderContext> {
        self.initiator_role()?
            .responders
            .get(&address)
            .ok_or_else(|| ProtocolError::UnknownPeer { address: address.0 }.into())
    }
}
