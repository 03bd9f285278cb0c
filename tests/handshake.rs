//! End-to-end handshake scenarios
//!
//! These tests drive the signaling state machines directly, playing the
//! server (and where needed the remote peer) with real key material, and
//! assert on the frames the machines produce.

use std::collections::HashMap;

use rmpv::Value;
use serde_bytes::ByteBuf;

use saltlink::crypto::{AuthToken, KeyStore, SharedKeyStore};
use saltlink::error::CloseCode;
use saltlink::protocol::boxes::{ByteBox, OpenBox};
use saltlink::protocol::cookie::Cookie;
use saltlink::protocol::csn::CombinedSequence;
use saltlink::protocol::messages::{Auth, Key, Message, NewInitiator, ServerAuth, ServerHello};
use saltlink::protocol::nonce::{Address, Nonce, ADDR_INITIATOR, ADDR_SERVER};
use saltlink::protocol::signaling::HandleAction;
use saltlink::protocol::{Signaling, SignalingState};
use saltlink::task::{SignalingHandle, Task};
use saltlink::{InitiatorConfig, ResponderConfig, SaltlinkError, TaskMessage};

/// A test task advertising a single name
#[derive(Debug)]
struct TestTask {
    name: &'static str,
}

impl TestTask {
    fn new(name: &'static str) -> Box<dyn Task> {
        Box::new(Self { name })
    }
}

impl Task for TestTask {
    fn name(&self) -> &str {
        self.name
    }

    fn supported_message_types(&self) -> &[&str] {
        &["probe"]
    }

    fn data(&self) -> Option<Value> {
        None
    }

    fn init(&mut self, _data: &Value) -> Result<(), SaltlinkError> {
        Ok(())
    }

    fn on_peer_handshake_done(&mut self, _handle: SignalingHandle) {}

    fn on_task_message(&mut self, _message: TaskMessage) {}

    fn send_signaling_message(&mut self, _payload: &[u8]) {}

    fn close(&mut self, _reason: CloseCode) {}
}

/// One server-side connection towards a client
struct ServerConnection {
    session_key: KeyStore,
    cookie: Cookie,
    csn: CombinedSequence,
    /// Derived once the client's permanent key is known
    shared: Option<SharedKeyStore>,
}

impl ServerConnection {
    fn new() -> Self {
        Self {
            session_key: KeyStore::new(),
            cookie: Cookie::random(),
            csn: CombinedSequence::new(),
            shared: None,
        }
    }

    fn learn_client(&mut self, client_permanent: &[u8; 32]) {
        self.shared = Some(self.session_key.shared_with(client_permanent));
    }

    fn next_nonce(&mut self, destination: Address) -> Nonce {
        let csn = self.csn.next().expect("server CSN exhausted");
        Nonce::new(self.cookie.clone(), ADDR_SERVER, destination, csn)
    }

    fn server_hello(&mut self) -> Vec<u8> {
        let msg = Message::ServerHello(ServerHello {
            key: ByteBuf::from(self.session_key.public_key().to_vec()),
        });
        let nonce = self.next_nonce(Address(0x00));
        OpenBox::new(msg, nonce).encode().unwrap().into_bytes()
    }

    fn encrypted(&mut self, msg: Message, destination: Address) -> Vec<u8> {
        let nonce = self.next_nonce(destination);
        let shared = self.shared.as_ref().expect("client key not learned");
        OpenBox::new(msg, nonce)
            .encrypt(shared)
            .unwrap()
            .into_bytes()
    }

    fn decrypt(&self, bbox: &ByteBox) -> Message {
        let shared = self.shared.as_ref().expect("client key not learned");
        bbox.clone().decrypt(shared).unwrap().message
    }
}

fn replies(actions: &[HandleAction]) -> Vec<ByteBox> {
    actions
        .iter()
        .filter_map(|action| match action {
            HandleAction::Reply(bbox) => Some(bbox.clone()),
            _ => None,
        })
        .collect()
}

fn close_code(actions: &[HandleAction]) -> Option<CloseCode> {
    actions.iter().find_map(|action| match action {
        HandleAction::Close(code) => Some(*code),
        _ => None,
    })
}

fn has_handshake_done(actions: &[HandleAction]) -> bool {
    actions
        .iter()
        .any(|action| matches!(action, HandleAction::HandshakeDone))
}

/// A hand-driven initiator-side peer for responder scenarios
struct ManualInitiator {
    permanent_key: KeyStore,
    session_key: KeyStore,
    cookie: Cookie,
    csn: CombinedSequence,
    address: Address,
}

impl ManualInitiator {
    fn new() -> Self {
        Self {
            permanent_key: KeyStore::new(),
            session_key: KeyStore::new(),
            cookie: Cookie::random(),
            csn: CombinedSequence::new(),
            address: ADDR_INITIATOR,
        }
    }

    fn next_nonce(&mut self, destination: Address) -> Nonce {
        let csn = self.csn.next().expect("initiator CSN exhausted");
        Nonce::new(self.cookie.clone(), self.address, destination, csn)
    }

    /// The initiator's `key` message, permanent-key envelope
    fn key_frame(&mut self, responder_permanent: &[u8; 32], destination: Address) -> Vec<u8> {
        let msg = Message::Key(Key {
            key: ByteBuf::from(self.session_key.public_key().to_vec()),
        });
        let nonce = self.next_nonce(destination);
        let shared = self.permanent_key.shared_with(responder_permanent);
        OpenBox::new(msg, nonce).encrypt(&shared).unwrap().into_bytes()
    }

    /// The initiator's `auth` message, session envelope
    fn auth_frame(
        &mut self,
        responder_session: &[u8; 32],
        your_cookie: &Cookie,
        task: &str,
        destination: Address,
    ) -> Vec<u8> {
        let mut data = HashMap::new();
        data.insert(task.to_owned(), Value::Nil);
        let msg = Message::Auth(Auth {
            your_cookie: ByteBuf::from(your_cookie.as_bytes().to_vec()),
            task: Some(task.to_owned()),
            tasks: None,
            data,
        });
        let nonce = self.next_nonce(destination);
        let shared = self.session_key.shared_with(responder_session);
        OpenBox::new(msg, nonce).encrypt(&shared).unwrap().into_bytes()
    }
}

/// Walk a responder through the server handshake; returns the peer
/// handshake frames it produced (token and/or key).
fn responder_server_handshake(
    signaling: &mut Signaling,
    server: &mut ServerConnection,
    address: Address,
    initiator_connected: bool,
) -> Vec<ByteBox> {
    signaling.on_transport_open();

    let actions = signaling.handle_binary(&server.server_hello());
    let sent = replies(&actions);
    assert_eq!(sent.len(), 2, "expected client-hello and client-auth");

    // client-hello carries the responder's permanent key in cleartext
    let hello = sent[0].clone().decode().unwrap();
    let client_key = match hello.message {
        Message::ClientHello(msg) => {
            let mut key = [0u8; 32];
            key.copy_from_slice(&msg.key);
            key
        }
        other => panic!("expected client-hello, got {}", other.message_type()),
    };
    server.learn_client(&client_key);

    // client-auth must repeat the server's cookie
    let auth = server.decrypt(&sent[1]);
    match auth {
        Message::ClientAuth(msg) => {
            assert_eq!(&msg.your_cookie[..], server.cookie.as_bytes());
            assert_eq!(
                msg.subprotocols.as_deref(),
                Some(&["saltyrtc-1.0".to_owned()][..])
            );
        }
        other => panic!("expected client-auth, got {}", other.message_type()),
    }

    // server-auth assigns the address and reports the initiator presence
    let our_cookie = sent[0].nonce.cookie().clone();
    let msg = Message::ServerAuth(ServerAuth {
        your_cookie: ByteBuf::from(our_cookie.as_bytes().to_vec()),
        signed_keys: None,
        responders: None,
        initiator_connected: Some(initiator_connected),
    });
    let frame = server.encrypted(msg, address);
    let actions = signaling.handle_binary(&frame);
    assert_eq!(signaling.state(), SignalingState::PeerHandshake);
    replies(&actions)
}

// E1: responder handshake with an untrusted initiator ----------------------

#[test]
fn responder_handshake_untrusted_initiator() {
    let mut initiator = ManualInitiator::new();
    let auth_token = AuthToken::new();

    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key(*initiator.permanent_key.public_key(), auth_token.clone());
    let mut signaling =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();
    let responder_permanent = *signaling.permanent_public_key();

    let mut server = ServerConnection::new();
    let peer_frames =
        responder_server_handshake(&mut signaling, &mut server, Address(0x02), true);

    // Outbound sequence: token (secretbox under the auth token), then key
    // (permanent-key box)
    assert_eq!(peer_frames.len(), 2);
    let token = peer_frames[0].clone().decrypt_token(&auth_token).unwrap();
    match token.message {
        Message::Token(msg) => assert_eq!(&msg.key[..], &responder_permanent[..]),
        other => panic!("expected token, got {}", other.message_type()),
    }

    let permanent_shared = initiator
        .permanent_key
        .shared_with(&responder_permanent);
    let key = peer_frames[1].clone().decrypt(&permanent_shared).unwrap();
    let responder_session: [u8; 32] = match key.message {
        Message::Key(msg) => msg.key[..].try_into().unwrap(),
        other => panic!("expected key, got {}", other.message_type()),
    };

    // Upon the initiator's key, the responder answers with auth advertising
    // its tasks
    let frame = initiator.key_frame(&responder_permanent, Address(0x02));
    let actions = signaling.handle_binary(&frame);
    let sent = replies(&actions);
    assert_eq!(sent.len(), 1);

    let session_shared = initiator.session_key.shared_with(&responder_session);
    let auth = sent[0].clone().decrypt(&session_shared).unwrap();
    let responder_cookie = sent[0].nonce.cookie().clone();
    match auth.message {
        Message::Auth(msg) => {
            assert_eq!(&msg.your_cookie[..], initiator.cookie.as_bytes());
            assert_eq!(msg.tasks.as_deref(), Some(&["t".to_owned()][..]));
            assert!(msg.task.is_none());
        }
        other => panic!("expected auth, got {}", other.message_type()),
    }

    // The initiator confirms the task; the responder reaches the task state
    let frame = initiator.auth_frame(&responder_session, &responder_cookie, "t", Address(0x02));
    let actions = signaling.handle_binary(&frame);
    assert!(has_handshake_done(&actions));
    assert_eq!(signaling.state(), SignalingState::Task);
    assert_eq!(signaling.task().unwrap().name(), "t");
}

// E2: responder with a trusted initiator -----------------------------------

#[test]
fn responder_handshake_trusted_initiator() {
    let mut initiator = ManualInitiator::new();

    let config = ResponderConfig::new(KeyStore::new())
        .with_trusted_initiator(*initiator.permanent_key.public_key());
    let mut signaling =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();

    let mut server = ServerConnection::new();
    let peer_frames =
        responder_server_handshake(&mut signaling, &mut server, Address(0x03), true);

    // No token; the first peer message is the key, decryptable with the
    // permanent keys
    assert_eq!(peer_frames.len(), 1);
    let responder_permanent = *signaling.permanent_public_key();
    let permanent_shared = initiator.permanent_key.shared_with(&responder_permanent);
    let key = peer_frames[0].clone().decrypt(&permanent_shared).unwrap();
    assert!(matches!(key.message, Message::Key(_)));
}

// E3: configuration conflict ------------------------------------------------

#[test]
fn responder_config_conflict() {
    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key([1u8; 32], AuthToken::new())
        .with_trusted_initiator([2u8; 32]);
    let result = Signaling::new_responder(config, vec![TestTask::new("t")]);
    assert!(matches!(
        result,
        Err(saltlink::error::ConfigError::TrustedKeyConflict)
    ));

    // Neither trusted key nor key/token pair is an error too
    let config = ResponderConfig::new(KeyStore::new());
    let result = Signaling::new_responder(config, vec![TestTask::new("t")]);
    assert!(matches!(
        result,
        Err(saltlink::error::ConfigError::MissingInitiatorKnowledge)
    ));
}

// E4: cookie replay attack --------------------------------------------------

#[test]
fn responder_rejects_wrong_repeated_cookie() {
    let mut initiator = ManualInitiator::new();
    let auth_token = AuthToken::new();

    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key(*initiator.permanent_key.public_key(), auth_token);
    let mut signaling =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();
    let responder_permanent = *signaling.permanent_public_key();

    let mut server = ServerConnection::new();
    let peer_frames =
        responder_server_handshake(&mut signaling, &mut server, Address(0x02), true);

    let permanent_shared = initiator.permanent_key.shared_with(&responder_permanent);
    let responder_session: [u8; 32] = match peer_frames[1]
        .clone()
        .decrypt(&permanent_shared)
        .unwrap()
        .message
    {
        Message::Key(msg) => msg.key[..].try_into().unwrap(),
        other => panic!("expected key, got {}", other.message_type()),
    };

    let frame = initiator.key_frame(&responder_permanent, Address(0x02));
    signaling.handle_binary(&frame);

    // Repeat a cookie that is not the responder's own
    let wrong_cookie = Cookie::random();
    let frame = initiator.auth_frame(&responder_session, &wrong_cookie, "t", Address(0x02));
    let actions = signaling.handle_binary(&frame);

    assert_eq!(close_code(&actions), Some(CloseCode::ProtocolError));
    assert_eq!(signaling.state(), SignalingState::Closed);
}

// E5: CSN regression ---------------------------------------------------------

#[test]
fn responder_rejects_csn_replay() {
    let mut initiator = ManualInitiator::new();
    let auth_token = AuthToken::new();

    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key(*initiator.permanent_key.public_key(), auth_token);
    let mut signaling =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();
    let responder_permanent = *signaling.permanent_public_key();

    let mut server = ServerConnection::new();
    responder_server_handshake(&mut signaling, &mut server, Address(0x02), true);

    // A valid key message, delivered twice: the identical combined sequence
    // number must fail the connection
    let frame = initiator.key_frame(&responder_permanent, Address(0x02));
    let actions = signaling.handle_binary(&frame);
    assert!(close_code(&actions).is_none());

    let actions = signaling.handle_binary(&frame);
    assert_eq!(close_code(&actions), Some(CloseCode::ProtocolError));
    assert_eq!(signaling.state(), SignalingState::Closed);
}

// E6: new-initiator during the peer handshake --------------------------------

#[test]
fn responder_restarts_on_new_initiator() {
    let mut initiator = ManualInitiator::new();
    let auth_token = AuthToken::new();

    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key(*initiator.permanent_key.public_key(), auth_token.clone());
    let mut signaling =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();
    let responder_permanent = *signaling.permanent_public_key();

    let mut server = ServerConnection::new();
    let first_frames =
        responder_server_handshake(&mut signaling, &mut server, Address(0x02), true);
    assert_eq!(first_frames.len(), 2); // token + key sent, state KEY_SENT

    // A new initiator replaces the old one; the responder rebuilds the
    // record with the same permanent key and resends token + key
    let frame = server.encrypted(Message::NewInitiator(NewInitiator {}), Address(0x02));
    let actions = signaling.handle_binary(&frame);
    let resent = replies(&actions);
    assert_eq!(resent.len(), 2);

    let token = resent[0].clone().decrypt_token(&auth_token).unwrap();
    match token.message {
        Message::Token(msg) => assert_eq!(&msg.key[..], &responder_permanent[..]),
        other => panic!("expected token, got {}", other.message_type()),
    }
    let permanent_shared = initiator.permanent_key.shared_with(&responder_permanent);
    let key = resent[1].clone().decrypt(&permanent_shared).unwrap();
    assert!(matches!(key.message, Message::Key(_)));
    assert_eq!(signaling.state(), SignalingState::PeerHandshake);
}

// Full handshake through a relaying server -----------------------------------

#[test]
fn full_handshake_initiator_and_responder() {
    let mut initiator =
        Signaling::new_initiator(InitiatorConfig::new(KeyStore::new()), vec![
            TestTask::new("x"),
            TestTask::new("t"),
        ]);
    let auth_token = initiator.auth_token().unwrap().clone();
    let initiator_permanent = *initiator.permanent_public_key();

    let config = ResponderConfig::new(KeyStore::new())
        .with_initiator_key(initiator_permanent, auth_token);
    let mut responder =
        Signaling::new_responder(config, vec![TestTask::new("t")]).unwrap();

    // Server handshake for the initiator; the path already carries the
    // responder 0x02 and a stale responder 0x03
    let mut server_i = ServerConnection::new();
    server_i.learn_client(&initiator_permanent);
    initiator.on_transport_open();

    let actions = initiator.handle_binary(&server_i.server_hello());
    let sent = replies(&actions);
    assert_eq!(sent.len(), 1); // client-auth only, no client-hello
    let initiator_cookie = sent[0].nonce.cookie().clone();

    let msg = Message::ServerAuth(ServerAuth {
        your_cookie: ByteBuf::from(initiator_cookie.as_bytes().to_vec()),
        signed_keys: None,
        responders: Some(vec![0x02, 0x03]),
        initiator_connected: None,
    });
    let frame = server_i.encrypted(msg, Address(0x01));
    initiator.handle_binary(&frame);
    assert_eq!(initiator.state(), SignalingState::PeerHandshake);

    // Server handshake for the responder
    let mut server_r = ServerConnection::new();
    let mut pending: Vec<ByteBox> =
        responder_server_handshake(&mut responder, &mut server_r, Address(0x02), true);

    // Relay peer frames until both sides go quiet
    let mut server_inbox: Vec<ByteBox> = Vec::new();
    while !pending.is_empty() {
        let mut next = Vec::new();
        for bbox in pending.drain(..) {
            let destination = bbox.nonce.destination();
            let frame = bbox.into_bytes();
            let actions = if destination.is_initiator() {
                initiator.handle_binary(&frame)
            } else if destination.is_responder() {
                responder.handle_binary(&frame)
            } else {
                unreachable!("unexpected frame for the server relay");
            };
            for action in &actions {
                if let HandleAction::Reply(reply) = action {
                    if reply.nonce.destination().is_server() {
                        server_inbox.push(reply.clone());
                    } else {
                        next.push(reply.clone());
                    }
                }
            }
        }
        pending = next;
    }

    // Both sides selected the common task and reached the task state
    assert_eq!(initiator.state(), SignalingState::Task);
    assert_eq!(responder.state(), SignalingState::Task);
    assert_eq!(initiator.task().unwrap().name(), "t");
    assert_eq!(responder.task().unwrap().name(), "t");
    assert_eq!(initiator.peer_address(), Some(Address(0x02)));
    assert_eq!(responder.peer_address(), Some(ADDR_INITIATOR));

    // The stale responder 0x03 was dropped at the server
    assert_eq!(server_inbox.len(), 1);
    let drop = server_i.decrypt(&server_inbox[0]);
    match drop {
        Message::DropResponder(msg) => {
            assert_eq!(msg.id, 0x03);
            assert_eq!(msg.reason, Some(CloseCode::DroppedByInitiator.as_u16()));
        }
        other => panic!("expected drop-responder, got {}", other.message_type()),
    }

    // Post-handshake traffic flows through the session envelope in both
    // directions
    let probe = TaskMessage::build(
        "probe",
        vec![(Value::String("n".into()), Value::from(1))],
    );
    let bbox = initiator.encode_task_message(&probe).unwrap();
    let actions = responder.handle_binary(&bbox.into_bytes());
    assert!(close_code(&actions).is_none());
    assert_eq!(responder.state(), SignalingState::Task);

    let reply = TaskMessage::build("probe", vec![]);
    let bbox = responder.encode_task_message(&reply).unwrap();
    let actions = initiator.handle_binary(&bbox.into_bytes());
    assert!(close_code(&actions).is_none());
    assert_eq!(initiator.state(), SignalingState::Task);

    // A task message of an unsupported type resets the connection
    let bogus = TaskMessage::build("not-a-probe", vec![]);
    let bbox = initiator.encode_task_message(&bogus).unwrap();
    let actions = responder.handle_binary(&bbox.into_bytes());
    assert_eq!(close_code(&actions), Some(CloseCode::ProtocolError));
    assert_eq!(responder.state(), SignalingState::Closed);
}
