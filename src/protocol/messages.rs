//! Signaling message catalog and codec
//!
//! Every signaling message is a MessagePack map with a required string
//! `type` field. The reader decodes bytes into a self-describing value,
//! dispatches on the type string and validates the per-type content
//! constraints (key and cookie lengths, address ranges, task fields).
//!
//! Task messages exchanged after the peer handshake carry types outside
//! this catalog; they are handled as raw values, see [`TaskMessage`].

use std::collections::{HashMap, HashSet};

use rmpv::Value;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::crypto::cipher::KEY_LEN;
use crate::error::{CloseCode, SaltlinkError, SerializationError, ValidationError};
use crate::protocol::cookie::COOKIE_LEN;

/// Length of the `signed_keys` field: two 32-byte keys plus the tag
pub const SIGNED_KEYS_LEN: usize = 2 * KEY_LEN + crate::crypto::TAG_LEN;

/// Length of the `send-error` id: the addressing trailer of the failed nonce
pub const SEND_ERROR_ID_LEN: usize = 8;

/// A typed signaling message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    ServerHello(ServerHello),
    ClientHello(ClientHello),
    ClientAuth(ClientAuth),
    ServerAuth(ServerAuth),
    NewInitiator(NewInitiator),
    NewResponder(NewResponder),
    DropResponder(DropResponder),
    SendError(SendError),
    Disconnected(Disconnected),
    Token(Token),
    Key(Key),
    Auth(Auth),
    Close(Close),
    Application(Application),
}

/// First message on the channel, sent by the server in cleartext
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    /// The server's public session key
    pub key: ByteBuf,
}

/// Responder's cleartext reply carrying its permanent public key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub key: ByteBuf,
}

/// Client authentication towards the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub your_cookie: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subprotocols: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval: Option<u32>,
    /// Pinned server permanent key, echoed so the server can fail fast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_key: Option<ByteBuf>,
}

/// Server authentication, role-dependent fields
///
/// The server sends `responders` to an initiator and `initiator_connected`
/// to a responder; the other field must be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAuth {
    pub your_cookie: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_keys: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responders: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator_connected: Option<bool>,
}

/// Server push: an initiator joined the path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInitiator {}

/// Server push: a responder joined the path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResponder {
    pub id: u8,
}

/// Initiator request: remove a responder from the path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropResponder {
    pub id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u16>,
}

/// Server push: a relayed frame could not be delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendError {
    /// `source || destination || overflow || sequence` of the failed nonce
    pub id: ByteBuf,
}

/// Server push: a peer left the path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnected {
    pub id: u8,
}

/// Responder's one-use token message carrying its permanent public key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub key: ByteBuf,
}

/// Session public key exchange, sent by both peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub key: ByteBuf,
}

/// Peer authentication and task negotiation
///
/// The responder advertises `tasks`, the initiator answers with the chosen
/// `task`; exactly one of the two fields is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub your_cookie: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<String>>,
    pub data: HashMap<String, Value>,
}

/// Post-handshake close announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    pub reason: u16,
}

/// Opaque application payload outside the task protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub data: Value,
}

impl Message {
    /// The wire value of the `type` field
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::ServerHello(_) => "server-hello",
            Self::ClientHello(_) => "client-hello",
            Self::ClientAuth(_) => "client-auth",
            Self::ServerAuth(_) => "server-auth",
            Self::NewInitiator(_) => "new-initiator",
            Self::NewResponder(_) => "new-responder",
            Self::DropResponder(_) => "drop-responder",
            Self::SendError(_) => "send-error",
            Self::Disconnected(_) => "disconnected",
            Self::Token(_) => "token",
            Self::Key(_) => "key",
            Self::Auth(_) => "auth",
            Self::Close(_) => "close",
            Self::Application(_) => "application",
        }
    }

    /// Encode to MessagePack bytes (map with field names)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        rmp_serde::to_vec_named(self).map_err(|e| SerializationError::Encode(e.to_string()))
    }

    /// Decode MessagePack bytes into a validated catalog message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SaltlinkError> {
        let value = rmpv::decode::read_value(&mut &bytes[..])
            .map_err(|e| SerializationError::Decode(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode a self-describing value into a validated catalog message
    pub fn from_value(value: Value) -> Result<Self, SaltlinkError> {
        let message_type = read_type(&value)?.to_owned();

        fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SerializationError> {
            rmpv::ext::from_value(value).map_err(|e| SerializationError::Decode(e.to_string()))
        }

        let msg = match message_type.as_str() {
            "server-hello" => Message::ServerHello(decode(value)?),
            "client-hello" => Message::ClientHello(decode(value)?),
            "client-auth" => Message::ClientAuth(decode(value)?),
            "server-auth" => Message::ServerAuth(decode(value)?),
            "new-initiator" => Message::NewInitiator(decode(value)?),
            "new-responder" => Message::NewResponder(decode(value)?),
            "drop-responder" => Message::DropResponder(decode(value)?),
            "send-error" => Message::SendError(decode(value)?),
            "disconnected" => Message::Disconnected(decode(value)?),
            "token" => Message::Token(decode(value)?),
            "key" => Message::Key(decode(value)?),
            "auth" => Message::Auth(decode(value)?),
            "close" => Message::Close(decode(value)?),
            "application" => Message::Application(decode(value)?),
            other => return Err(SerializationError::UnknownType(other.to_owned()).into()),
        };

        msg.validate()?;
        Ok(msg)
    }

    /// Check the per-type content constraints
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::ServerHello(msg) => check_len("key", &msg.key, KEY_LEN),
            Self::ClientHello(msg) => check_len("key", &msg.key, KEY_LEN),
            Self::ClientAuth(msg) => {
                check_len("your_cookie", &msg.your_cookie, COOKIE_LEN)?;
                if let Some(key) = &msg.your_key {
                    check_len("your_key", key, KEY_LEN)?;
                }
                Ok(())
            }
            Self::ServerAuth(msg) => {
                check_len("your_cookie", &msg.your_cookie, COOKIE_LEN)?;
                if let Some(signed_keys) = &msg.signed_keys {
                    check_len("signed_keys", signed_keys, SIGNED_KEYS_LEN)?;
                }
                if let Some(responders) = &msg.responders {
                    for &id in responders {
                        check_responder_id("responders", id)?;
                    }
                    let unique: HashSet<u8> = responders.iter().copied().collect();
                    if unique.len() != responders.len() {
                        return Err(ValidationError::Duplicates {
                            field: "responders",
                        });
                    }
                }
                Ok(())
            }
            Self::NewInitiator(_) => Ok(()),
            Self::NewResponder(msg) => check_responder_id("id", msg.id),
            Self::DropResponder(msg) => {
                check_responder_id("id", msg.id)?;
                if let Some(reason) = msg.reason {
                    if !CloseCode::is_valid_close_reason(reason) {
                        return Err(ValidationError::InvalidCloseReason { reason });
                    }
                }
                Ok(())
            }
            Self::SendError(msg) => check_len("id", &msg.id, SEND_ERROR_ID_LEN),
            Self::Disconnected(msg) => {
                if msg.id < 0x01 {
                    return Err(ValidationError::AddressRange {
                        field: "id",
                        min: 0x01,
                        max: 0xff,
                        got: msg.id,
                    });
                }
                Ok(())
            }
            Self::Token(msg) => check_len("key", &msg.key, KEY_LEN),
            Self::Key(msg) => check_len("key", &msg.key, KEY_LEN),
            Self::Auth(msg) => {
                check_len("your_cookie", &msg.your_cookie, COOKIE_LEN)?;
                match (&msg.task, &msg.tasks) {
                    (Some(_), Some(_)) => Err(ValidationError::AmbiguousTaskField),
                    (None, None) => Err(ValidationError::MissingTaskField),
                    (Some(task), None) => {
                        if !msg.data.contains_key(task) {
                            return Err(ValidationError::MissingTaskData { task: task.clone() });
                        }
                        Ok(())
                    }
                    (None, Some(tasks)) => {
                        for task in tasks {
                            if !msg.data.contains_key(task) {
                                return Err(ValidationError::MissingTaskData {
                                    task: task.clone(),
                                });
                            }
                        }
                        Ok(())
                    }
                }
            }
            Self::Close(msg) => {
                if !CloseCode::is_valid_close_reason(msg.reason) {
                    return Err(ValidationError::InvalidCloseReason { reason: msg.reason });
                }
                Ok(())
            }
            Self::Application(_) => Ok(()),
        }
    }
}

/// A post-handshake message addressed to the selected task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub message_type: String,
    pub value: Value,
}

impl TaskMessage {
    /// Wrap a decoded value after extracting its type field
    pub fn from_value(value: Value) -> Result<Self, SerializationError> {
        let message_type = read_type(&value)?.to_owned();
        Ok(Self {
            message_type,
            value,
        })
    }

    /// Build a task message from a type and a map of fields
    pub fn build(message_type: &str, mut fields: Vec<(Value, Value)>) -> Self {
        let mut entries = vec![(
            Value::String("type".into()),
            Value::String(message_type.into()),
        )];
        entries.append(&mut fields);
        Self {
            message_type: message_type.to_owned(),
            value: Value::Map(entries),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        encode_value(&self.value)
    }
}

/// Encode an arbitrary value to MessagePack bytes
pub fn encode_value(value: &Value) -> Result<Vec<u8>, SerializationError> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, value)
        .map_err(|e| SerializationError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode MessagePack bytes to a value, requiring a map with a string type
pub fn decode_value(bytes: &[u8]) -> Result<Value, SerializationError> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| SerializationError::Decode(e.to_string()))?;
    read_type(&value)?;
    Ok(value)
}

/// Extract the `type` field of a decoded message map
pub fn read_type(value: &Value) -> Result<&str, SerializationError> {
    let map = match value {
        Value::Map(entries) => entries,
        _ => return Err(SerializationError::NotAMap),
    };

    let type_value = map
        .iter()
        .find(|(key, _)| key.as_str() == Some("type"))
        .map(|(_, value)| value)
        .ok_or(SerializationError::MissingType)?;

    type_value.as_str().ok_or(SerializationError::TypeNotString)
}

/// Convert a wire byte field into a fixed 32-byte key
pub fn key_array(field: &'static str, bytes: &[u8]) -> Result<[u8; KEY_LEN], ValidationError> {
    bytes.try_into().map_err(|_| ValidationError::ByteLength {
        field,
        expected: KEY_LEN,
        got: bytes.len(),
    })
}

fn check_len(field: &'static str, bytes: &[u8], expected: usize) -> Result<(), ValidationError> {
    if bytes.len() != expected {
        return Err(ValidationError::ByteLength {
            field,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

fn check_responder_id(field: &'static str, id: u8) -> Result<(), ValidationError> {
    if id < 0x02 {
        return Err(ValidationError::AddressRange {
            field,
            min: 0x02,
            max: 0xff,
            got: id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let bytes = msg.to_bytes().unwrap();
        Message::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_server_hello_roundtrip() {
        let msg = Message::ServerHello(ServerHello {
            key: ByteBuf::from(vec![1u8; KEY_LEN]),
        });
        assert_eq!(roundtrip(msg.clone()), msg);
        assert_eq!(msg.message_type(), "server-hello");
    }

    #[test]
    fn test_client_auth_roundtrip() {
        let msg = Message::ClientAuth(ClientAuth {
            your_cookie: ByteBuf::from(vec![2u8; COOKIE_LEN]),
            subprotocols: Some(vec!["saltyrtc-1.0".into()]),
            ping_interval: Some(20),
            your_key: None,
        });
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_server_auth_roundtrip() {
        let for_initiator = Message::ServerAuth(ServerAuth {
            your_cookie: ByteBuf::from(vec![3u8; COOKIE_LEN]),
            signed_keys: None,
            responders: Some(vec![0x02, 0x03]),
            initiator_connected: None,
        });
        assert_eq!(roundtrip(for_initiator.clone()), for_initiator);

        let for_responder = Message::ServerAuth(ServerAuth {
            your_cookie: ByteBuf::from(vec![3u8; COOKIE_LEN]),
            signed_keys: Some(ByteBuf::from(vec![0u8; SIGNED_KEYS_LEN])),
            responders: None,
            initiator_connected: Some(true),
        });
        assert_eq!(roundtrip(for_responder.clone()), for_responder);
    }

    #[test]
    fn test_peer_handshake_messages_roundtrip() {
        for msg in [
            Message::Token(Token {
                key: ByteBuf::from(vec![5u8; KEY_LEN]),
            }),
            Message::Key(Key {
                key: ByteBuf::from(vec![6u8; KEY_LEN]),
            }),
            Message::Auth(Auth {
                your_cookie: ByteBuf::from(vec![7u8; COOKIE_LEN]),
                task: None,
                tasks: Some(vec!["demo.task".into()]),
                data: [("demo.task".to_string(), Value::Nil)].into_iter().collect(),
            }),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_server_push_messages_roundtrip() {
        for msg in [
            Message::NewInitiator(NewInitiator {}),
            Message::NewResponder(NewResponder { id: 0x04 }),
            Message::DropResponder(DropResponder {
                id: 0x05,
                reason: Some(3004),
            }),
            Message::SendError(SendError {
                id: ByteBuf::from(vec![0x01, 0x02, 0, 0, 0, 0, 0, 1]),
            }),
            Message::Disconnected(Disconnected { id: 0x02 }),
            Message::Close(Close { reason: 3001 }),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_empty_input() {
        let err = Message::from_bytes(&[]).unwrap_err();
        assert!(matches!(
            err,
            SaltlinkError::Serialization(SerializationError::Decode(_))
        ));
    }

    #[test]
    fn test_empty_map_has_no_type() {
        // 0x80 is an empty fixmap
        let err = Message::from_bytes(&[0x80]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Serialization error: Message does not contain a type field"
        );
    }

    #[test]
    fn test_type_must_be_string() {
        // {"type": 1}
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &Value::Map(vec![(Value::String("type".into()), Value::from(1))]),
        )
        .unwrap();
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Serialization error: Message type must be a string"
        );
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &Value::Map(vec![(
                Value::String("type".into()),
                Value::String("hack-the-planet".into()),
            )]),
        )
        .unwrap();
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Serialization error: Unknown message type: hack-the-planet"
        );
    }

    #[test]
    fn test_non_map_top_level() {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::from(42)).unwrap();
        let err = Message::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            SaltlinkError::Serialization(SerializationError::NotAMap)
        ));
    }

    #[test]
    fn test_key_length_validation() {
        let msg = Message::Token(Token {
            key: ByteBuf::from(vec![0u8; 31]),
        });
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::ByteLength {
                field: "key",
                expected: 32,
                got: 31,
            })
        ));
    }

    #[test]
    fn test_responder_id_validation() {
        assert!(Message::NewResponder(NewResponder { id: 0x01 })
            .validate()
            .is_err());
        assert!(Message::NewResponder(NewResponder { id: 0x02 })
            .validate()
            .is_ok());

        let msg = Message::ServerAuth(ServerAuth {
            your_cookie: ByteBuf::from(vec![0u8; COOKIE_LEN]),
            signed_keys: None,
            responders: Some(vec![0x01, 0x02]),
            initiator_connected: None,
        });
        assert!(msg.validate().is_err());

        let msg = Message::ServerAuth(ServerAuth {
            your_cookie: ByteBuf::from(vec![0u8; COOKIE_LEN]),
            signed_keys: None,
            responders: Some(vec![0x02, 0x03, 0x03]),
            initiator_connected: None,
        });
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::Duplicates {
                field: "responders"
            })
        ));
    }

    #[test]
    fn test_auth_task_fields() {
        let base = Auth {
            your_cookie: ByteBuf::from(vec![0u8; COOKIE_LEN]),
            task: None,
            tasks: None,
            data: HashMap::new(),
        };

        assert!(matches!(
            Message::Auth(base.clone()).validate(),
            Err(ValidationError::MissingTaskField)
        ));

        let mut both = base.clone();
        both.task = Some("a".into());
        both.tasks = Some(vec!["a".into()]);
        assert!(matches!(
            Message::Auth(both).validate(),
            Err(ValidationError::AmbiguousTaskField)
        ));

        let mut no_data = base.clone();
        no_data.task = Some("a".into());
        assert!(matches!(
            Message::Auth(no_data).validate(),
            Err(ValidationError::MissingTaskData { .. })
        ));

        let mut ok = base;
        ok.task = Some("a".into());
        ok.data.insert("a".into(), Value::Nil);
        assert!(Message::Auth(ok).validate().is_ok());
    }

    #[test]
    fn test_task_message_preserves_unknown_types() {
        let msg = TaskMessage::build(
            "offer",
            vec![(Value::String("sdp".into()), Value::String("v=0".into()))],
        );
        let bytes = msg.to_bytes().unwrap();

        let value = decode_value(&bytes).unwrap();
        let parsed = TaskMessage::from_value(value).unwrap();
        assert_eq!(parsed.message_type, "offer");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_encoded_maps_carry_field_names() {
        let msg = Message::Key(Key {
            key: ByteBuf::from(vec![1u8; KEY_LEN]),
        });
        let bytes = msg.to_bytes().unwrap();
        let value = rmpv::decode::read_value(&mut &bytes[..]).unwrap();
        let map = match value {
            Value::Map(entries) => entries,
            other => panic!("expected map, got {:?}", other),
        };
        assert!(map.iter().any(|(k, _)| k.as_str() == Some("type")));
        assert!(map.iter().any(|(k, _)| k.as_str() == Some("key")));
    }
}
