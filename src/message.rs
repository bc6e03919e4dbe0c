//! Message protocol definitions
//!
//! Every record on the wire is an action envelope `{ kind, payload }`. The
//! envelope and the typed payloads are bincode-encoded with fixed-width
//! integers and a `u64` length prefix in front of every string, blob and
//! sequence, so nothing inside a record is delimiter-based. Trailing bytes
//! are allowed, which lets older peers ignore fields appended by newer ones.
//!
//! `ClientAction` and `ServerAction` are the typed views of the two
//! directions of traffic.

use bincode::Options;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, PreconditionError};
use crate::types::User;

/// Action kind tag carried by every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionKind {
    Register = 1,
    Message = 2,
    GetUsers = 3,
    Error = 4,
}

impl ActionKind {
    /// Map a wire tag back to its kind
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ActionKind::Register),
            2 => Some(ActionKind::Message),
            3 => Some(ActionKind::GetUsers),
            4 => Some(ActionKind::Error),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Decoded envelope: a kind tag plus its still-encoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub payload: Bytes,
}

impl Action {
    pub fn new(kind: ActionKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// An action without a payload (e.g. a GetUsers request)
    pub fn empty(kind: ActionKind) -> Self {
        Self::new(kind, Bytes::new())
    }
}

/// Register payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub username: String,
}

/// Chat message payload
///
/// `sender_id` is stamped by the server; whatever a client puts there is
/// overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: String,
    pub text: String,
}

/// Error payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub text: String,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    kind: u8,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct Envelope {
    kind: u8,
    payload: Vec<u8>,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Encode an envelope (without framing)
pub fn encode_action(kind: ActionKind, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    wire_options()
        .serialize(&EnvelopeRef {
            kind: kind.tag(),
            payload,
        })
        .map_err(CodecError::Encode)
}

/// Decode one envelope from the front of `bytes`
///
/// Returns the action and whatever follows the envelope. Declared lengths
/// are bounded by the input length, so a lying length prefix fails instead
/// of allocating.
pub fn decode_action(bytes: &[u8]) -> Result<(Action, &[u8]), CodecError> {
    let mut rest = bytes;
    let envelope: Envelope = wire_options()
        .with_limit(bytes.len() as u64)
        .deserialize_from(&mut rest)
        .map_err(CodecError::MalformedEnvelope)?;

    let kind = ActionKind::from_tag(envelope.kind).ok_or(CodecError::UnknownKind(envelope.kind))?;
    Ok((Action::new(kind, envelope.payload), rest))
}

/// Encode a typed payload
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    wire_options()
        .serialize(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

/// Decode a typed payload for the given kind
pub fn decode_payload<T: DeserializeOwned>(kind: ActionKind, bytes: &[u8]) -> Result<T, CodecError> {
    wire_options()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
        .map_err(|source| CodecError::MalformedPayload { kind, source })
}

/// Client → Server action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Claim a username (required before anything else)
    Register(Register),
    /// Send a chat message to everyone else
    Message(ChatMessage),
    /// Ask for the current roster; carries no payload
    GetUsers,
    /// Client-side error report (logged, otherwise ignored)
    Error(ErrorMessage),
}

impl ClientAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ClientAction::Register(_) => ActionKind::Register,
            ClientAction::Message(_) => ActionKind::Message,
            ClientAction::GetUsers => ActionKind::GetUsers,
            ClientAction::Error(_) => ActionKind::Error,
        }
    }

    pub fn decode(action: &Action) -> Result<Self, CodecError> {
        let payload = &action.payload[..];
        Ok(match action.kind {
            ActionKind::Register => ClientAction::Register(decode_payload(action.kind, payload)?),
            ActionKind::Message => ClientAction::Message(decode_payload(action.kind, payload)?),
            ActionKind::GetUsers => ClientAction::GetUsers,
            ActionKind::Error => ClientAction::Error(decode_payload(action.kind, payload)?),
        })
    }

    pub fn to_action(&self) -> Result<Action, CodecError> {
        let payload = match self {
            ClientAction::Register(register) => encode_payload(register)?,
            ClientAction::Message(message) => encode_payload(message)?,
            ClientAction::GetUsers => Bytes::new(),
            ClientAction::Error(error) => encode_payload(error)?,
        };
        Ok(Action::new(self.kind(), payload))
    }
}

/// Server → Client action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Someone else's chat message, stamped with their identity
    Message(ChatMessage),
    /// Full roster snapshot (sent with the GetUsers kind)
    Users(Vec<User>),
    /// Error addressed to this connection only
    Error(ErrorMessage),
}

impl ServerAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            ServerAction::Message(_) => ActionKind::Message,
            ServerAction::Users(_) => ActionKind::GetUsers,
            ServerAction::Error(_) => ActionKind::Error,
        }
    }

    pub fn decode(action: &Action) -> Result<Self, CodecError> {
        let payload = &action.payload[..];
        match action.kind {
            ActionKind::Message => Ok(ServerAction::Message(decode_payload(action.kind, payload)?)),
            ActionKind::GetUsers => Ok(ServerAction::Users(decode_payload(action.kind, payload)?)),
            ActionKind::Error => Ok(ServerAction::Error(decode_payload(action.kind, payload)?)),
            ActionKind::Register => Err(CodecError::UnexpectedKind(action.kind)),
        }
    }

    pub fn to_action(&self) -> Result<Action, CodecError> {
        let payload = match self {
            ServerAction::Message(message) => encode_payload(message)?,
            ServerAction::Users(users) => encode_payload(users)?,
            ServerAction::Error(error) => encode_payload(error)?,
        };
        Ok(Action::new(self.kind(), payload))
    }
}

/// Convert a precondition failure into the Error action sent back to the client
impl From<PreconditionError> for ServerAction {
    fn from(err: PreconditionError) -> Self {
        ServerAction::Error(ErrorMessage {
            text: err.to_string(),
        })
    }
}
