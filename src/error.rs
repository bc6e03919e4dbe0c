//! Error types for the chat server and client
//!
//! Defines application-level errors, wire codec errors, queue send errors
//! and the client dial error. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::ActionKind;

/// Application-level errors
///
/// Any of these ends the one connection that produced it. Only the accept
/// loop turns them into process-fatal errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or decoding error (fatal to the connection)
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Client could not reach the server
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// A session task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Wire codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record grew past the configured maximum before its delimiter arrived
    #[error("Frame of {len} bytes exceeds the maximum of {max}")]
    FrameTooLong { len: usize, max: usize },

    /// Escape byte followed by something other than an escaped byte
    #[error("Invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    /// Envelope tag outside the known action kinds
    #[error("Unknown action kind: {0}")]
    UnknownKind(u8),

    /// Envelope bytes could not be parsed (truncated, lengths past the buffer)
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[source] bincode::Error),

    /// Payload bytes do not match the shape its kind declares
    #[error("Malformed {kind:?} payload: {source}")]
    MalformedPayload {
        kind: ActionKind,
        #[source]
        source: bincode::Error,
    },

    /// A valid kind arrived on the side of the connection that never expects it
    #[error("Unexpected action kind: {0:?}")]
    UnexpectedKind(ActionKind),

    #[error("Encode error: {0}")]
    Encode(#[source] bincode::Error),
}

/// Session precondition errors
///
/// Recoverable: reported back to the offending connection as an Error
/// action, the session keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("user must be registered before sending messages")]
    NotRegistered,

    #[error("user is already registered")]
    AlreadyRegistered,

    #[error("username must not be empty")]
    EmptyUsername,

    #[error("username must be at most {max} characters")]
    UsernameTooLong { max: usize },

    #[error("message must be at most {max} characters")]
    MessageTooLong { max: usize },

    /// The roster would no longer fit in one record
    #[error("server is full, try again later")]
    RosterFull,
}

/// Message send errors
///
/// Occurs when enqueueing an action for a connection's writer task.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The peer's outbound queue is full (slow reader)
    #[error("Outbound queue full")]
    QueueFull,
}

/// Client dial failure
#[derive(Debug, Error)]
#[error("Failed to connect to {address}: {source}")]
pub struct ConnectError {
    pub address: String,
    #[source]
    pub source: std::io::Error,
}
