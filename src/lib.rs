//! TCP Chat Server and Client Library
//!
//! A chat service over plain TCP: the server tracks connected users and
//! relays each chat message to everyone but its sender; the client registers
//! a username and exchanges messages over the same wire protocol.
//!
//! # Wire protocol
//! Newline-terminated records, each one byte-stuffed action envelope
//! `{ kind, payload }` with length-prefixed fields (see `codec` and `message`).
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the connection registry and user map
//! - Each connection has a read task driving its session state machine
//!   and a write task draining a bounded outbound queue
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use tcp_chat::{listener, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     listener::run(ServerConfig::new("127.0.0.1:8080")).await.unwrap();
//! }
//! ```

pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use codec::ActionCodec;
pub use config::ServerConfig;
pub use error::{AppError, CodecError, ConnectError, PreconditionError, SendError};
pub use handler::{handle_connection, Session, SessionState};
pub use message::{
    decode_action, encode_action, Action, ActionKind, ChatMessage, ClientAction, ErrorMessage,
    Register, ServerAction,
};
pub use registry::{Connection, ConnectionRegistry};
pub use server::{ChatServer, ServerCommand};
pub use transport::{ChatClient, ClientEvent};
pub use types::{ClientId, User};
