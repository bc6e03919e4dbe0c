//! Client transport
//!
//! Dials the server, writes framed actions, and runs a background read loop
//! that turns incoming frames into `ClientEvent`s for the UI.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::{ActionCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::{AppError, CodecError, ConnectError};
use crate::message::{Action, ActionKind, ChatMessage, ClientAction, Register, ServerAction};
use crate::types::User;

/// Event delivered to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Append to the transcript
    Message(ChatMessage),
    /// Replace the roster
    Users(Vec<User>),
    /// Surface to the user
    Error(String),
    /// The read loop ended; no more events follow
    Disconnected,
}

/// Connected chat client
///
/// Owns the write half of the connection. The read half lives in the task
/// returned by `connect`.
#[derive(Debug)]
pub struct ChatClient {
    sink: FramedWrite<OwnedWriteHalf, ActionCodec>,
}

impl ChatClient {
    /// Dial `address` and start the read loop feeding `events`
    pub async fn connect(
        address: &str,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(Self, JoinHandle<()>), ConnectError> {
        Self::connect_with_max_frame_length(address, events, DEFAULT_MAX_FRAME_LENGTH).await
    }

    /// Like `connect`, for a server configured with a non-default record limit
    pub async fn connect_with_max_frame_length(
        address: &str,
        events: mpsc::Sender<ClientEvent>,
        max_frame_length: usize,
    ) -> Result<(Self, JoinHandle<()>), ConnectError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ConnectError {
                address: address.to_string(),
                source,
            })?;
        info!("Connected to {}", address);

        let (read_half, write_half) = stream.into_split();
        let frames = FramedRead::new(read_half, ActionCodec::new(max_frame_length));
        let reader = tokio::spawn(read_loop(frames, events));

        Ok((
            Self {
                sink: FramedWrite::new(write_half, ActionCodec::new(max_frame_length)),
            },
            reader,
        ))
    }

    /// Encode and write one typed action
    pub async fn send(&mut self, request: &ClientAction) -> Result<(), AppError> {
        let action = request.to_action()?;
        self.sink.send(action).await?;
        Ok(())
    }

    /// Write one action from a raw kind and already encoded payload
    pub async fn send_action(&mut self, kind: ActionKind, payload: Bytes) -> Result<(), AppError> {
        self.sink.send(Action::new(kind, payload)).await?;
        Ok(())
    }

    pub async fn register(&mut self, username: &str) -> Result<(), AppError> {
        self.send(&ClientAction::Register(Register {
            username: username.to_string(),
        }))
        .await
    }

    /// Send a chat message; the server fills in the sender
    pub async fn send_message(&mut self, text: &str) -> Result<(), AppError> {
        self.send(&ClientAction::Message(ChatMessage {
            sender_id: String::new(),
            text: text.to_string(),
        }))
        .await
    }

    pub async fn request_users(&mut self) -> Result<(), AppError> {
        self.send(&ClientAction::GetUsers).await
    }

    /// Flush and shut down the write side
    pub async fn close(mut self) -> Result<(), AppError> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Read loop: decode frames and forward them to the UI
///
/// Ends on EOF, on a framing error, or when the UI drops its receiver.
async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, ActionCodec>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(frame) = frames.next().await {
        let action = match frame {
            Ok(action) => action,
            Err(e) => {
                warn!("Invalid frame from server: {}", e);
                break;
            }
        };

        let event = match ServerAction::decode(&action) {
            Ok(ServerAction::Message(message)) => ClientEvent::Message(message),
            Ok(ServerAction::Users(users)) => ClientEvent::Users(users),
            Ok(ServerAction::Error(error)) => ClientEvent::Error(error.text),
            Err(CodecError::UnexpectedKind(kind)) => {
                warn!("Ignoring unexpected {:?} action from server", kind);
                continue;
            }
            Err(e) => {
                warn!("Invalid payload from server: {}", e);
                break;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, ending read loop");
            return;
        }
    }

    debug!("Server connection closed");
    let _ = events.send(ClientEvent::Disconnected).await;
}
