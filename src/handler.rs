//! TCP connection handler
//!
//! Runs one session per accepted connection: a read task that decodes
//! actions and drives the session state machine, and a write task that
//! drains the connection's outbound queue onto the socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::codec::ActionCodec;
use crate::config::{ServerConfig, MAX_MESSAGE_CHARS, MAX_USERNAME_CHARS};
use crate::error::{AppError, PreconditionError};
use crate::message::{Action, ClientAction, ServerAction};
use crate::server::ServerCommand;
use crate::types::ClientId;

/// How long queued replies may take to flush once the read side is done
pub const WRITE_FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered { username: String },
    Closed,
}

/// What a single inbound action asks the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Store this username and push the roster to everyone
    Register(String),
    /// Relay this text to everyone else
    Broadcast(String),
    /// Reply with the roster
    ListUsers,
    /// Reply with an Error action, session continues
    Reject(PreconditionError),
    /// Nothing to do
    Ignore,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Apply one inbound action, moving to the next state
    pub fn step(&mut self, action: ClientAction) -> Step {
        match *self {
            SessionState::Closed => Step::Ignore,
            SessionState::Unregistered => match action {
                ClientAction::Register(register) => {
                    let username = register.username.trim();
                    if username.is_empty() {
                        return Step::Reject(PreconditionError::EmptyUsername);
                    }
                    if username.chars().count() > MAX_USERNAME_CHARS {
                        return Step::Reject(PreconditionError::UsernameTooLong {
                            max: MAX_USERNAME_CHARS,
                        });
                    }
                    let username = username.to_string();
                    *self = SessionState::Registered {
                        username: username.clone(),
                    };
                    Step::Register(username)
                }
                _ => Step::Reject(PreconditionError::NotRegistered),
            },
            SessionState::Registered { .. } => match action {
                ClientAction::Register(_) => Step::Reject(PreconditionError::AlreadyRegistered),
                ClientAction::Message(message) => {
                    if message.text.chars().count() > MAX_MESSAGE_CHARS {
                        Step::Reject(PreconditionError::MessageTooLong {
                            max: MAX_MESSAGE_CHARS,
                        })
                    } else {
                        Step::Broadcast(message.text)
                    }
                }
                ClientAction::GetUsers => Step::ListUsers,
                ClientAction::Error(error) => {
                    debug!("Client reported error: {}", error.text);
                    Step::Ignore
                }
            },
        }
    }
}

/// Everything a session needs besides its socket
///
/// Created by the accept loop so the outbound queue can be registered with
/// the ChatServer before the session starts reading.
#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    outbound_tx: mpsc::Sender<Action>,
    outbound_rx: mpsc::Receiver<Action>,
    cmd_tx: mpsc::Sender<ServerCommand>,
    read_timeout: Option<Duration>,
    max_frame_length: usize,
}

impl Session {
    pub fn new(client_id: ClientId, cmd_tx: mpsc::Sender<ServerCommand>, config: &ServerConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        Self {
            client_id,
            outbound_tx,
            outbound_rx,
            cmd_tx,
            read_timeout: config.read_timeout,
            max_frame_length: config.max_frame_length,
        }
    }

    /// Sending side of this session's outbound queue
    pub fn outbound(&self) -> mpsc::Sender<Action> {
        self.outbound_tx.clone()
    }
}

/// Handle an accepted TCP connection
///
/// Runs until the peer disconnects, sends something undecodable, or its
/// socket fails. The connection is always unregistered on the way out.
pub async fn handle_connection(stream: TcpStream, session: Session) -> Result<(), AppError> {
    let Session {
        client_id,
        outbound_tx,
        mut outbound_rx,
        cmd_tx,
        read_timeout,
        max_frame_length,
    } = session;

    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("Session {} started for {}", client_id, peer_addr);

    let (read_half, write_half) = stream.into_split();
    let frames = FramedRead::new(read_half, ActionCodec::new(max_frame_length));
    let mut sink = FramedWrite::new(write_half, ActionCodec::new(max_frame_length));

    // Spawn read task (socket -> ServerCommand)
    let cmd_tx_read = cmd_tx.clone();
    let mut read_task = tokio::spawn(read_loop(
        client_id,
        frames,
        outbound_tx,
        cmd_tx_read,
        read_timeout,
    ));

    // Spawn write task (outbound queue -> socket)
    let mut write_task = tokio::spawn(async move {
        while let Some(action) = outbound_rx.recv().await {
            if let Err(e) = sink.send(action).await {
                debug!("Write failed for {}: {}", client_id, e);
                return Err(AppError::from(e));
            }
        }
        let _ = sink.close().await;
        Ok(())
    });

    let result = tokio::select! {
        res = &mut read_task => {
            debug!("Read task completed for {}", client_id);
            joined(client_id, "read", res)
        }
        res = &mut write_task => {
            debug!("Write task completed for {}", client_id);
            read_task.abort();
            joined(client_id, "write", res)
        }
    };

    // Send disconnect command
    let _ = cmd_tx.send(ServerCommand::Disconnect { client_id }).await;

    // Flush replies queued before the read side ended
    if !write_task.is_finished() {
        flush_writer(client_id, write_task, WRITE_FLUSH_GRACE).await;
    }

    info!("Session {} closed", client_id);
    result
}

/// Unwrap a session task's outcome, keeping a panic as an error
fn joined(
    client_id: ClientId,
    task: &str,
    res: Result<Result<(), AppError>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    res.unwrap_or_else(|e| {
        error!("{} task for {} failed: {}", task, client_id, e);
        Err(AppError::Task(e))
    })
}

/// Wait up to `grace` for the writer to drain, then abort it
///
/// Once the Disconnect is processed the actor drops its queue handle, so the
/// writer ends as soon as the queue is empty. A peer that stops reading keeps
/// it blocked on the socket instead.
async fn flush_writer(client_id: ClientId, mut write_task: JoinHandle<Result<(), AppError>>, grace: Duration) {
    match tokio::time::timeout(grace, &mut write_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!("Final flush failed for {}: {}", client_id, e),
        Ok(Err(e)) => error!("write task for {} failed: {}", client_id, e),
        Err(_) => {
            warn!("Writer for {} still blocked after {:?}, dropping it", client_id, grace);
            write_task.abort();
        }
    }
}

/// Read loop: decode actions and drive the session state machine
async fn read_loop(
    client_id: ClientId,
    mut frames: FramedRead<OwnedReadHalf, ActionCodec>,
    outbound_tx: mpsc::Sender<Action>,
    cmd_tx: mpsc::Sender<ServerCommand>,
    read_timeout: Option<Duration>,
) -> Result<(), AppError> {
    let mut state = SessionState::Unregistered;

    while !state.is_closed() {
        let next = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("Client {} idle for {:?}, closing", client_id, limit);
                    state = SessionState::Closed;
                    continue;
                }
            },
            None => frames.next().await,
        };

        let action = match next {
            Some(Ok(action)) => action,
            Some(Err(e)) => {
                warn!("Invalid frame from {}: {}", client_id, e);
                return Err(e.into());
            }
            None => {
                debug!("Client {} closed the connection", client_id);
                state = SessionState::Closed;
                continue;
            }
        };

        let request = ClientAction::decode(&action).map_err(|e| {
            warn!("Invalid {:?} payload from {}: {}", action.kind, client_id, e);
            AppError::from(e)
        })?;

        let cmd = match state.step(request) {
            Step::Register(username) => {
                let (respond_to, accepted) = oneshot::channel();
                cmd_tx
                    .send(ServerCommand::Register {
                        client_id,
                        username,
                        respond_to,
                    })
                    .await
                    .map_err(|_| AppError::ChannelSend)?;
                if let Err(reason) = accepted.await.map_err(|_| AppError::ChannelSend)? {
                    debug!("Registration of {} refused: {}", client_id, reason);
                    state = SessionState::Unregistered;
                    reply(&outbound_tx, reason).await?;
                }
                continue;
            }
            Step::Broadcast(text) => ServerCommand::Message { client_id, text },
            Step::ListUsers => ServerCommand::ListUsers { client_id },
            Step::Reject(reason) => {
                debug!("Rejecting {:?} from {}: {}", action.kind, client_id, reason);
                reply(&outbound_tx, reason).await?;
                continue;
            }
            Step::Ignore => continue,
        };

        if cmd_tx.send(cmd).await.is_err() {
            debug!("Server closed, ending read task for {}", client_id);
            return Err(AppError::ChannelSend);
        }
    }

    Ok(())
}

/// Queue an Error action for this session's peer
async fn reply(outbound_tx: &mpsc::Sender<Action>, reason: PreconditionError) -> Result<(), AppError> {
    let action = ServerAction::from(reason).to_action()?;
    outbound_tx
        .send(action)
        .await
        .map_err(|_| AppError::ChannelSend)
}
