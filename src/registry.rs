//! Connection registry
//!
//! Maps each live connection identity to the handle used to reach its
//! writer task. The registry is owned by the `ChatServer` actor, so insert,
//! remove and broadcast iteration never interleave.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::message::Action;
use crate::types::ClientId;

/// Live connection handle
///
/// Holds the sending side of the connection's bounded outbound queue. The
/// connection's writer task is the only thing that writes to its socket.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Server → Client action queue
    sender: mpsc::Sender<Action>,
}

impl Connection {
    pub fn new(id: ClientId, sender: mpsc::Sender<Action>) -> Self {
        Self { id, sender }
    }

    /// Enqueue an action without waiting
    ///
    /// A full queue means the peer is not keeping up; the action is not
    /// delivered.
    pub fn try_send(&self, action: Action) -> Result<(), SendError> {
        self.sender.try_send(action).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// Identity → connection handle map
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ClientId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning any handle previously stored under its id
    pub fn register(&mut self, connection: Connection) -> Option<Connection> {
        let previous = self.connections.insert(connection.id, connection);
        if let Some(previous) = &previous {
            warn!("Connection {} registered twice, replacing handle", previous.id);
        }
        previous
    }

    pub fn unregister(&mut self, id: &ClientId) -> Option<Connection> {
        self.connections.remove(id)
    }

    pub fn lookup(&self, id: &ClientId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send directly to one connection
    pub fn send_to(&self, id: &ClientId, action: Action) -> Result<(), SendError> {
        match self.connections.get(id) {
            Some(connection) => connection.try_send(action),
            None => Err(SendError::ChannelClosed),
        }
    }

    /// Send `action` to every connection except `exclude`
    ///
    /// A failing peer is logged and skipped. Returns the number of peers the
    /// action was queued for.
    pub fn broadcast(&self, exclude: Option<ClientId>, action: &Action) -> usize {
        let mut delivered = 0;
        for (id, connection) in &self.connections {
            if Some(*id) == exclude {
                continue;
            }
            match connection.try_send(action.clone()) {
                Ok(()) => delivered += 1,
                Err(SendError::QueueFull) => {
                    warn!("Outbound queue full for {}, dropping {:?}", id, action.kind);
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Connection {} already closed, skipping {:?}", id, action.kind);
                }
            }
        }
        delivered
    }
}
