//! ChatServer Actor implementation
//!
//! The central actor that owns all shared state: the connection registry and
//! the identity → user map. Uses the Actor pattern with mpsc channels for
//! message passing, so every mutation and every broadcast runs on one task.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Encoder;
use tracing::{debug, error, info, warn};

use crate::codec::{ActionCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::PreconditionError;
use crate::message::{Action, ChatMessage, ServerAction};
use crate::registry::{Connection, ConnectionRegistry};
use crate::types::{ClientId, User};

/// Commands sent from the accept loop and session handlers to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection accepted
    Connect {
        client_id: ClientId,
        sender: mpsc::Sender<Action>,
    },
    /// Connection closed
    Disconnect {
        client_id: ClientId,
    },
    /// Store the username and push the roster to everyone
    Register {
        client_id: ClientId,
        username: String,
        respond_to: oneshot::Sender<Result<(), PreconditionError>>,
    },
    /// Broadcast a chat message to everyone but the sender
    Message {
        client_id: ClientId,
        text: String,
    },
    /// Send the roster to one connection
    ListUsers {
        client_id: ClientId,
    },
    /// Registry lookup
    Lookup {
        client_id: ClientId,
        respond_to: oneshot::Sender<Option<Connection>>,
    },
}

/// The main ChatServer actor
///
/// Processes commands from the accept loop and session handlers in arrival
/// order.
pub struct ChatServer {
    /// All live connections: ClientId -> Connection
    registry: ConnectionRegistry,
    /// Registered users: ClientId -> User
    users: HashMap<ClientId, User>,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Largest record a roster may encode to
    max_frame_length: usize,
}

impl ChatServer {
    /// Create a new ChatServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<ServerCommand>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            users: HashMap::new(),
            receiver,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Cap the roster at what fits in one record of `max_frame_length` bytes
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { client_id, sender } => {
                self.handle_connect(client_id, sender);
            }
            ServerCommand::Disconnect { client_id } => {
                self.handle_disconnect(client_id);
            }
            ServerCommand::Register {
                client_id,
                username,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_register(client_id, username));
            }
            ServerCommand::Message { client_id, text } => {
                self.handle_message(client_id, text);
            }
            ServerCommand::ListUsers { client_id } => {
                self.handle_list_users(client_id);
            }
            ServerCommand::Lookup {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.lookup(&client_id).cloned());
            }
        }
    }

    /// Handle new connection
    fn handle_connect(&mut self, client_id: ClientId, sender: mpsc::Sender<Action>) {
        info!("Client {} connected", client_id);
        self.registry.register(Connection::new(client_id, sender));
        debug!(
            "Total connections: {}, registered users: {}",
            self.registry.len(),
            self.users.len()
        );
    }

    /// Handle connection close
    ///
    /// A departing registered user triggers a roster refresh for everyone left.
    fn handle_disconnect(&mut self, client_id: ClientId) {
        info!("Client {} disconnected", client_id);

        self.registry.unregister(&client_id);
        if let Some(user) = self.users.remove(&client_id) {
            info!("User '{}' left", user.username);
            self.broadcast_users();
        }

        debug!(
            "Total connections: {}, registered users: {}",
            self.registry.len(),
            self.users.len()
        );
    }

    /// Handle registration
    ///
    /// Refused when the roster including the newcomer would no longer fit in
    /// one record.
    fn handle_register(&mut self, client_id: ClientId, username: String) -> Result<(), PreconditionError> {
        if !self.registry.contains(&client_id) {
            debug!("Register from closed connection {}, ignoring", client_id);
            return Ok(());
        }
        if let Some(existing) = self.users.get(&client_id) {
            warn!(
                "Client {} already registered as '{}', ignoring '{}'",
                client_id, existing.username, username
            );
            return Err(PreconditionError::AlreadyRegistered);
        }

        let user = User::new(client_id, username);
        let mut roster = self.users_snapshot();
        roster.push(user.clone());
        if !self.fits_in_frame(&ServerAction::Users(roster)) {
            warn!(
                "Roster is full at {} users, refusing '{}' from {}",
                self.users.len(),
                user.username,
                client_id
            );
            return Err(PreconditionError::RosterFull);
        }

        info!("Client {} registered as '{}'", client_id, user.username);
        self.users.insert(client_id, user);
        self.broadcast_users();
        Ok(())
    }

    /// Handle chat message
    fn handle_message(&mut self, client_id: ClientId, text: String) {
        let Some(user) = self.users.get(&client_id) else {
            warn!("Message from unregistered client {}, dropping", client_id);
            return;
        };

        debug!("Message from '{}' ({} chars)", user.username, text.chars().count());

        let message = ServerAction::Message(ChatMessage {
            sender_id: client_id.to_string(),
            text,
        });
        let Some(action) = encode(&message) else {
            return;
        };
        self.registry.broadcast(Some(client_id), &action);
    }

    /// Handle roster request
    fn handle_list_users(&self, client_id: ClientId) {
        let Some(action) = encode(&ServerAction::Users(self.users_snapshot())) else {
            return;
        };
        if let Err(e) = self.registry.send_to(&client_id, action) {
            warn!("Failed to send roster to {}: {}", client_id, e);
        }
    }

    /// Helper: Push the current roster to every connection
    fn broadcast_users(&self) {
        let Some(action) = encode(&ServerAction::Users(self.users_snapshot())) else {
            return;
        };
        let delivered = self.registry.broadcast(None, &action);
        debug!("Roster of {} sent to {} connections", self.users.len(), delivered);
    }

    /// Helper: Whether `action` encodes to a record peers will accept
    fn fits_in_frame(&self, action: &ServerAction) -> bool {
        let Some(action) = encode(action) else {
            return false;
        };
        let mut codec = ActionCodec::new(self.max_frame_length);
        codec.encode(action, &mut BytesMut::new()).is_ok()
    }

    /// Helper: Roster snapshot ordered by username, then identity
    fn users_snapshot(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        users
    }
}

fn encode(action: &ServerAction) -> Option<Action> {
    match action.to_action() {
        Ok(action) => Some(action),
        Err(e) => {
            error!("Failed to encode {:?}: {}", action.kind(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ActionKind;

    struct Harness {
        cmd_tx: mpsc::Sender<ServerCommand>,
    }

    impl Harness {
        fn start() -> Self {
            Self::start_with(ChatServer::new)
        }

        fn start_with(build: impl FnOnce(mpsc::Receiver<ServerCommand>) -> ChatServer) -> Self {
            let (cmd_tx, cmd_rx) = mpsc::channel(32);
            tokio::spawn(build(cmd_rx).run());
            Self { cmd_tx }
        }

        async fn connect(&self) -> (ClientId, mpsc::Receiver<Action>) {
            let client_id = ClientId::new();
            let (tx, rx) = mpsc::channel(32);
            self.send(ServerCommand::Connect {
                client_id,
                sender: tx,
            })
            .await;
            (client_id, rx)
        }

        async fn send(&self, cmd: ServerCommand) {
            self.cmd_tx.send(cmd).await.unwrap();
        }

        async fn register(&self, client_id: ClientId, username: &str) -> Result<(), PreconditionError> {
            let (respond_to, rx) = oneshot::channel();
            self.send(ServerCommand::Register {
                client_id,
                username: username.to_string(),
                respond_to,
            })
            .await;
            rx.await.unwrap()
        }

        async fn lookup(&self, client_id: ClientId) -> Option<Connection> {
            let (respond_to, rx) = oneshot::channel();
            self.send(ServerCommand::Lookup {
                client_id,
                respond_to,
            })
            .await;
            rx.await.unwrap()
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Action>) -> ServerAction {
        let action = rx.recv().await.unwrap();
        ServerAction::decode(&action).unwrap()
    }

    fn usernames(action: ServerAction) -> Vec<String> {
        match action {
            ServerAction::Users(users) => users.into_iter().map(|u| u.username).collect(),
            other => panic!("expected roster, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_broadcasts_roster_to_all() {
        let server = Harness::start();
        let (alice, mut alice_rx) = server.connect().await;
        let (bob, mut bob_rx) = server.connect().await;

        server.register(alice, "alice").await.unwrap();
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);
        assert_eq!(usernames(next(&mut bob_rx).await), vec!["alice"]);

        server.register(bob, "bob").await.unwrap();
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice", "bob"]);
        assert_eq!(usernames(next(&mut bob_rx).await), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_message_is_stamped_and_not_echoed() {
        let server = Harness::start();
        let (alice, mut alice_rx) = server.connect().await;
        let (_bob, mut bob_rx) = server.connect().await;

        server.register(alice, "alice").await.unwrap();
        next(&mut alice_rx).await;
        next(&mut bob_rx).await;

        server
            .send(ServerCommand::Message {
                client_id: alice,
                text: "hi".to_string(),
            })
            .await;

        assert_eq!(
            next(&mut bob_rx).await,
            ServerAction::Message(ChatMessage {
                sender_id: alice.to_string(),
                text: "hi".to_string(),
            })
        );

        // Round-trip through the actor so the message has been processed
        assert!(server.lookup(alice).await.is_some());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_from_unregistered_is_dropped() {
        let server = Harness::start();
        let (anon, _anon_rx) = server.connect().await;
        let (_other, mut other_rx) = server.connect().await;

        server
            .send(ServerCommand::Message {
                client_id: anon,
                text: "sneaky".to_string(),
            })
            .await;
        assert!(server.lookup(anon).await.is_some());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_removes_and_refreshes_roster() {
        let server = Harness::start();
        let (alice, mut alice_rx) = server.connect().await;
        let (bob, mut bob_rx) = server.connect().await;

        for (id, name) in [(alice, "alice"), (bob, "bob")] {
            server.register(id, name).await.unwrap();
        }
        for _ in 0..2 {
            next(&mut alice_rx).await;
            next(&mut bob_rx).await;
        }

        server.send(ServerCommand::Disconnect { client_id: bob }).await;
        assert!(server.lookup(bob).await.is_none());
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);

        // Later broadcasts skip the closed connection entirely
        server
            .send(ServerCommand::Message {
                client_id: alice,
                text: "anyone?".to_string(),
            })
            .await;
        assert!(server.lookup(alice).await.is_some());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_users_goes_to_requester_only() {
        let server = Harness::start();
        let (alice, mut alice_rx) = server.connect().await;
        let (_bob, mut bob_rx) = server.connect().await;

        server.register(alice, "alice").await.unwrap();
        next(&mut alice_rx).await;
        next(&mut bob_rx).await;

        server.send(ServerCommand::ListUsers { client_id: alice }).await;
        let action = alice_rx.recv().await.unwrap();
        assert_eq!(action.kind, ActionKind::GetUsers);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_register_keeps_first_username() {
        let server = Harness::start();
        let (alice, mut alice_rx) = server.connect().await;

        server.register(alice, "alice").await.unwrap();
        assert_eq!(
            server.register(alice, "mallory").await,
            Err(PreconditionError::AlreadyRegistered)
        );
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);

        server.send(ServerCommand::ListUsers { client_id: alice }).await;
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_register_refused_once_roster_outgrows_a_frame() {
        let alice = ClientId::new();
        let solo = ServerAction::Users(vec![User::new(alice, "alice")])
            .to_action()
            .unwrap();
        let mut record = BytesMut::new();
        ActionCodec::default().encode(solo, &mut record).unwrap();
        let limit = record.len() - 1;

        let server = Harness::start_with(|rx| ChatServer::new(rx).with_max_frame_length(limit));
        let (tx, mut alice_rx) = mpsc::channel(32);
        server
            .send(ServerCommand::Connect {
                client_id: alice,
                sender: tx,
            })
            .await;
        let (bob, mut bob_rx) = server.connect().await;

        // A roster of exactly `limit` bytes is still accepted
        server.register(alice, "alice").await.unwrap();
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);
        assert_eq!(usernames(next(&mut bob_rx).await), vec!["alice"]);

        assert_eq!(
            server.register(bob, "bob").await,
            Err(PreconditionError::RosterFull)
        );
        server.send(ServerCommand::ListUsers { client_id: alice }).await;
        assert_eq!(usernames(next(&mut alice_rx).await), vec!["alice"]);
        assert!(bob_rx.try_recv().is_err());
    }
}
