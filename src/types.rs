//! Basic type definitions for the chat server
//!
//! Provides:
//! - `ClientId`: UUID-based unique connection identity
//! - `User`: the roster entry shared with every client

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique connection identity (newtype pattern)
///
/// Minted once per accepted connection and never reused.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Roster entry
///
/// `id` is the string form of the owner's `ClientId`. `username` is empty
/// until the connection registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

impl User {
    pub fn new(id: ClientId, username: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            username: username.into(),
        }
    }
}
