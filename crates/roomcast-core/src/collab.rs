//! Collaborator interfaces.
//!
//! Identity, message persistence and room metadata live outside the core.
//! In-memory implementations are in [`crate::memory`].

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ChatError;
use crate::event::MessageKind;
use crate::room::{RoomId, RoomInfo, UserId};

/// A verified user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Maps an opaque credential to a user.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a credential.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthenticated`] if the credential is rejected.
    async fn verify(&self, credential: &str) -> Result<Identity, ChatError>;
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: RoomId,
    /// `None` for announcements.
    pub user_id: Option<UserId>,
    pub username: String,
    pub text: String,
    pub kind: MessageKind,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub user_id: Option<UserId>,
    pub username: String,
    pub text: String,
    pub kind: MessageKind,
}

impl NewMessage {
    #[must_use]
    pub fn user(room_id: &str, identity: &Identity, text: impl Into<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: Some(identity.user_id.clone()),
            username: identity.username.clone(),
            text: text.into(),
            kind: MessageKind::User,
        }
    }

    #[must_use]
    pub fn system(room_id: &str, user_id: &str, username: &str, text: impl Into<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: Some(user_id.to_string()),
            username: username.to_string(),
            text: text.into(),
            kind: MessageKind::System,
        }
    }

    #[must_use]
    pub fn announcement(room_id: &str, text: impl Into<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: None,
            username: "System".to_string(),
            text: text.into(),
            kind: MessageKind::Announcement,
        }
    }
}

/// Append-only message history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and assign its id and timestamp.
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, ChatError>;

    /// The newest `limit` messages after skipping the `skip` newest,
    /// returned oldest first.
    async fn list_by_room(
        &self,
        room_id: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredMessage>, ChatError>;

    /// Drop a deleted room's history. Returns how many messages went.
    async fn purge(&self, room_id: &str) -> Result<usize, ChatError>;
}

/// A validated room to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDraft {
    pub name: String,
    pub description: Option<String>,
    pub capacity: usize,
    pub created_by: UserId,
}

/// Room metadata store.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Create a room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNameTaken`] if the name is in use.
    async fn create(&self, draft: RoomDraft) -> Result<RoomInfo, ChatError>;

    async fn get(&self, room_id: &str) -> Result<Option<RoomInfo>, ChatError>;

    /// All rooms, oldest first.
    async fn list(&self) -> Result<Vec<RoomInfo>, ChatError>;

    /// Remove a room. Returns `false` if it did not exist.
    async fn delete(&self, room_id: &str) -> Result<bool, ChatError>;
}
