//! Domain events fanned out by the event bus.
//!
//! Events are immutable once published. Within one room every adapter sees
//! them in publish order.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::collab::StoredMessage;
use crate::room::{RoomId, UserId};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Posted by a member.
    User,
    /// Generated on membership changes.
    System,
    /// Server-initiated, not attributed to a user.
    Announcement,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::System => "system",
            MessageKind::Announcement => "announcement",
        }
    }
}

/// A room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    UserJoined {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        ts: u64,
    },
    UserLeft {
        room_id: RoomId,
        user_id: UserId,
        username: String,
        ts: u64,
    },
    MessagePosted {
        room_id: RoomId,
        message_id: String,
        user_id: Option<UserId>,
        username: String,
        text: String,
        ts: u64,
        kind: MessageKind,
    },
    RoomDeleted {
        room_id: RoomId,
        ts: u64,
        reason: String,
    },
}

impl Event {
    #[must_use]
    pub fn user_joined(room_id: &str, user_id: &str, username: &str) -> Self {
        Event::UserJoined {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            ts: now_millis(),
        }
    }

    #[must_use]
    pub fn user_left(room_id: &str, user_id: &str, username: &str) -> Self {
        Event::UserLeft {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            ts: now_millis(),
        }
    }

    #[must_use]
    pub fn room_deleted(room_id: &str, reason: impl Into<String>) -> Self {
        Event::RoomDeleted {
            room_id: room_id.to_string(),
            ts: now_millis(),
            reason: reason.into(),
        }
    }

    /// The room this event is scoped to.
    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            Event::UserJoined { room_id, .. }
            | Event::UserLeft { room_id, .. }
            | Event::MessagePosted { room_id, .. }
            | Event::RoomDeleted { room_id, .. } => room_id,
        }
    }

    #[must_use]
    pub fn ts(&self) -> u64 {
        match self {
            Event::UserJoined { ts, .. }
            | Event::UserLeft { ts, .. }
            | Event::MessagePosted { ts, .. }
            | Event::RoomDeleted { ts, .. } => *ts,
        }
    }

    /// Short label, used for logging and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::UserJoined { .. } => "user_joined",
            Event::UserLeft { .. } => "user_left",
            Event::MessagePosted { .. } => "message_posted",
            Event::RoomDeleted { .. } => "room_deleted",
        }
    }
}

impl From<&StoredMessage> for Event {
    fn from(message: &StoredMessage) -> Self {
        Event::MessagePosted {
            room_id: message.room_id.clone(),
            message_id: message.id.clone(),
            user_id: message.user_id.clone(),
            username: message.username.clone(),
            text: message.text.clone(),
            ts: message.created_at,
            kind: message.kind,
        }
    }
}
