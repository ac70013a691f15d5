//! Frame types for the Roomcast protocol.
//!
//! Frames are the unit of communication on both transports: the push
//! channel carries them MessagePack-encoded, the bridge subscription stream
//! carries them as JSON. Event frames have the same fields either way.

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Stable error codes carried by [`Frame::Error`].
pub mod codes {
    pub const INVALID_FRAME: u16 = 1000;
    pub const UNAUTHENTICATED: u16 = 1001;
    pub const UNSUPPORTED_VERSION: u16 = 1002;
    pub const ROOM_NOT_FOUND: u16 = 1004;
    pub const ROOM_FULL: u16 = 1005;
    pub const NOT_A_MEMBER: u16 = 1006;
    pub const INVALID_MESSAGE: u16 = 1007;
    pub const INVALID_ROOM: u16 = 1008;
    pub const ROOM_NAME_TAKEN: u16 = 1009;
    pub const INTERNAL: u16 = 1500;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Join = 0x02,
    Leave = 0x03,
    Post = 0x04,
    Pong = 0x05,
    Connected = 0x10,
    Joined = 0x11,
    Ack = 0x12,
    Error = 0x13,
    Ping = 0x14,
    UserJoined = 0x20,
    UserLeft = 0x21,
    MessagePosted = 0x22,
    RoomDeleted = 0x23,
    Evicted = 0x24,
}

impl FrameType {
    /// Short label, used for logging and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Join => "join",
            FrameType::Leave => "leave",
            FrameType::Post => "post",
            FrameType::Pong => "pong",
            FrameType::Connected => "connected",
            FrameType::Joined => "joined",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::UserJoined => "user_joined",
            FrameType::UserLeft => "user_left",
            FrameType::MessagePosted => "message_posted",
            FrameType::RoomDeleted => "room_deleted",
            FrameType::Evicted => "evicted",
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Join),
            0x03 => Ok(FrameType::Leave),
            0x04 => Ok(FrameType::Post),
            0x05 => Ok(FrameType::Pong),
            0x10 => Ok(FrameType::Connected),
            0x11 => Ok(FrameType::Joined),
            0x12 => Ok(FrameType::Ack),
            0x13 => Ok(FrameType::Error),
            0x14 => Ok(FrameType::Ping),
            0x20 => Ok(FrameType::UserJoined),
            0x21 => Ok(FrameType::UserLeft),
            0x22 => Ok(FrameType::MessagePosted),
            0x23 => Ok(FrameType::RoomDeleted),
            0x24 => Ok(FrameType::Evicted),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Kind of a posted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    System,
    Announcement,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake; must be the first frame a push client sends.
    Connect {
        /// Client protocol version.
        version: Version,
        /// Credential for the identity provider.
        token: String,
    },

    /// Request to join a room.
    Join {
        /// Request ID, echoed in the reply.
        id: u64,
        room_id: String,
    },

    /// Request to leave a room.
    Leave {
        /// Request ID, echoed in the reply.
        id: u64,
        room_id: String,
    },

    /// Post a chat message.
    Post {
        /// Request ID, echoed in the reply.
        id: u64,
        room_id: String,
        text: String,
    },

    /// Heartbeat reply.
    Pong {
        room_id: String,
        /// Required on the bridge; the push channel knows its own connection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },

    /// Handshake accepted.
    Connected {
        connection_id: String,
        user_id: String,
        username: String,
        version: Version,
        /// Probe interval in milliseconds.
        heartbeat_ms: u64,
    },

    /// Join acknowledgement.
    Joined {
        id: u64,
        room_id: String,
        name: String,
        active_users: usize,
    },

    /// Generic acknowledgement.
    Ack { id: u64 },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Heartbeat probe. Carries no payload.
    Ping,

    UserJoined {
        room_id: String,
        user_id: String,
        username: String,
        ts: u64,
    },

    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
        ts: u64,
    },

    MessagePosted {
        room_id: String,
        message_id: String,
        /// Absent for announcements.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        username: String,
        text: String,
        ts: u64,
        kind: MessageKind,
    },

    RoomDeleted {
        room_id: String,
        ts: u64,
        reason: String,
    },

    /// The receiving connection was removed from a room by the server.
    Evicted { room_id: String, reason: String },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Post { .. } => FrameType::Post,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Joined { .. } => FrameType::Joined,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping => FrameType::Ping,
            Frame::UserJoined { .. } => FrameType::UserJoined,
            Frame::UserLeft { .. } => FrameType::UserLeft,
            Frame::MessagePosted { .. } => FrameType::MessagePosted,
            Frame::RoomDeleted { .. } => FrameType::RoomDeleted,
            Frame::Evicted { .. } => FrameType::Evicted,
        }
    }

    /// The room a broadcast frame belongs to, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Frame::UserJoined { room_id, .. }
            | Frame::UserLeft { room_id, .. }
            | Frame::MessagePosted { room_id, .. }
            | Frame::RoomDeleted { room_id, .. }
            | Frame::Evicted { room_id, .. }
            | Frame::Joined { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn connect(version: Version, token: impl Into<String>) -> Self {
        Frame::Connect {
            version,
            token: token.into(),
        }
    }

    #[must_use]
    pub fn join(id: u64, room_id: impl Into<String>) -> Self {
        Frame::Join {
            id,
            room_id: room_id.into(),
        }
    }

    #[must_use]
    pub fn leave(id: u64, room_id: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            room_id: room_id.into(),
        }
    }

    #[must_use]
    pub fn post(id: u64, room_id: impl Into<String>, text: impl Into<String>) -> Self {
        Frame::Post {
            id,
            room_id: room_id.into(),
            text: text.into(),
        }
    }

    #[must_use]
    pub fn pong(room_id: impl Into<String>) -> Self {
        Frame::Pong {
            room_id: room_id.into(),
            connection_id: None,
        }
    }

    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Serialize as JSON for text-based channels.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a frame from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::join(1, "lobby").frame_type(), FrameType::Join);
        assert_eq!(Frame::Ping.frame_type(), FrameType::Ping);
        assert_eq!(FrameType::try_from(0x22), Ok(FrameType::MessagePosted));
        assert!(FrameType::try_from(0x7f).is_err());
    }

    #[test]
    fn test_event_frame_json_shape() {
        let frame = Frame::MessagePosted {
            room_id: "r1".into(),
            message_id: "m1".into(),
            user_id: None,
            username: "System".into(),
            text: "hello".into(),
            ts: 42,
            kind: MessageKind::Announcement,
        };

        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "message_posted");
        assert_eq!(value["kind"], "announcement");
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn test_pong_connection_id_defaults() {
        let frame: Frame = serde_json::from_str(r#"{"type":"pong","room_id":"r1"}"#).unwrap();
        assert_eq!(frame, Frame::pong("r1"));
    }

    #[test]
    fn test_room_id_accessor() {
        let frame = Frame::Evicted {
            room_id: "r9".into(),
            reason: "timeout".into(),
        };
        assert_eq!(frame.room_id(), Some("r9"));
        assert_eq!(Frame::ack(3).room_id(), None);
    }
}
