//! Mapping between core events and wire frames.
//!
//! Both adapters go through these functions, so a given event or error
//! looks the same on either transport.

use roomcast_core::{ChatError, Event, StoredMessage};
use roomcast_protocol::{codes, Frame, MessageKind};

fn kind(kind: roomcast_core::MessageKind) -> MessageKind {
    match kind {
        roomcast_core::MessageKind::User => MessageKind::User,
        roomcast_core::MessageKind::System => MessageKind::System,
        roomcast_core::MessageKind::Announcement => MessageKind::Announcement,
    }
}

/// The frame carrying a room event.
#[must_use]
pub fn event_frame(event: &Event) -> Frame {
    match event.clone() {
        Event::UserJoined {
            room_id,
            user_id,
            username,
            ts,
        } => Frame::UserJoined {
            room_id,
            user_id,
            username,
            ts,
        },
        Event::UserLeft {
            room_id,
            user_id,
            username,
            ts,
        } => Frame::UserLeft {
            room_id,
            user_id,
            username,
            ts,
        },
        Event::MessagePosted {
            room_id,
            message_id,
            user_id,
            username,
            text,
            ts,
            kind: k,
        } => Frame::MessagePosted {
            room_id,
            message_id,
            user_id,
            username,
            text,
            ts,
            kind: kind(k),
        },
        Event::RoomDeleted {
            room_id,
            ts,
            reason,
        } => Frame::RoomDeleted {
            room_id,
            ts,
            reason,
        },
    }
}

/// A stored message as a `MessagePosted` frame, for private delivery.
#[must_use]
pub fn message_frame(message: &StoredMessage) -> Frame {
    event_frame(&Event::from(message))
}

/// Stable wire code for a chat error.
#[must_use]
pub fn error_code(err: &ChatError) -> u16 {
    match err {
        ChatError::Unauthenticated => codes::UNAUTHENTICATED,
        ChatError::RoomNotFound(_) => codes::ROOM_NOT_FOUND,
        ChatError::RoomFull(_) => codes::ROOM_FULL,
        ChatError::NotAMember(_) => codes::NOT_A_MEMBER,
        ChatError::InvalidRoom(_) => codes::INVALID_ROOM,
        ChatError::RoomNameTaken(_) => codes::ROOM_NAME_TAKEN,
        ChatError::InvalidMessage(_) => codes::INVALID_MESSAGE,
        ChatError::Storage(_) => codes::INTERNAL,
    }
}

/// An `Error` frame answering request `id`.
#[must_use]
pub fn error_frame(id: u64, err: &ChatError) -> Frame {
    Frame::error(id, error_code(err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_keeps_payload() {
        let frame = event_frame(&Event::user_joined("r1", "u1", "alice"));
        match frame {
            Frame::UserJoined {
                room_id, username, ..
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let deleted = event_frame(&Event::room_deleted("r1", "bye"));
        assert_eq!(deleted.room_id(), Some("r1"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&ChatError::RoomFull("r".into())), 1005);
        assert_eq!(error_code(&ChatError::Unauthenticated), 1001);
        assert_eq!(error_code(&ChatError::NotAMember("r".into())), 1006);

        match error_frame(7, &ChatError::RoomNotFound("r".into())) {
            Frame::Error { id, code, message } => {
                assert_eq!(id, 7);
                assert_eq!(code, codes::ROOM_NOT_FOUND);
                assert!(message.contains("Room not found"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
