//! Error types for the chat core.

use thiserror::Error;

use crate::room::RoomId;

/// Errors returned to the single request that caused them.
///
/// None of these affect other members of a room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Credential missing or rejected by the identity provider.
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Admission would exceed the room's capacity.
    #[error("Room is full: {0}")]
    RoomFull(RoomId),

    /// Posting requires an active membership.
    #[error("You are not in this room: {0}")]
    NotAMember(RoomId),

    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),

    #[error("Room with this name already exists: {0}")]
    RoomNameTaken(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// A collaborator (message store, room directory) failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// A delivery failure at an adapter boundary.
///
/// Faults are logged and counted by the event bus, never returned to the
/// publisher.
#[derive(Debug, Error)]
pub enum TransportFault {
    /// The adapter no longer accepts events.
    #[error("Adapter closed")]
    Closed,

    /// A subscriber queue is full; the event was dropped for it.
    #[error("Subscriber {0} is lagging")]
    Lagging(String),

    #[error("{0}")]
    Other(String),
}
