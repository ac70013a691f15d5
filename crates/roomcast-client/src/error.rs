//! Client error types.

use roomcast_transport::TransportError;
use thiserror::Error;

use crate::join::JoinFailure;

/// Errors surfaced by a [`ClientSession`](crate::ClientSession).
#[derive(Debug, Error)]
pub enum ClientError {
    /// No join acknowledgement arrived in time. Client-local only.
    #[error("Timed out joining room {0}")]
    JoinTimeout(String),

    /// The server answered a request with an error.
    #[error("Rejected by server ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The server sent something other than the expected reply.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Posting requires a joined room.
    #[error("Not in a room")]
    NotJoined,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl JoinFailure {
    /// The failure of joining `room_id` as an error.
    #[must_use]
    pub fn into_error(self, room_id: impl Into<String>) -> ClientError {
        match self {
            JoinFailure::Timeout => ClientError::JoinTimeout(room_id.into()),
            JoinFailure::Rejected { code, message } => ClientError::Rejected { code, message },
        }
    }
}
