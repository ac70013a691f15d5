//! Room membership.
//!
//! A [`Room`] is a bounded set of [`ConnectionRecord`]s, at most one per
//! user. All mutation goes through `&mut Room`, so whoever holds the room
//! lock decides admission atomically.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::ChatError;

/// A room identifier.
pub type RoomId = String;

/// A user identifier, as issued by the identity provider.
pub type UserId = String;

/// Room name length bounds (in characters).
pub const MIN_ROOM_NAME_LENGTH: usize = 3;
pub const MAX_ROOM_NAME_LENGTH: usize = 30;

/// Maximum room description length (in characters).
pub const MAX_DESCRIPTION_LENGTH: usize = 200;

/// Default number of simultaneous connections per room.
pub const DEFAULT_ROOM_CAPACITY: usize = 10;

/// Validate a room name. The name is expected to be trimmed already.
///
/// # Errors
///
/// Returns a description of the problem if the name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    let len = name.chars().count();
    if len < MIN_ROOM_NAME_LENGTH {
        return Err("Room name must be at least 3 characters");
    }
    if len > MAX_ROOM_NAME_LENGTH {
        return Err("Room name must be at most 30 characters");
    }
    if name.chars().any(char::is_control) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Opaque, transport-assigned connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID for a push connection.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Generate a virtual connection ID for a bridge membership.
    #[must_use]
    pub fn bridge(user_id: &str) -> Self {
        Self(format!("bridge_{}_{}", user_id, Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which adapter a connection arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent bidirectional channel.
    Push,
    /// Request/response bridge.
    Pull,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Push => "push",
            TransportKind::Pull => "pull",
        }
    }
}

/// Room metadata, owned by the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    /// Maximum simultaneous connections.
    pub capacity: usize,
    pub created_by: UserId,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// One user's membership and liveness in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
    pub transport: TransportKind,
    pub last_heartbeat_at: Instant,
}

impl ConnectionRecord {
    /// Whether the record has been silent for longer than `timeout` as of `now`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat_at) > timeout
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new member took a slot.
    Admitted(ConnectionRecord),
    /// An existing member's record was upgraded in place.
    Upgraded {
        record: ConnectionRecord,
        previous: ConnectionRecord,
    },
}

impl Admission {
    /// The record now held by the room.
    #[must_use]
    pub fn record(&self) -> &ConnectionRecord {
        match self {
            Admission::Admitted(record) | Admission::Upgraded { record, .. } => record,
        }
    }

    #[must_use]
    pub fn is_new_member(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// A room and its current members.
#[derive(Debug)]
pub struct Room {
    info: RoomInfo,
    /// Members in admission order. At most one record per user.
    connections: Vec<ConnectionRecord>,
}

impl Room {
    #[must_use]
    pub fn new(info: RoomInfo) -> Self {
        Self {
            info,
            connections: Vec::new(),
        }
    }

    #[must_use]
    pub fn info(&self) -> &RoomInfo {
        &self.info
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.info.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.info.capacity
    }

    #[must_use]
    pub fn records(&self) -> &[ConnectionRecord] {
        &self.connections
    }

    #[must_use]
    pub fn member(&self, user_id: &str) -> Option<&ConnectionRecord> {
        self.connections.iter().find(|c| c.user_id == user_id)
    }

    #[must_use]
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.connections
            .iter()
            .find(|c| &c.connection_id == connection_id)
    }

    /// Admit a connection for a user.
    ///
    /// A user who is already present is upgraded in place and never hits
    /// the capacity check.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomFull`] if a new member would exceed capacity.
    pub fn admit(
        &mut self,
        user_id: &str,
        username: &str,
        connection_id: ConnectionId,
        transport: TransportKind,
        now: Instant,
    ) -> Result<Admission, ChatError> {
        if let Some(existing) = self.connections.iter_mut().find(|c| c.user_id == user_id) {
            let previous = existing.clone();
            existing.username = username.to_string();
            existing.connection_id = connection_id;
            existing.transport = transport;
            existing.last_heartbeat_at = now;

            debug!(
                room = %self.info.id,
                user = %user_id,
                from = %previous.connection_id,
                to = %existing.connection_id,
                "Membership upgraded in place"
            );

            return Ok(Admission::Upgraded {
                record: existing.clone(),
                previous,
            });
        }

        if self.is_full() {
            return Err(ChatError::RoomFull(self.info.id.clone()));
        }

        let record = ConnectionRecord {
            user_id: user_id.to_string(),
            username: username.to_string(),
            connection_id,
            transport,
            last_heartbeat_at: now,
        };
        self.connections.push(record.clone());

        debug!(
            room = %self.info.id,
            user = %user_id,
            connection = %record.connection_id,
            members = self.connections.len(),
            "Member admitted"
        );

        Ok(Admission::Admitted(record))
    }

    /// Remove the record held by `connection_id`, if any.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        let index = self
            .connections
            .iter()
            .position(|c| &c.connection_id == connection_id)?;
        Some(self.connections.remove(index))
    }

    /// Record a heartbeat. Returns `false` if the connection is not a member.
    pub fn touch(&mut self, connection_id: &ConnectionId, now: Instant) -> bool {
        match self
            .connections
            .iter_mut()
            .find(|c| &c.connection_id == connection_id)
        {
            Some(record) => {
                record.last_heartbeat_at = now;
                true
            }
            None => false,
        }
    }

    /// Connections silent for longer than `timeout`, judged against one `now`.
    #[must_use]
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|c| c.is_stale(now, timeout))
            .map(|c| c.connection_id.clone())
            .collect()
    }

    /// Remove every member, returning their records.
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        std::mem::take(&mut self.connections)
    }
}
