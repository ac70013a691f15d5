//! Presence registry.
//!
//! Tracks which connections are members of which rooms and when each was
//! last heard from. Rooms live in a sharded map, so admission into one room
//! is serialized while unrelated rooms proceed in parallel.
//!
//! Lock order is rooms first, then the connection index. Nothing takes the
//! index and then a room.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ChatError;
use crate::room::{Admission, ConnectionId, ConnectionRecord, Room, RoomId, RoomInfo, TransportKind};

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStats {
    /// Open rooms.
    pub room_count: usize,
    /// Connections holding at least one membership.
    pub connection_count: usize,
    /// Memberships across all rooms.
    pub membership_count: usize,
}

/// Authoritative membership state for every open room.
#[derive(Default)]
pub struct PresenceRegistry {
    rooms: DashMap<RoomId, Room>,
    /// Reverse index: connection -> rooms it belongs to, in join order.
    connections: DashMap<ConnectionId, Vec<RoomId>>,
    /// Deleted rooms. Their ids are never reopened.
    retired: DashSet<RoomId>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a room for admission.
    ///
    /// Returns `true` if the room was newly opened.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room id has been retired.
    pub fn open_room(&self, info: RoomInfo) -> Result<bool, ChatError> {
        match self.rooms.entry(info.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                if self.retired.contains(&info.id) {
                    return Err(ChatError::RoomNotFound(info.id));
                }
                debug!(room = %info.id, capacity = info.capacity, "Room opened");
                vacant.insert(Room::new(info));
                Ok(true)
            }
        }
    }

    /// Close and retire a room, returning the members it held.
    ///
    /// Returns `None` if the room was not open.
    pub fn close_room(&self, room_id: &str) -> Option<Vec<ConnectionRecord>> {
        self.retired.insert(room_id.to_string());

        let (_, mut room) = self.rooms.remove(room_id)?;
        let members = room.drain();
        for record in &members {
            self.unindex(&record.connection_id, room_id);
        }

        info!(room = %room_id, members = members.len(), "Room closed");
        Some(members)
    }

    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    #[must_use]
    pub fn is_retired(&self, room_id: &str) -> bool {
        self.retired.contains(room_id)
    }

    /// Admit `connection_id` for `user_id`, timestamped now.
    ///
    /// # Errors
    ///
    /// See [`PresenceRegistry::join_at`].
    pub fn join(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        connection_id: ConnectionId,
        transport: TransportKind,
    ) -> Result<Admission, ChatError> {
        self.join_at(room_id, user_id, username, connection_id, transport, Instant::now())
    }

    /// Admit `connection_id` for `user_id` with an explicit timestamp.
    ///
    /// Capacity check and insertion happen under the room's lock, so
    /// concurrent joins never overshoot capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room is not open and
    /// [`ChatError::RoomFull`] if a new member would exceed capacity.
    pub fn join_at(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        connection_id: ConnectionId,
        transport: TransportKind,
        now: Instant,
    ) -> Result<Admission, ChatError> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;

        let admission = room.admit(user_id, username, connection_id, transport, now)?;

        match &admission {
            Admission::Admitted(record) => self.index(&record.connection_id, room_id),
            Admission::Upgraded { record, previous } => {
                if record.connection_id != previous.connection_id {
                    self.unindex(&previous.connection_id, room_id);
                    self.index(&record.connection_id, room_id);
                }
            }
        }

        Ok(admission)
    }

    /// Remove a connection from a room. A no-op returning `None` if absent.
    pub fn leave(&self, room_id: &str, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        let removed = {
            let mut room = self.rooms.get_mut(room_id)?;
            let removed = room.remove(connection_id)?;
            self.unindex(connection_id, room_id);
            removed
        };

        debug!(room = %room_id, connection = %connection_id, "Member removed");
        Some(removed)
    }

    /// Rooms a connection belongs to, in join order.
    #[must_use]
    pub fn find_rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(connection_id)
            .map(|rooms| rooms.clone())
            .unwrap_or_default()
    }

    /// Record a heartbeat for a connection in a room.
    pub fn touch(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        self.touch_at(room_id, connection_id, Instant::now())
    }

    /// Record a heartbeat with an explicit timestamp.
    ///
    /// Returns `false` if the connection is not a member of the room.
    pub fn touch_at(&self, room_id: &str, connection_id: &ConnectionId, now: Instant) -> bool {
        self.rooms
            .get_mut(room_id)
            .is_some_and(|mut room| room.touch(connection_id, now))
    }

    /// Every `(room, connection)` pair silent for longer than `timeout`.
    ///
    /// All records are judged against the same `now`.
    #[must_use]
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<(RoomId, ConnectionId)> {
        let mut stale = Vec::new();
        for room in self.rooms.iter() {
            for connection_id in room.stale(now, timeout) {
                stale.push((room.key().clone(), connection_id));
            }
        }
        stale
    }

    #[must_use]
    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.member(user_id).is_some())
    }

    /// The record a user currently holds in a room.
    #[must_use]
    pub fn member_connection(&self, room_id: &str, user_id: &str) -> Option<ConnectionRecord> {
        self.rooms.get(room_id)?.member(user_id).cloned()
    }

    /// The record held by a specific connection in a room.
    #[must_use]
    pub fn connection(&self, room_id: &str, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        self.rooms.get(room_id)?.connection(connection_id).cloned()
    }

    /// Current member count, 0 if the room is not open.
    #[must_use]
    pub fn room_size(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.len())
    }

    #[must_use]
    pub fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.rooms.get(room_id).map(|room| room.info().clone())
    }

    /// Snapshot of a room's members in admission order.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<ConnectionRecord> {
        self.rooms
            .get(room_id)
            .map(|room| room.records().to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> PresenceStats {
        PresenceStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            membership_count: self.rooms.iter().map(|room| room.len()).sum(),
        }
    }

    fn index(&self, connection_id: &ConnectionId, room_id: &str) {
        let mut rooms = self.connections.entry(connection_id.clone()).or_default();
        if !rooms.iter().any(|r| r == room_id) {
            rooms.push(room_id.to_string());
        }
    }

    fn unindex(&self, connection_id: &ConnectionId, room_id: &str) {
        if let Entry::Occupied(mut entry) = self.connections.entry(connection_id.clone()) {
            entry.get_mut().retain(|r| r != room_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn info(id: &str, capacity: usize) -> RoomInfo {
        RoomInfo {
            id: id.into(),
            name: format!("room {id}"),
            description: None,
            capacity,
            created_by: "owner".into(),
            created_at: 0,
        }
    }

    #[test]
    fn test_open_room_is_idempotent() {
        let registry = PresenceRegistry::new();
        assert!(registry.open_room(info("r1", 5)).unwrap());
        assert!(!registry.open_room(info("r1", 5)).unwrap());
        assert_eq!(registry.stats().room_count, 1);
    }

    #[test]
    fn test_join_unknown_room() {
        let registry = PresenceRegistry::new();
        let err = registry
            .join("missing", "u1", "alice", "c1".into(), TransportKind::Push)
            .unwrap_err();
        assert_eq!(err, ChatError::RoomNotFound("missing".into()));
    }

    #[test]
    fn test_connection_index_follows_membership() {
        let registry = PresenceRegistry::new();
        registry.open_room(info("r1", 5)).unwrap();
        registry.open_room(info("r2", 5)).unwrap();

        let conn = ConnectionId::from("c1");
        registry
            .join("r1", "u1", "alice", conn.clone(), TransportKind::Push)
            .unwrap();
        registry
            .join("r2", "u1", "alice", conn.clone(), TransportKind::Push)
            .unwrap();
        assert_eq!(registry.find_rooms_of(&conn), vec!["r1".to_string(), "r2".to_string()]);

        assert!(registry.leave("r1", &conn).is_some());
        assert_eq!(registry.find_rooms_of(&conn), vec!["r2".to_string()]);

        // Leaving twice is a no-op.
        assert!(registry.leave("r1", &conn).is_none());

        registry.leave("r2", &conn);
        assert!(registry.find_rooms_of(&conn).is_empty());
        assert_eq!(registry.stats().connection_count, 0);
    }

    #[test]
    fn test_upgrade_moves_index_to_new_connection() {
        let registry = PresenceRegistry::new();
        registry.open_room(info("r1", 1)).unwrap();

        let first = ConnectionId::from("push-1");
        let second = ConnectionId::from("pull-1");
        registry
            .join("r1", "u1", "alice", first.clone(), TransportKind::Push)
            .unwrap();

        let admission = registry
            .join("r1", "u1", "alice", second.clone(), TransportKind::Pull)
            .unwrap();
        assert!(!admission.is_new_member());
        assert_eq!(registry.room_size("r1"), 1);
        assert!(registry.find_rooms_of(&first).is_empty());
        assert_eq!(registry.find_rooms_of(&second), vec!["r1".to_string()]);
    }

    #[test]
    fn test_close_room_retires_id() {
        let registry = PresenceRegistry::new();
        registry.open_room(info("r1", 5)).unwrap();
        registry
            .join("r1", "u1", "alice", "c1".into(), TransportKind::Push)
            .unwrap();

        let members = registry.close_room("r1").unwrap();
        assert_eq!(members.len(), 1);
        assert!(registry.find_rooms_of(&"c1".into()).is_empty());
        assert!(registry.is_retired("r1"));

        let err = registry.open_room(info("r1", 5)).unwrap_err();
        assert_eq!(err, ChatError::RoomNotFound("r1".into()));
        assert!(registry.close_room("r1").is_none());
    }

    #[test]
    fn test_stale_connections_single_snapshot() {
        let registry = PresenceRegistry::new();
        registry.open_room(info("r1", 5)).unwrap();
        let start = Instant::now();

        registry
            .join_at("r1", "u1", "alice", "c1".into(), TransportKind::Push, start)
            .unwrap();
        registry
            .join_at("r1", "u2", "bob", "c2".into(), TransportKind::Pull, start)
            .unwrap();
        assert!(registry.touch_at("r1", &"c2".into(), start + Duration::from_secs(15)));

        let stale = registry.stale_connections(start + Duration::from_secs(21), Duration::from_secs(20));
        assert_eq!(stale, vec![("r1".to_string(), ConnectionId::from("c1"))]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_respect_capacity() {
        let registry = Arc::new(PresenceRegistry::new());
        registry.open_room(info("r1", 2)).unwrap();

        let barrier = Arc::new(Barrier::new(3));
        let mut handles = Vec::new();
        for i in 0..3 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.join(
                    "r1",
                    &format!("u{i}"),
                    &format!("user{i}"),
                    ConnectionId::new(format!("c{i}")),
                    TransportKind::Push,
                )
            }));
        }

        let mut admitted = 0;
        let mut full = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(ChatError::RoomFull(_)) => full += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        assert_eq!(admitted, 2);
        assert_eq!(full, 1);
        assert_eq!(registry.room_size("r1"), 2);
    }
}
