//! The chat service.
//!
//! [`ChatService`] owns the presence registry and the event bus and is the
//! single entry point for every transport. Handlers hold it behind an `Arc`.
//!
//! Every membership removal (explicit leave, disconnect, timeout, replacement)
//! goes through one internal path, so other members observe the same
//! `UserLeft` transition whatever the cause.
//!
//! Membership changes of one room are serialized together with the events
//! they publish, so subscribers see `UserJoined`/`UserLeft` in the order the
//! registry applied them.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, RemovalCause};
use crate::collab::{
    Identity, IdentityProvider, MessageStore, NewMessage, RoomDirectory, RoomDraft, StoredMessage,
};
use crate::error::ChatError;
use crate::event::Event;
use crate::heartbeat::HeartbeatConfig;
use crate::presence::PresenceRegistry;
use crate::room::{
    validate_room_name, Admission, ConnectionId, ConnectionRecord, RoomId, RoomInfo,
    TransportKind, DEFAULT_ROOM_CAPACITY, MAX_DESCRIPTION_LENGTH,
};

/// Maximum message length (in characters).
pub const MAX_MESSAGE_LENGTH: usize = 1000;

/// Default page size for message history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Reason attached to `RoomDeleted` when none is given.
pub const DEFAULT_DELETE_REASON: &str = "This room has been deleted by the creator";

/// Service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Capacity for rooms created without one.
    pub default_capacity: usize,
    /// Page size for message history.
    pub history_limit: usize,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_ROOM_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// A room creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRoom {
    pub name: String,
    pub description: Option<String>,
    pub capacity: Option<usize>,
}

/// A room as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    #[serde(flatten)]
    pub info: RoomInfo,
    pub active_connections: usize,
    pub is_full: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: RoomInfo,
    pub record: ConnectionRecord,
    /// Members after the join.
    pub active_users: usize,
    /// `false` when an existing membership was upgraded in place.
    pub is_new_member: bool,
    /// Private welcome for the joining connection.
    pub welcome: Option<StoredMessage>,
}

/// Registry statistics, for health reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceStats {
    pub rooms: usize,
    pub connections: usize,
    pub memberships: usize,
}

/// Presence, heartbeat and broadcast orchestration.
pub struct ChatService {
    registry: PresenceRegistry,
    bus: EventBus,
    /// Per-room lock held from a membership change until its events are out.
    membership: DashMap<RoomId, Arc<Mutex<()>>>,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn RoomDirectory>,
    config: ServiceConfig,
}

impl ChatService {
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        bus: EventBus,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn RoomDirectory>,
    ) -> Self {
        info!(
            default_capacity = config.default_capacity,
            adapters = bus.adapter_count(),
            "Creating chat service"
        );
        Self {
            registry: PresenceRegistry::new(),
            bus,
            membership: DashMap::new(),
            identity,
            store,
            directory,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        let stats = self.registry.stats();
        ServiceStats {
            rooms: stats.room_count,
            connections: stats.connection_count,
            memberships: stats.membership_count,
        }
    }

    /// Verify a credential with the identity provider.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthenticated`] if the credential is rejected.
    pub async fn authenticate(&self, credential: &str) -> Result<Identity, ChatError> {
        self.identity.verify(credential).await
    }

    /// Create a room and open it for admission.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidRoom`] for a bad name, description or
    /// capacity and [`ChatError::RoomNameTaken`] for a duplicate name.
    pub async fn create_room(&self, creator: &Identity, room: NewRoom) -> Result<RoomInfo, ChatError> {
        let name = room.name.trim().to_string();
        validate_room_name(&name).map_err(ChatError::InvalidRoom)?;

        let description = room
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if description
            .as_ref()
            .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LENGTH)
        {
            return Err(ChatError::InvalidRoom("Description must be at most 200 characters"));
        }

        let capacity = room.capacity.unwrap_or(self.config.default_capacity);
        if capacity == 0 {
            return Err(ChatError::InvalidRoom("Capacity must be at least 1"));
        }

        let info = self
            .directory
            .create(RoomDraft {
                name,
                description,
                capacity,
                created_by: creator.user_id.clone(),
            })
            .await?;
        self.registry.open_room(info.clone())?;

        info!(room = %info.id, name = %info.name, capacity, user = %creator.user_id, "Room created");
        Ok(info)
    }

    /// Open every room known to the directory. Returns how many were opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn load_rooms(&self) -> Result<usize, ChatError> {
        let mut opened = 0;
        for info in self.directory.list().await? {
            if self.registry.open_room(info)? {
                opened += 1;
            }
        }
        Ok(opened)
    }

    /// Look up a room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] for an unknown room.
    pub async fn room(&self, room_id: &str) -> Result<RoomInfo, ChatError> {
        self.directory
            .get(room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))
    }

    /// All rooms with their live occupancy.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, ChatError> {
        let rooms = self.directory.list().await?;
        Ok(rooms
            .into_iter()
            .map(|info| {
                let active_connections = self.registry.room_size(&info.id);
                RoomSummary {
                    is_full: active_connections >= info.capacity,
                    active_connections,
                    info,
                }
            })
            .collect())
    }

    /// Admit a connection into a room.
    ///
    /// A user who is already a member is upgraded in place: the previous
    /// connection is detached and no membership events are published.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] or [`ChatError::RoomFull`].
    pub async fn join(
        &self,
        identity: &Identity,
        room_id: &str,
        connection_id: ConnectionId,
        transport: TransportKind,
    ) -> Result<JoinOutcome, ChatError> {
        let info = self
            .directory
            .get(room_id)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        self.registry.open_room(info.clone())?;

        let membership = self.lock_room(room_id).await;
        let admission = match self.registry.join(
            room_id,
            &identity.user_id,
            &identity.username,
            connection_id,
            transport,
        ) {
            Ok(admission) => admission,
            Err(err) => {
                metrics::counter!("roomcast_joins_total", "result" => "rejected").increment(1);
                debug!(room = %room_id, user = %identity.user_id, error = %err, "Join rejected");
                return Err(err);
            }
        };

        let record = admission.record().clone();
        self.bus.attach(room_id, &record.connection_id, transport);

        if let Admission::Upgraded { previous, .. } = &admission {
            if previous.connection_id != record.connection_id {
                self.bus
                    .detach(room_id, &previous.connection_id, RemovalCause::Replaced);
            }
        }

        let is_new_member = admission.is_new_member();
        if is_new_member {
            self.bus
                .publish(Event::user_joined(room_id, &identity.user_id, &identity.username));
            self.publish_system(
                room_id,
                &identity.user_id,
                &identity.username,
                format!("{} has joined the room", identity.username),
            )
            .await;
        }
        drop(membership);

        let welcome = match self
            .store
            .append(NewMessage::announcement(
                room_id,
                format!("Welcome to {}! Please be respectful to other members.", info.name),
            ))
            .await
        {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(room = %room_id, error = %err, "Failed to store welcome message");
                None
            }
        };

        metrics::counter!("roomcast_joins_total", "result" => "admitted").increment(1);
        info!(
            room = %room_id,
            user = %identity.user_id,
            connection = %record.connection_id,
            transport = transport.as_str(),
            new_member = is_new_member,
            "User joined room"
        );

        Ok(JoinOutcome {
            active_users: self.registry.room_size(room_id),
            room: info,
            record,
            is_new_member,
            welcome,
        })
    }

    /// Remove a connection from a room. A no-op returning `false` if it is
    /// not a member.
    pub async fn leave(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        self.remove_member(room_id, connection_id, RemovalCause::Requested)
            .await
            .is_some()
    }

    /// Remove whatever connection a user holds in a room.
    pub async fn leave_user(&self, identity: &Identity, room_id: &str) -> bool {
        match self.registry.member_connection(room_id, &identity.user_id) {
            Some(record) => self.leave(room_id, &record.connection_id).await,
            None => false,
        }
    }

    /// A transport connection dropped: remove it from every room it joined.
    ///
    /// Returns the rooms it was removed from.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> Vec<String> {
        let rooms = self.registry.find_rooms_of(connection_id);
        let mut removed = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            if self
                .remove_member(&room_id, connection_id, RemovalCause::Disconnected)
                .await
                .is_some()
            {
                removed.push(room_id);
            }
        }
        removed
    }

    /// Post a user message.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`], [`ChatError::NotAMember`] or
    /// [`ChatError::InvalidMessage`].
    pub async fn post(
        &self,
        identity: &Identity,
        room_id: &str,
        text: &str,
    ) -> Result<StoredMessage, ChatError> {
        if !self.registry.contains(room_id) && self.directory.get(room_id).await?.is_none() {
            return Err(ChatError::RoomNotFound(room_id.to_string()));
        }
        if !self.registry.is_member(room_id, &identity.user_id) {
            return Err(ChatError::NotAMember(room_id.to_string()));
        }

        let text = validate_message(text)?;
        let message = self
            .store
            .append(NewMessage::user(room_id, identity, text))
            .await?;
        self.bus.publish(Event::from(&message));

        debug!(room = %room_id, user = %identity.user_id, message = %message.id, "Message posted");
        Ok(message)
    }

    /// Record a pong. Returns `false` if the connection is not a member.
    pub fn heartbeat(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        self.registry.touch(room_id, connection_id)
    }

    /// Record a pong for whatever connection a user holds in a room.
    pub fn heartbeat_user(&self, identity: &Identity, room_id: &str) -> bool {
        match self.registry.member_connection(room_id, &identity.user_id) {
            Some(record) => self.heartbeat(room_id, &record.connection_id),
            None => false,
        }
    }

    /// Probe every live connection.
    pub fn probe(&self) -> usize {
        self.bus.probe()
    }

    /// Evict every connection silent for longer than the timeout window,
    /// judged against `now`. Returns the number evicted.
    pub async fn sweep(&self, now: Instant) -> usize {
        let stale = self
            .registry
            .stale_connections(now, self.config.heartbeat.timeout_window());

        let mut evicted = 0;
        for (room_id, connection_id) in stale {
            if let Some(record) = self
                .remove_member(&room_id, &connection_id, RemovalCause::TimedOut)
                .await
            {
                evicted += 1;
                info!(
                    room = %room_id,
                    user = %record.user_id,
                    connection = %connection_id,
                    "Evicted stale connection"
                );
            }
        }

        if evicted > 0 {
            metrics::counter!("roomcast_evictions_total").increment(evicted as u64);
        }
        evicted
    }

    /// Delete a room: retire it, publish `RoomDeleted` and evict every member.
    ///
    /// Returns the number of evicted connections.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if the room does not exist.
    pub async fn delete_room(&self, room_id: &str, reason: Option<String>) -> Result<usize, ChatError> {
        if !self.directory.delete(room_id).await? {
            return Err(ChatError::RoomNotFound(room_id.to_string()));
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_DELETE_REASON.to_string());

        let membership = self.lock_room(room_id).await;
        let members = self.registry.close_room(room_id).unwrap_or_default();
        self.bus.publish(Event::room_deleted(room_id, reason));

        for record in &members {
            self.bus
                .detach(room_id, &record.connection_id, RemovalCause::RoomDeleted);
        }
        drop(membership);
        self.membership.remove(room_id);

        match self.store.purge(room_id).await {
            Ok(purged) => debug!(room = %room_id, purged, "Room history purged"),
            Err(err) => warn!(room = %room_id, error = %err, "Failed to purge room history"),
        }

        info!(room = %room_id, evicted = members.len(), "Room deleted");
        Ok(members.len())
    }

    /// Publish an announcement to one room, or to every room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidMessage`] for bad text and
    /// [`ChatError::RoomNotFound`] for an unknown target room.
    pub async fn announce(
        &self,
        text: &str,
        room_id: Option<&str>,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let text = validate_message(text)?;

        let targets = match room_id {
            Some(id) => vec![self
                .directory
                .get(id)
                .await?
                .ok_or_else(|| ChatError::RoomNotFound(id.to_string()))?
                .id],
            None => self.directory.list().await?.into_iter().map(|r| r.id).collect(),
        };

        let mut sent = Vec::with_capacity(targets.len());
        for target in targets {
            let message = self
                .store
                .append(NewMessage::announcement(&target, text.clone()))
                .await?;
            self.bus.publish(Event::from(&message));
            sent.push(message);
        }

        info!(rooms = sent.len(), "Announcement sent");
        Ok(sent)
    }

    /// Message history: the `limit` newest after skipping `skip`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] for an unknown room.
    pub async fn list_messages(
        &self,
        room_id: &str,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        if self.directory.get(room_id).await?.is_none() {
            return Err(ChatError::RoomNotFound(room_id.to_string()));
        }
        let limit = limit.unwrap_or(self.config.history_limit);
        self.store.list_by_room(room_id, limit, skip).await
    }

    async fn remove_member(
        &self,
        room_id: &str,
        connection_id: &ConnectionId,
        cause: RemovalCause,
    ) -> Option<ConnectionRecord> {
        let _membership = self.lock_room(room_id).await;
        let record = self.registry.leave(room_id, connection_id)?;
        self.bus.detach(room_id, connection_id, cause);

        self.bus
            .publish(Event::user_left(room_id, &record.user_id, &record.username));
        self.publish_system(
            room_id,
            &record.user_id,
            &record.username,
            format!("{} has left the room", record.username),
        )
        .await;

        debug!(
            room = %room_id,
            user = %record.user_id,
            connection = %connection_id,
            cause = cause.as_str(),
            "Member removed"
        );
        Some(record)
    }

    async fn lock_room(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.membership.entry(room_id.to_string()).or_default().value());
        lock.lock_owned().await
    }

    async fn publish_system(&self, room_id: &str, user_id: &str, username: &str, text: String) {
        match self
            .store
            .append(NewMessage::system(room_id, user_id, username, text))
            .await
        {
            Ok(message) => {
                self.bus.publish(Event::from(&message));
            }
            Err(err) => warn!(room = %room_id, error = %err, "Failed to store system message"),
        }
    }
}

/// Trim and bound-check message text.
fn validate_message(text: &str) -> Result<String, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::InvalidMessage("Message cannot be empty"));
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ChatError::InvalidMessage("Message must be at most 1000 characters"));
    }
    Ok(text.to_string())
}
