//! In-memory collaborators.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::collab::{
    Identity, IdentityProvider, MessageStore, NewMessage, RoomDirectory, RoomDraft, StoredMessage,
};
use crate::error::ChatError;
use crate::event::now_millis;
use crate::room::{RoomId, RoomInfo};

/// Identity provider backed by a fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    #[must_use]
    pub fn with_user(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Identity, ChatError> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential).trim();
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(ChatError::Unauthenticated)
    }
}

/// Message history kept in memory, per room.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<RoomId, Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages held for a room.
    #[must_use]
    pub fn count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |messages| messages.len())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage, ChatError> {
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            room_id: message.room_id,
            user_id: message.user_id,
            username: message.username,
            text: message.text,
            kind: message.kind,
            created_at: now_millis(),
        };

        self.rooms
            .entry(stored.room_id.clone())
            .or_default()
            .push(stored.clone());

        Ok(stored)
    }

    async fn list_by_room(
        &self,
        room_id: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        let Some(messages) = self.rooms.get(room_id) else {
            return Ok(Vec::new());
        };

        let end = messages.len().saturating_sub(skip);
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].to_vec())
    }

    async fn purge(&self, room_id: &str) -> Result<usize, ChatError> {
        Ok(self
            .rooms
            .remove(room_id)
            .map_or(0, |(_, messages)| messages.len()))
    }
}

/// Room directory kept in memory.
///
/// Names are unique case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryRoomDirectory {
    rooms: DashMap<RoomId, (u64, RoomInfo)>,
    names: DashMap<String, RoomId>,
    sequence: AtomicU64,
}

impl MemoryRoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn create(&self, draft: RoomDraft) -> Result<RoomInfo, ChatError> {
        let key = draft.name.to_lowercase();
        let info = match self.names.entry(key) {
            Entry::Occupied(_) => return Err(ChatError::RoomNameTaken(draft.name)),
            Entry::Vacant(vacant) => {
                let info = RoomInfo {
                    id: Uuid::new_v4().to_string(),
                    name: draft.name,
                    description: draft.description,
                    capacity: draft.capacity,
                    created_by: draft.created_by,
                    created_at: now_millis(),
                };
                vacant.insert(info.id.clone());
                info
            }
        };

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.rooms.insert(info.id.clone(), (seq, info.clone()));
        Ok(info)
    }

    async fn get(&self, room_id: &str) -> Result<Option<RoomInfo>, ChatError> {
        Ok(self.rooms.get(room_id).map(|entry| entry.1.clone()))
    }

    async fn list(&self) -> Result<Vec<RoomInfo>, ChatError> {
        let mut rooms: Vec<(u64, RoomInfo)> =
            self.rooms.iter().map(|entry| entry.value().clone()).collect();
        rooms.sort_by_key(|(seq, _)| *seq);
        Ok(rooms.into_iter().map(|(_, info)| info).collect())
    }

    async fn delete(&self, room_id: &str) -> Result<bool, ChatError> {
        match self.rooms.remove(room_id) {
            Some((_, (_, info))) => {
                self.names.remove(&info.name.to_lowercase());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
