//! Shared server state.

use crate::config::Config;
use anyhow::{Context, Result};
use roomcast_core::{
    Adapter, ChatError, ChatService, EventBus, Identity, MemoryMessageStore, MemoryRoomDirectory,
    NewRoom,
};
use roomcast_transport::{BridgeAdapter, PullBridge, PushAdapter};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared server state, one instance per process.
pub struct AppState {
    /// Presence, heartbeat and broadcast.
    pub service: Arc<ChatService>,
    /// Push channel adapter.
    pub push: Arc<PushAdapter>,
    /// Request/response bridge.
    pub bridge: PullBridge,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Wire the service to both transport adapters.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let push = Arc::new(PushAdapter::new(config.transport.outbound_buffer));
        let bridge_adapter = Arc::new(BridgeAdapter::new(config.transport.outbound_buffer));
        let bus = EventBus::new(vec![
            push.clone() as Arc<dyn Adapter>,
            bridge_adapter.clone() as Arc<dyn Adapter>,
        ]);

        if config.users.is_empty() {
            warn!("No users configured; every credential will be rejected");
        }

        let service = Arc::new(ChatService::new(
            config.service(),
            bus,
            Arc::new(config.identity_provider()),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryRoomDirectory::new()),
        ));

        Self {
            bridge: PullBridge::new(service.clone(), bridge_adapter),
            service,
            push,
            config,
        }
    }

    /// Create the configured startup rooms. Returns how many were created.
    ///
    /// # Errors
    ///
    /// Returns an error if a seed room is invalid.
    pub async fn seed_rooms(&self) -> Result<usize> {
        let system = Identity::new("system", "System");
        let mut created = 0;
        for seed in &self.config.rooms.seed {
            let room = NewRoom {
                name: seed.name.clone(),
                description: seed.description.clone(),
                capacity: seed.capacity,
            };
            match self.service.create_room(&system, room).await {
                Ok(info) => {
                    info!(room = %info.id, name = %info.name, "Seeded room");
                    created += 1;
                }
                Err(ChatError::RoomNameTaken(name)) => {
                    warn!(name = %name, "Seed room already exists");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Invalid seed room {:?}", seed.name));
                }
            }
        }
        Ok(created)
    }
}
