//! # roomcast-core
//!
//! Presence, heartbeat and broadcast engine for Roomcast.
//!
//! This crate provides the building blocks every transport shares:
//!
//! - **Room** - Bounded membership with one record per user
//! - **PresenceRegistry** - Atomic admission and per-connection liveness
//! - **HeartbeatMonitor** - Probe and sweep timers that evict silent connections
//! - **EventBus** - Fan-out of room events to every transport adapter
//! - **ChatService** - The single entry point transports call into
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────────┐
//! │   Adapter   │────▶│ ChatService │────▶│ PresenceRegistry │
//! └─────────────┘     └─────────────┘     └──────────────────┘
//!        ▲                   │                      ▲
//!        │                   ▼                      │
//!        │            ┌─────────────┐     ┌──────────────────┐
//!        └────────────│  EventBus   │     │ HeartbeatMonitor │
//!                     └─────────────┘     └──────────────────┘
//! ```

pub mod bus;
pub mod collab;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod memory;
pub mod presence;
pub mod room;
pub mod service;

pub use bus::{Adapter, EventBus, RemovalCause};
pub use collab::{
    Identity, IdentityProvider, MessageStore, NewMessage, RoomDirectory, RoomDraft, StoredMessage,
};
pub use error::{ChatError, TransportFault};
pub use event::{Event, MessageKind};
pub use heartbeat::{HeartbeatConfig, HeartbeatHandle, HeartbeatMonitor};
pub use memory::{MemoryMessageStore, MemoryRoomDirectory, StaticIdentityProvider};
pub use presence::{PresenceRegistry, PresenceStats};
pub use room::{ConnectionId, ConnectionRecord, RoomId, RoomInfo, TransportKind, UserId};
pub use service::{ChatService, JoinOutcome, NewRoom, RoomSummary, ServiceConfig};
