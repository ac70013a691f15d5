//! Event bus and the transport adapter boundary.
//!
//! ```text
//!                      ┌──────────────┐
//!   ChatService ──────▶│   EventBus   │
//!                      └──────┬───────┘
//!                 deliver     │     deliver
//!            ┌────────────────┴───────────────┐
//!            ▼                                ▼
//!     ┌─────────────┐                  ┌─────────────┐
//!     │ PushAdapter │                  │BridgeAdapter│
//!     └─────────────┘                  └─────────────┘
//! ```
//!
//! A publish reaches every adapter regardless of which adapter produced the
//! triggering action. Faults stop at the adapter boundary.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::TransportFault;
use crate::event::Event;
use crate::room::{ConnectionId, RoomId, TransportKind};

/// Why a connection lost its membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The client asked to leave.
    Requested,
    /// The transport connection dropped.
    Disconnected,
    /// No pong within the timeout window.
    TimedOut,
    /// The same user joined again through another connection.
    Replaced,
    /// The room was deleted.
    RoomDeleted,
}

impl RemovalCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalCause::Requested => "requested",
            RemovalCause::Disconnected => "disconnected",
            RemovalCause::TimedOut => "timed_out",
            RemovalCause::Replaced => "replaced",
            RemovalCause::RoomDeleted => "room_deleted",
        }
    }

    /// Whether the removed connection itself gets told.
    ///
    /// Other members only ever see `UserLeft`.
    #[must_use]
    pub fn notifies_connection(self) -> bool {
        matches!(self, RemovalCause::TimedOut | RemovalCause::Replaced)
    }

    /// Text sent to a notified connection.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            RemovalCause::Requested => "Left the room",
            RemovalCause::Disconnected => "Disconnected",
            RemovalCause::TimedOut => "Connection timed out",
            RemovalCause::Replaced => "Joined from another connection",
            RemovalCause::RoomDeleted => "Room deleted",
        }
    }
}

/// A boundary between the bus and one transport's delivery mechanism.
///
/// Every method must return promptly. Slow subscribers are the adapter's
/// problem, not the publisher's.
pub trait Adapter: Send + Sync {
    /// Adapter name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Deliver an event to this adapter's subscribers of `event.room_id()`.
    ///
    /// Returns the number of subscribers the event was queued for.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportFault`] if the adapter as a whole failed. Faults
    /// of individual subscribers are handled inside the adapter.
    fn deliver(&self, event: &Event) -> Result<usize, TransportFault>;

    /// Send a heartbeat probe to every live connection. Returns how many
    /// were probed.
    fn probe(&self) -> usize {
        0
    }

    /// A connection was admitted to a room.
    fn attach(&self, _room_id: &str, _connection_id: &ConnectionId, _transport: TransportKind) {}

    /// A connection lost its membership in a room.
    fn detach(&self, _room_id: &str, _connection_id: &ConnectionId, _cause: RemovalCause) {}
}

#[derive(Debug)]
enum Topic {
    Open { published: u64 },
    /// `RoomDeleted` went out. Nothing else is kept for the room.
    Closed,
}

impl Default for Topic {
    fn default() -> Self {
        Topic::Open { published: 0 }
    }
}

/// Fan-out point between the chat service and the transport adapters.
pub struct EventBus {
    adapters: Vec<Arc<dyn Adapter>>,
    /// Per-room publication state. The entry lock is held during fan-out,
    /// which keeps events of one room in publish order.
    topics: DashMap<RoomId, Topic>,
}

impl EventBus {
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        debug!(
            adapters = ?adapters.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "Creating event bus"
        );
        Self {
            adapters,
            topics: DashMap::new(),
        }
    }

    #[must_use]
    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Publish an event to every adapter.
    ///
    /// Never fails and never blocks on subscribers. Events for a room whose
    /// `RoomDeleted` has been published are dropped.
    ///
    /// Returns the total number of subscribers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let room_id = event.room_id().to_string();
        let mut topic = self.topics.entry(room_id.clone()).or_default();

        let Topic::Open { published } = &mut *topic else {
            trace!(room = %room_id, event = event.name(), "Dropping event for deleted room");
            return 0;
        };

        let mut delivered = 0;
        for adapter in &self.adapters {
            match adapter.deliver(&event) {
                Ok(count) => delivered += count,
                Err(fault) => {
                    warn!(
                        adapter = adapter.name(),
                        room = %room_id,
                        event = event.name(),
                        error = %fault,
                        "Delivery fault"
                    );
                    metrics::counter!("roomcast_delivery_faults_total", "adapter" => adapter.name())
                        .increment(1);
                }
            }
        }

        *published += 1;
        if matches!(event, Event::RoomDeleted { .. }) {
            *topic = Topic::Closed;
        }

        metrics::counter!("roomcast_events_published_total", "kind" => event.name()).increment(1);
        trace!(room = %room_id, event = event.name(), delivered, "Event published");

        delivered
    }

    /// Probe every adapter's connections. Returns how many were probed.
    pub fn probe(&self) -> usize {
        self.adapters.iter().map(|a| a.probe()).sum()
    }

    pub fn attach(&self, room_id: &str, connection_id: &ConnectionId, transport: TransportKind) {
        for adapter in &self.adapters {
            adapter.attach(room_id, connection_id, transport);
        }
    }

    pub fn detach(&self, room_id: &str, connection_id: &ConnectionId, cause: RemovalCause) {
        for adapter in &self.adapters {
            adapter.detach(room_id, connection_id, cause);
        }
    }

    /// Whether `RoomDeleted` has been published for the room.
    #[must_use]
    pub fn is_closed(&self, room_id: &str) -> bool {
        self.topics
            .get(room_id)
            .is_some_and(|topic| matches!(*topic, Topic::Closed))
    }

    /// Number of events published to an open room so far. Zero once the
    /// room is deleted.
    #[must_use]
    pub fn published(&self, room_id: &str) -> u64 {
        match self.topics.get(room_id).as_deref() {
            Some(Topic::Open { published }) => *published,
            _ => 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Adapter that records everything it is handed.
    #[derive(Default)]
    pub(crate) struct RecordingAdapter {
        pub events: Mutex<Vec<Event>>,
        pub detached: Mutex<Vec<(RoomId, ConnectionId, RemovalCause)>>,
        pub probes: Mutex<usize>,
    }

    impl RecordingAdapter {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn detached(&self) -> Vec<(RoomId, ConnectionId, RemovalCause)> {
            self.detached.lock().unwrap().clone()
        }
    }

    impl Adapter for RecordingAdapter {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deliver(&self, event: &Event) -> Result<usize, TransportFault> {
            self.events.lock().unwrap().push(event.clone());
            Ok(1)
        }

        fn probe(&self) -> usize {
            *self.probes.lock().unwrap() += 1;
            1
        }

        fn detach(&self, room_id: &str, connection_id: &ConnectionId, cause: RemovalCause) {
            self.detached
                .lock()
                .unwrap()
                .push((room_id.to_string(), connection_id.clone(), cause));
        }
    }

    struct BrokenAdapter;

    impl Adapter for BrokenAdapter {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn deliver(&self, _event: &Event) -> Result<usize, TransportFault> {
            Err(TransportFault::Closed)
        }
    }

    #[test]
    fn test_publish_reaches_every_adapter() {
        let a = Arc::new(RecordingAdapter::default());
        let b = Arc::new(RecordingAdapter::default());
        let bus = EventBus::new(vec![a.clone() as Arc<dyn Adapter>, b.clone()]);

        let delivered = bus.publish(Event::user_joined("r1", "u1", "alice"));
        assert_eq!(delivered, 2);
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
        assert_eq!(bus.published("r1"), 1);
    }

    #[test]
    fn test_fault_is_isolated() {
        let good = Arc::new(RecordingAdapter::default());
        let bus = EventBus::new(vec![Arc::new(BrokenAdapter) as Arc<dyn Adapter>, good.clone()]);

        assert_eq!(bus.publish(Event::user_left("r1", "u1", "alice")), 1);
        assert_eq!(good.events().len(), 1);
    }

    #[test]
    fn test_room_deleted_closes_topic() {
        let adapter = Arc::new(RecordingAdapter::default());
        let bus = EventBus::new(vec![adapter.clone() as Arc<dyn Adapter>]);

        bus.publish(Event::user_joined("r1", "u1", "alice"));
        bus.publish(Event::room_deleted("r1", "gone"));
        assert!(bus.is_closed("r1"));

        assert_eq!(bus.publish(Event::user_left("r1", "u1", "alice")), 0);
        assert_eq!(bus.published("r1"), 0);
        bus.publish(Event::user_joined("r2", "u1", "alice"));

        let names: Vec<&str> = adapter.events().iter().map(Event::name).collect();
        assert_eq!(names, ["user_joined", "room_deleted", "user_joined"]);
    }

    #[test]
    fn test_removal_cause_notification() {
        assert!(RemovalCause::TimedOut.notifies_connection());
        assert!(RemovalCause::Replaced.notifies_connection());
        assert!(!RemovalCause::Requested.notifies_connection());
        assert!(!RemovalCause::Disconnected.notifies_connection());
        assert!(!RemovalCause::RoomDeleted.notifies_connection());
    }
}
