//! Push adapter.
//!
//! Every push client owns a bounded outbound queue drained by its socket
//! writer. Delivery uses `try_send`, so a full or closed queue costs that
//! subscriber the frame and nobody else anything.

use dashmap::DashMap;
use roomcast_core::{Adapter, ConnectionId, Event, RemovalCause, RoomId, TransportFault, TransportKind};
use roomcast_protocol::Frame;
use std::collections::HashSet;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

use crate::wire::event_frame;

/// Default outbound queue depth per client.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Adapter for persistent bidirectional connections.
pub struct PushAdapter {
    clients: DashMap<ConnectionId, mpsc::Sender<Frame>>,
    /// Room -> push connections admitted to it.
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    buffer: usize,
}

impl Default for PushAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOUND_BUFFER)
    }
}

impl PushAdapter {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a client and return the receiving end of its outbound queue.
    pub fn connect(&self, connection_id: ConnectionId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.buffer);
        debug!(connection = %connection_id, "Push client connected");
        self.clients.insert(connection_id, tx);
        metrics::gauge!("roomcast_push_clients").set(self.clients.len() as f64);
        rx
    }

    /// Forget a client and every room subscription it holds.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.clients.remove(connection_id).is_some();
        self.rooms.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
        if removed {
            debug!(connection = %connection_id, "Push client disconnected");
            metrics::gauge!("roomcast_push_clients").set(self.clients.len() as f64);
        }
        removed
    }

    /// Queue a frame for one client.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportFault`] if the client is unknown, lagging or gone.
    pub fn send_to(&self, connection_id: &ConnectionId, frame: Frame) -> Result<(), TransportFault> {
        let sender = self
            .clients
            .get(connection_id)
            .ok_or(TransportFault::Closed)?;
        offer(&sender, connection_id, frame)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Push connections subscribed to a room.
    #[must_use]
    pub fn subscribers(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |members| members.len())
    }
}

fn offer(
    sender: &mpsc::Sender<Frame>,
    connection_id: &ConnectionId,
    frame: Frame,
) -> Result<(), TransportFault> {
    match sender.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(TransportFault::Lagging(connection_id.to_string())),
        Err(TrySendError::Closed(_)) => Err(TransportFault::Closed),
    }
}

impl Adapter for PushAdapter {
    fn name(&self) -> &'static str {
        "push"
    }

    fn deliver(&self, event: &Event) -> Result<usize, TransportFault> {
        let Some(members) = self.rooms.get(event.room_id()) else {
            return Ok(0);
        };

        let frame = event_frame(event);
        let mut delivered = 0;
        for connection_id in members.iter() {
            let Some(sender) = self.clients.get(connection_id) else {
                continue;
            };
            match offer(&sender, connection_id, frame.clone()) {
                Ok(()) => delivered += 1,
                Err(fault) => {
                    warn!(connection = %connection_id, error = %fault, "Dropped event for push subscriber");
                    metrics::counter!("roomcast_delivery_faults_total", "adapter" => "push")
                        .increment(1);
                }
            }
        }

        trace!(room = %event.room_id(), delivered, "Push delivery");
        Ok(delivered)
    }

    fn probe(&self) -> usize {
        let mut probed = 0;
        for client in self.clients.iter() {
            if offer(client.value(), client.key(), Frame::Ping).is_ok() {
                probed += 1;
            }
        }
        probed
    }

    fn attach(&self, room_id: &str, connection_id: &ConnectionId, transport: TransportKind) {
        if transport != TransportKind::Push || !self.clients.contains_key(connection_id) {
            return;
        }
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.clone());
    }

    fn detach(&self, room_id: &str, connection_id: &ConnectionId, cause: RemovalCause) {
        let was_member = match self.rooms.get_mut(room_id) {
            Some(mut members) => members.remove(connection_id),
            None => false,
        };
        self.rooms.remove_if(room_id, |_, members| members.is_empty());

        if was_member && cause.notifies_connection() {
            let notice = Frame::Evicted {
                room_id: room_id.to_string(),
                reason: cause.reason().to_string(),
            };
            if let Err(fault) = self.send_to(connection_id, notice) {
                debug!(connection = %connection_id, error = %fault, "Eviction notice not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(adapter: &PushAdapter, room: &str, conn: &str) -> mpsc::Receiver<Frame> {
        let id = ConnectionId::from(conn);
        let rx = adapter.connect(id.clone());
        adapter.attach(room, &id, TransportKind::Push);
        rx
    }

    #[tokio::test]
    async fn test_deliver_to_room_members_only() {
        let adapter = PushAdapter::new(8);
        let mut a = joined(&adapter, "r1", "a");
        let mut b = joined(&adapter, "r2", "b");

        let delivered = adapter
            .deliver(&Event::user_joined("r1", "u1", "alice"))
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(a.recv().await, Some(Frame::UserJoined { .. })));
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_attach_ignores_pull_connections() {
        let adapter = PushAdapter::new(8);
        adapter.attach("r1", &"bridge_u1_x".into(), TransportKind::Pull);
        let _rx = adapter.connect("c1".into());
        adapter.attach("r1", &"c1".into(), TransportKind::Pull);
        assert_eq!(adapter.subscribers("r1"), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let adapter = PushAdapter::new(1);
        let _slow = joined(&adapter, "r1", "slow");
        let mut fast = joined(&adapter, "r1", "fast");

        adapter.deliver(&Event::user_joined("r1", "u1", "a")).unwrap();
        assert!(fast.recv().await.is_some());

        // `slow` never drains, so its queue is full now.
        let delivered = adapter.deliver(&Event::user_left("r1", "u1", "a")).unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(fast.recv().await, Some(Frame::UserLeft { .. })));
    }

    #[test]
    fn test_closed_subscriber_is_isolated() {
        let adapter = PushAdapter::new(4);
        drop(joined(&adapter, "r1", "gone"));
        let mut alive = joined(&adapter, "r1", "alive");

        assert_eq!(
            adapter.deliver(&Event::user_joined("r1", "u1", "a")).unwrap(),
            1
        );
        assert!(alive.try_recv().is_ok());
    }

    #[test]
    fn test_detach_sends_eviction_notice_on_timeout() {
        let adapter = PushAdapter::new(4);
        let mut rx = joined(&adapter, "r1", "c1");

        adapter.detach("r1", &"c1".into(), RemovalCause::TimedOut);
        assert_eq!(adapter.subscribers("r1"), 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(Frame::Evicted { room_id, .. }) if room_id == "r1"
        ));

        let mut other = joined(&adapter, "r1", "c2");
        adapter.detach("r1", &"c2".into(), RemovalCause::Requested);
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_probe_and_disconnect() {
        let adapter = PushAdapter::new(4);
        let mut a = joined(&adapter, "r1", "a");
        let _b = joined(&adapter, "r1", "b");

        assert_eq!(adapter.probe(), 2);
        assert!(matches!(a.try_recv(), Ok(Frame::Ping)));

        assert!(adapter.disconnect(&"a".into()));
        assert!(!adapter.disconnect(&"a".into()));
        assert_eq!(adapter.client_count(), 1);
        assert_eq!(adapter.subscribers("r1"), 1);
    }
}
