//! Pull bridge.
//!
//! Bridge clients make discrete request/response calls ([`PullBridge`]) and
//! read events from a long-lived per-room subscription ([`BridgeAdapter`]).
//! Subscriptions receive only what is published after they are opened;
//! there is no replay.

use dashmap::DashMap;
use roomcast_core::{
    Adapter, ChatError, ChatService, ConnectionId, Event, Identity, JoinOutcome, RemovalCause,
    RoomId, StoredMessage, TransportFault, TransportKind, UserId,
};
use roomcast_protocol::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::wire::event_frame;

/// Default queue depth per subscription.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

struct Subscriber {
    id: u64,
    user_id: UserId,
    tx: mpsc::Sender<Frame>,
}

type Subscribers = DashMap<RoomId, Vec<Subscriber>>;

/// Offer a frame to every subscriber accepted by `filter`, pruning closed
/// ones. Returns how many accepted it.
fn fan_out(subscribers: &mut Vec<Subscriber>, frame: &Frame, filter: impl Fn(&Subscriber) -> bool) -> usize {
    let mut delivered = 0;
    subscribers.retain(|sub| {
        if !filter(sub) {
            return true;
        }
        match sub.tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(subscription = sub.id, user = %sub.user_id, "Bridge subscriber lagging, frame dropped");
                metrics::counter!("roomcast_delivery_faults_total", "adapter" => "bridge")
                    .increment(1);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    });
    delivered
}

/// Adapter feeding bridge subscriptions from the event bus.
pub struct BridgeAdapter {
    rooms: Arc<Subscribers>,
    /// Bridge membership connection -> user.
    members: DashMap<ConnectionId, UserId>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for BridgeAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

impl BridgeAdapter {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            members: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Open a subscription to a room's events from now on.
    pub fn subscribe(&self, room_id: &str, user_id: &str) -> BridgeSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .push(Subscriber {
                id,
                user_id: user_id.to_string(),
                tx,
            });

        debug!(room = %room_id, user = %user_id, subscription = id, "Bridge subscription opened");
        BridgeSubscription {
            id,
            room_id: room_id.to_string(),
            rx,
            rooms: Arc::clone(&self.rooms),
        }
    }

    /// Open subscriptions for a room.
    #[must_use]
    pub fn subscribers(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |subs| subs.len())
    }

    /// Record which user a bridge membership belongs to.
    pub fn register(&self, connection_id: ConnectionId, user_id: &str) {
        self.members.insert(connection_id, user_id.to_string());
    }

    pub fn unregister(&self, connection_id: &ConnectionId) {
        self.members.remove(connection_id);
    }
}

impl Adapter for BridgeAdapter {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn deliver(&self, event: &Event) -> Result<usize, TransportFault> {
        let delivered = match self.rooms.get_mut(event.room_id()) {
            Some(mut subscribers) => fan_out(&mut subscribers, &event_frame(event), |_| true),
            None => return Ok(0),
        };

        // Dropping the senders ends every subscription to a deleted room
        // once its queued frames are read.
        if matches!(event, Event::RoomDeleted { .. }) {
            if let Some((room_id, subscribers)) = self.rooms.remove(event.room_id()) {
                debug!(room = %room_id, subscriptions = subscribers.len(), "Bridge subscriptions closed");
            }
        }
        Ok(delivered)
    }

    fn probe(&self) -> usize {
        let mut probed = 0;
        for mut subscribers in self.rooms.iter_mut() {
            probed += fan_out(&mut subscribers, &Frame::Ping, |_| true);
        }
        probed
    }

    fn detach(&self, room_id: &str, connection_id: &ConnectionId, cause: RemovalCause) {
        let Some((_, user_id)) = self.members.remove(connection_id) else {
            return;
        };
        if !cause.notifies_connection() {
            return;
        }

        let notice = Frame::Evicted {
            room_id: room_id.to_string(),
            reason: cause.reason().to_string(),
        };
        if let Some(mut subscribers) = self.rooms.get_mut(room_id) {
            fan_out(&mut subscribers, &notice, |sub| sub.user_id == user_id);
        }
    }
}

/// A live bridge subscription. Dropping it unsubscribes.
pub struct BridgeSubscription {
    id: u64,
    room_id: RoomId,
    rx: mpsc::Receiver<Frame>,
    rooms: Arc<Subscribers>,
}

impl BridgeSubscription {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Next frame, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BridgeSubscription {
    fn drop(&mut self) {
        if let Some(mut subscribers) = self.rooms.get_mut(&self.room_id) {
            subscribers.retain(|sub| sub.id != self.id);
        }
        self.rooms.remove_if(&self.room_id, |_, subs| subs.is_empty());
        debug!(room = %self.room_id, subscription = self.id, "Bridge subscription closed");
    }
}

/// Request/response surface of the bridge.
///
/// Every call carries the client's credential.
#[derive(Clone)]
pub struct PullBridge {
    service: Arc<ChatService>,
    adapter: Arc<BridgeAdapter>,
}

impl PullBridge {
    #[must_use]
    pub fn new(service: Arc<ChatService>, adapter: Arc<BridgeAdapter>) -> Self {
        Self { service, adapter }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ChatService> {
        &self.service
    }

    async fn identify(&self, credential: &str) -> Result<Identity, ChatError> {
        self.service.authenticate(credential).await
    }

    /// Join a room through the bridge.
    ///
    /// Re-joining a room the user already holds through the bridge keeps the
    /// same bridge connection.
    ///
    /// # Errors
    ///
    /// Returns the service's join errors.
    pub async fn join(&self, credential: &str, room_id: &str) -> Result<JoinOutcome, ChatError> {
        let identity = self.identify(credential).await?;

        let existing = self
            .service
            .registry()
            .member_connection(room_id, &identity.user_id)
            .filter(|record| record.transport == TransportKind::Pull)
            .map(|record| record.connection_id);
        let reused = existing.is_some();
        let connection_id = existing.unwrap_or_else(|| ConnectionId::bridge(&identity.user_id));

        self.adapter
            .register(connection_id.clone(), &identity.user_id);
        let outcome = self
            .service
            .join(&identity, room_id, connection_id.clone(), TransportKind::Pull)
            .await;

        if outcome.is_err() && !reused {
            self.adapter.unregister(&connection_id);
        }
        outcome
    }

    /// Leave a room. Returns `false` if the user was not a member.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Unauthenticated`] for a bad credential.
    pub async fn leave(&self, credential: &str, room_id: &str) -> Result<bool, ChatError> {
        let identity = self.identify(credential).await?;
        Ok(self.service.leave_user(&identity, room_id).await)
    }

    /// Post a message.
    ///
    /// # Errors
    ///
    /// Returns the service's post errors.
    pub async fn post(
        &self,
        credential: &str,
        room_id: &str,
        text: &str,
    ) -> Result<StoredMessage, ChatError> {
        let identity = self.identify(credential).await?;
        self.service.post(&identity, room_id, text).await
    }

    /// Record a heartbeat pong.
    ///
    /// With a `connection_id`, only that membership is refreshed, and only if
    /// it belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotAMember`] if there is no matching membership.
    pub async fn pong(
        &self,
        credential: &str,
        room_id: &str,
        connection_id: Option<&str>,
    ) -> Result<(), ChatError> {
        let identity = self.identify(credential).await?;

        let touched = match connection_id {
            Some(id) => {
                let id = ConnectionId::from(id);
                let owned = self
                    .service
                    .registry()
                    .connection(room_id, &id)
                    .is_some_and(|record| record.user_id == identity.user_id);
                owned && self.service.heartbeat(room_id, &id)
            }
            None => self.service.heartbeat_user(&identity, room_id),
        };

        if touched {
            Ok(())
        } else {
            Err(ChatError::NotAMember(room_id.to_string()))
        }
    }

    /// Message history for a room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] for an unknown room.
    pub async fn messages(
        &self,
        credential: &str,
        room_id: &str,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<Vec<StoredMessage>, ChatError> {
        self.identify(credential).await?;
        self.service.list_messages(room_id, limit, skip).await
    }

    /// Open an event subscription for a room.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] for an unknown room.
    pub async fn subscribe(
        &self,
        credential: &str,
        room_id: &str,
    ) -> Result<BridgeSubscription, ChatError> {
        let identity = self.identify(credential).await?;
        let room = self.service.room(room_id).await?;
        let subscription = self.adapter.subscribe(&room.id, &identity.user_id);

        // Deleted between the lookup and the subscribe.
        if self.service.bus().is_closed(&room.id) {
            return Err(ChatError::RoomNotFound(room.id));
        }

        info!(room = %room.id, user = %identity.user_id, "Bridge subscriber attached");
        Ok(subscription)
    }
}
