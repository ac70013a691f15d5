//! A client session over a push connection.
//!
//! [`ClientSession`] performs the `Connect` handshake, drives a
//! [`JoinDriver`] from server frames, answers heartbeat probes for the joined
//! room, and reports what happened as [`ClientEvent`]s.

use roomcast_protocol::{Frame, MessageKind, PROTOCOL_VERSION};
use roomcast_transport::{Connection, TransportError};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::driver::JoinDriver;
use crate::error::ClientError;
use crate::join::{Effect, JoinFailure, JoinProtocol, LeaveCause};

/// What the server told us at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    pub heartbeat_ms: u64,
}

/// Something the embedding UI should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Entered {
        room_id: String,
        name: String,
        active_users: usize,
    },
    JoinFailed {
        room_id: String,
        failure: JoinFailure,
    },
    Left {
        room_id: String,
        cause: LeaveCause,
    },
    RoomViewCleared {
        room_id: String,
    },
    InputEnabled,
    UserJoined {
        room_id: String,
        username: String,
    },
    UserLeft {
        room_id: String,
        username: String,
    },
    Message {
        room_id: String,
        username: String,
        text: String,
        kind: MessageKind,
    },
    /// A non-join request failed.
    RequestFailed {
        code: u16,
        message: String,
    },
}

/// A connected chat client.
pub struct ClientSession<C> {
    conn: C,
    driver: JoinDriver,
    info: SessionInfo,
    next_id: u64,
    /// Request id and room of the join awaiting an answer.
    pending_join: Option<(u64, String)>,
    events: VecDeque<ClientEvent>,
}

impl<C: Connection> ClientSession<C> {
    /// Authenticate over `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rejected`] if the server refuses the
    /// credential or version, and a transport error if the connection fails.
    pub async fn connect(
        mut conn: C,
        token: &str,
        join_timeout: Duration,
    ) -> Result<Self, ClientError> {
        conn.send(Frame::connect(PROTOCOL_VERSION, token)).await?;

        let info = match conn.recv().await? {
            Some(Frame::Connected {
                connection_id,
                user_id,
                username,
                version,
                heartbeat_ms,
            }) => {
                info!(connection = %connection_id, user = %user_id, version = %version, "Connected");
                SessionInfo {
                    connection_id,
                    user_id,
                    username,
                    heartbeat_ms,
                }
            }
            Some(Frame::Error { code, message, .. }) => {
                let _ = conn.close().await;
                return Err(ClientError::Rejected { code, message });
            }
            Some(other) => {
                return Err(ClientError::Handshake(format!(
                    "expected connected, got {}",
                    other.frame_type().as_str()
                )))
            }
            None => return Err(ClientError::Handshake("connection closed".to_string())),
        };

        Ok(Self {
            conn,
            driver: JoinDriver::new(JoinProtocol::new(join_timeout)),
            info,
            next_id: 0,
            pending_join: None,
            events: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// The joined room, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.driver.protocol().joined_room()
    }

    #[must_use]
    pub fn protocol(&self) -> &JoinProtocol {
        self.driver.protocol()
    }

    /// Start joining `room_id`. The outcome arrives as an event.
    ///
    /// # Errors
    ///
    /// Returns a transport error if a request cannot be sent.
    pub async fn join(&mut self, room_id: &str) -> Result<(), ClientError> {
        let effects = self.driver.request(room_id);
        self.perform(effects).await
    }

    /// Join `room_id` and wait for the outcome. Other events stay queued.
    ///
    /// Returns at once if `room_id` is already the joined room.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::JoinTimeout`] or [`ClientError::Rejected`] if
    /// the join fails.
    pub async fn join_and_wait(&mut self, room_id: &str) -> Result<(), ClientError> {
        let already_joined = self.room() == Some(room_id);
        self.join(room_id).await?;
        // No acknowledgement follows a request for the joined room.
        if already_joined {
            return Ok(());
        }

        let mut held = VecDeque::new();
        let result = loop {
            match self.next_event().await {
                Ok(Some(ClientEvent::Entered { room_id: entered, .. })) if entered == room_id => {
                    break Ok(());
                }
                Ok(Some(ClientEvent::JoinFailed { room_id: failed, failure })) if failed == room_id => {
                    break Err(failure.into_error(failed));
                }
                Ok(Some(event)) => held.push_back(event),
                Ok(None) => break Err(TransportError::ConnectionClosed.into()),
                Err(e) => break Err(e),
            }
        };

        held.append(&mut self.events);
        self.events = held;
        result
    }

    /// Leave the current room, or abandon a pending join.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request cannot be sent.
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        let effects = self.driver.leave();
        self.perform(effects).await
    }

    /// Post to the joined room.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotJoined`] outside a room.
    pub async fn post(&mut self, text: &str) -> Result<(), ClientError> {
        let room_id = self.room().ok_or(ClientError::NotJoined)?.to_string();
        let id = self.request_id();
        self.conn.send(Frame::post(id, room_id, text)).await?;
        Ok(())
    }

    /// Wait for the next event. Returns `None` once the server closes the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection fails.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            tokio::select! {
                inbound = self.conn.recv() => {
                    match inbound? {
                        Some(frame) => self.handle_frame(frame).await?,
                        None => return Ok(None),
                    }
                }
                effects = self.driver.expired() => {
                    self.pending_join = None;
                    self.perform(effects).await?;
                }
            }
        }
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close fails.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.conn.close().await?;
        Ok(())
    }

    fn request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn in_room(&self, room_id: &str) -> bool {
        self.room() == Some(room_id)
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), ClientError> {
        trace!(frame_type = frame.frame_type().as_str(), "Frame received");
        match frame {
            Frame::Ping => {
                // Only the joined room is kept alive.
                if let Some(room_id) = self.room().map(str::to_string) {
                    self.conn.send(Frame::pong(room_id)).await?;
                }
            }

            Frame::Joined {
                id,
                room_id,
                name,
                active_users,
            } => {
                if self.pending_join.as_ref().is_some_and(|(pending, _)| *pending == id) {
                    self.pending_join = None;
                }
                for effect in self.driver.ack(&room_id) {
                    match effect {
                        Effect::Entered { room_id } => self.events.push_back(ClientEvent::Entered {
                            room_id,
                            name: name.clone(),
                            active_users,
                        }),
                        other => self.apply(other).await?,
                    }
                }
            }

            Frame::Error { id, code, message } => {
                match self.pending_join.take() {
                    Some((pending, room_id)) if pending == id => {
                        let effects = self.driver.reject(&room_id, code, message);
                        self.perform(effects).await?;
                    }
                    pending => {
                        self.pending_join = pending;
                        self.events
                            .push_back(ClientEvent::RequestFailed { code, message });
                    }
                }
            }

            Frame::RoomDeleted { room_id, reason, .. } => {
                let effects = self
                    .driver
                    .forced_leave(&room_id, LeaveCause::RoomDeleted { reason });
                self.perform(effects).await?;
            }

            Frame::Evicted { room_id, reason } => {
                let effects = self
                    .driver
                    .forced_leave(&room_id, LeaveCause::Evicted { reason });
                self.perform(effects).await?;
            }

            Frame::UserJoined {
                room_id, username, ..
            } if self.in_room(&room_id) => {
                self.events
                    .push_back(ClientEvent::UserJoined { room_id, username });
            }

            Frame::UserLeft {
                room_id, username, ..
            } if self.in_room(&room_id) => {
                self.events
                    .push_back(ClientEvent::UserLeft { room_id, username });
            }

            Frame::MessagePosted {
                room_id,
                username,
                text,
                kind,
                ..
            } if self.in_room(&room_id) => {
                self.events.push_back(ClientEvent::Message {
                    room_id,
                    username,
                    text,
                    kind,
                });
            }

            other => debug!(frame_type = other.frame_type().as_str(), "Ignoring frame"),
        }
        Ok(())
    }

    async fn perform(&mut self, effects: Vec<Effect>) -> Result<(), ClientError> {
        for effect in effects {
            self.apply(effect).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, effect: Effect) -> Result<(), ClientError> {
        match effect {
            Effect::SendJoin { room_id } => {
                let id = self.request_id();
                self.pending_join = Some((id, room_id.clone()));
                self.conn.send(Frame::join(id, room_id)).await?;
            }
            Effect::SendLeave { room_id } => {
                let id = self.request_id();
                self.conn.send(Frame::leave(id, room_id)).await?;
            }
            Effect::ClearRoomView { room_id } => {
                self.events.push_back(ClientEvent::RoomViewCleared { room_id });
            }
            Effect::EnableInput => self.events.push_back(ClientEvent::InputEnabled),
            Effect::Entered { room_id } => self.events.push_back(ClientEvent::Entered {
                room_id,
                name: String::new(),
                active_users: 0,
            }),
            Effect::JoinFailed { room_id, failure } => {
                self.pending_join = None;
                self.events
                    .push_back(ClientEvent::JoinFailed { room_id, failure });
            }
            Effect::Left { room_id, cause } => {
                self.events.push_back(ClientEvent::Left { room_id, cause });
            }
            // Timer effects are consumed by the driver.
            Effect::ArmDeadline { .. } | Effect::CancelDeadline => {}
        }
        Ok(())
    }
}
