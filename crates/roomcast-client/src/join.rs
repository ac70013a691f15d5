//! Client-side join state machine.
//!
//! [`JoinProtocol`] is pure: every input returns the [`Effect`]s the caller
//! must carry out. It never touches a socket or a timer itself, which keeps
//! the duplicate-join and stale-ack rules testable without a runtime.
//!
//! ```text
//!   Idle ──request(R)──▶ Joining(R, n) ──ack(R)──▶ Joined(R)
//!    ▲                        │                       │
//!    └──── deadline(n) ───────┘                       │
//!    └──────────── leave / RoomDeleted / Evicted ─────┘
//! ```

use std::time::Duration;

/// How long a join may wait for its acknowledgement.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the client stands with respect to rooms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    /// Waiting for the ack of attempt `attempt` to join `target`.
    Joining { target: String, attempt: u64 },
    Joined { room_id: String },
}

/// Why a join did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinFailure {
    /// No acknowledgement before the deadline.
    Timeout,
    /// The server answered with an error.
    Rejected { code: u16, message: String },
}

/// Why the client left a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveCause {
    Requested,
    RoomDeleted { reason: String },
    /// Removed by the server: heartbeat timeout or joined elsewhere.
    Evicted { reason: String },
}

/// Work the caller must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SendJoin { room_id: String },
    SendLeave { room_id: String },
    /// Drop locally shown messages and members of a room.
    ClearRoomView { room_id: String },
    /// Start the deadline for `attempt`, replacing any pending one.
    ArmDeadline { attempt: u64, after: Duration },
    CancelDeadline,
    /// Re-enable join/post affordances.
    EnableInput,
    Entered { room_id: String },
    JoinFailed { room_id: String, failure: JoinFailure },
    Left { room_id: String, cause: LeaveCause },
}

/// The join state machine.
#[derive(Debug)]
pub struct JoinProtocol {
    state: JoinState,
    attempts: u64,
    timeout: Duration,
}

impl Default for JoinProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_JOIN_TIMEOUT)
    }
}

impl JoinProtocol {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: JoinState::Idle,
            attempts: 0,
            timeout,
        }
    }

    #[must_use]
    pub fn state(&self) -> &JoinState {
        &self.state
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The room the client is in, if any.
    #[must_use]
    pub fn joined_room(&self) -> Option<&str> {
        match &self.state {
            JoinState::Joined { room_id } => Some(room_id),
            _ => None,
        }
    }

    /// The room the client is in or is joining.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match &self.state {
            JoinState::Joining { target, .. } => Some(target),
            JoinState::Joined { room_id } => Some(room_id),
            JoinState::Idle => None,
        }
    }

    /// The user asked to join `room_id`.
    ///
    /// Re-requesting the joined room is a no-op. A request while another
    /// join is pending supersedes it with a fresh attempt.
    pub fn request(&mut self, room_id: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        match &self.state {
            JoinState::Joined { room_id: current } if current == room_id => {
                return vec![Effect::EnableInput];
            }
            JoinState::Joined { room_id: current } => {
                effects.push(Effect::SendLeave {
                    room_id: current.clone(),
                });
                effects.push(Effect::ClearRoomView {
                    room_id: current.clone(),
                });
            }
            JoinState::Joining { .. } => effects.push(Effect::CancelDeadline),
            JoinState::Idle => {}
        }

        self.attempts += 1;
        self.state = JoinState::Joining {
            target: room_id.to_string(),
            attempt: self.attempts,
        };
        effects.push(Effect::SendJoin {
            room_id: room_id.to_string(),
        });
        effects.push(Effect::ArmDeadline {
            attempt: self.attempts,
            after: self.timeout,
        });
        effects
    }

    /// The server acknowledged a join of `room_id`.
    ///
    /// Acks for anything but the current target are stale and ignored.
    pub fn ack(&mut self, room_id: &str) -> Vec<Effect> {
        match &self.state {
            JoinState::Joining { target, .. } if target == room_id => {
                self.state = JoinState::Joined {
                    room_id: room_id.to_string(),
                };
                vec![
                    Effect::CancelDeadline,
                    Effect::Entered {
                        room_id: room_id.to_string(),
                    },
                    Effect::EnableInput,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// The server refused the join of `room_id`.
    pub fn reject(&mut self, room_id: &str, code: u16, message: impl Into<String>) -> Vec<Effect> {
        match &self.state {
            JoinState::Joining { target, .. } if target == room_id => {
                self.state = JoinState::Idle;
                vec![
                    Effect::CancelDeadline,
                    Effect::JoinFailed {
                        room_id: room_id.to_string(),
                        failure: JoinFailure::Rejected {
                            code,
                            message: message.into(),
                        },
                    },
                    Effect::EnableInput,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// The deadline of `attempt` elapsed. Ignored unless it is the pending one.
    pub fn deadline_elapsed(&mut self, attempt: u64) -> Vec<Effect> {
        match &self.state {
            JoinState::Joining {
                target,
                attempt: pending,
            } if *pending == attempt => {
                let room_id = target.clone();
                self.state = JoinState::Idle;
                vec![
                    Effect::JoinFailed {
                        room_id,
                        failure: JoinFailure::Timeout,
                    },
                    Effect::EnableInput,
                ]
            }
            _ => Vec::new(),
        }
    }

    /// The user left the current room, or abandoned a pending join.
    pub fn leave(&mut self) -> Vec<Effect> {
        match std::mem::replace(&mut self.state, JoinState::Idle) {
            JoinState::Idle => Vec::new(),
            JoinState::Joining { target, .. } => vec![
                Effect::CancelDeadline,
                Effect::SendLeave {
                    room_id: target.clone(),
                },
                Effect::Left {
                    room_id: target,
                    cause: LeaveCause::Requested,
                },
                Effect::EnableInput,
            ],
            JoinState::Joined { room_id } => vec![
                Effect::SendLeave {
                    room_id: room_id.clone(),
                },
                Effect::ClearRoomView {
                    room_id: room_id.clone(),
                },
                Effect::Left {
                    room_id,
                    cause: LeaveCause::Requested,
                },
                Effect::EnableInput,
            ],
        }
    }

    /// The server removed the client from `room_id`.
    ///
    /// Ignored when `room_id` is neither joined nor being joined.
    pub fn forced_leave(&mut self, room_id: &str, cause: LeaveCause) -> Vec<Effect> {
        if self.target() != Some(room_id) {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if matches!(self.state, JoinState::Joining { .. }) {
            effects.push(Effect::CancelDeadline);
        }
        self.state = JoinState::Idle;
        effects.push(Effect::ClearRoomView {
            room_id: room_id.to_string(),
        });
        effects.push(Effect::Left {
            room_id: room_id.to_string(),
            cause,
        });
        effects.push(Effect::EnableInput);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(protocol: &mut JoinProtocol, room: &str) {
        protocol.request(room);
        protocol.ack(room);
        assert_eq!(protocol.joined_room(), Some(room));
    }

    #[test]
    fn test_request_from_idle() {
        let mut protocol = JoinProtocol::default();
        let effects = protocol.request("a");

        assert_eq!(
            effects,
            vec![
                Effect::SendJoin { room_id: "a".into() },
                Effect::ArmDeadline {
                    attempt: 1,
                    after: DEFAULT_JOIN_TIMEOUT
                },
            ]
        );
        assert_eq!(
            protocol.state(),
            &JoinState::Joining {
                target: "a".into(),
                attempt: 1
            }
        );
    }

    #[test]
    fn test_ack_enters_room() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");

        let effects = protocol.ack("a");
        assert_eq!(effects[0], Effect::CancelDeadline);
        assert!(effects.contains(&Effect::Entered { room_id: "a".into() }));
        assert_eq!(protocol.joined_room(), Some("a"));
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");
        protocol.request("b");

        assert!(protocol.ack("a").is_empty());
        assert_eq!(protocol.target(), Some("b"));
        assert!(matches!(protocol.state(), JoinState::Joining { target, .. } if target == "b"));

        protocol.ack("b");
        assert_eq!(protocol.joined_room(), Some("b"));
        // A late ack for the abandoned target changes nothing.
        assert!(protocol.ack("a").is_empty());
        assert_eq!(protocol.joined_room(), Some("b"));
    }

    #[test]
    fn test_superseding_request_cancels_pending_deadline() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");

        let effects = protocol.request("b");
        assert_eq!(effects[0], Effect::CancelDeadline);
        assert!(effects.contains(&Effect::ArmDeadline {
            attempt: 2,
            after: DEFAULT_JOIN_TIMEOUT
        }));

        // The first attempt's deadline cannot touch the second.
        assert!(protocol.deadline_elapsed(1).is_empty());
        assert_eq!(protocol.target(), Some("b"));
    }

    #[test]
    fn test_deadline_returns_to_idle() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");

        let effects = protocol.deadline_elapsed(1);
        assert_eq!(
            effects[0],
            Effect::JoinFailed {
                room_id: "a".into(),
                failure: JoinFailure::Timeout
            }
        );
        assert_eq!(protocol.state(), &JoinState::Idle);

        // A late ack after the failure is still ignored.
        assert!(protocol.ack("a").is_empty());
        assert_eq!(protocol.state(), &JoinState::Idle);
    }

    #[test]
    fn test_switch_rooms_leaves_old_first() {
        let mut protocol = JoinProtocol::default();
        joined(&mut protocol, "a");

        let effects = protocol.request("b");
        assert_eq!(
            effects[..3],
            [
                Effect::SendLeave { room_id: "a".into() },
                Effect::ClearRoomView { room_id: "a".into() },
                Effect::SendJoin { room_id: "b".into() },
            ]
        );
    }

    #[test]
    fn test_request_for_joined_room_is_noop() {
        let mut protocol = JoinProtocol::default();
        joined(&mut protocol, "a");

        assert_eq!(protocol.request("a"), vec![Effect::EnableInput]);
        assert_eq!(protocol.joined_room(), Some("a"));
    }

    #[test]
    fn test_reject_fails_join() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");

        let effects = protocol.reject("a", 1005, "Room is full: a");
        assert!(effects.contains(&Effect::JoinFailed {
            room_id: "a".into(),
            failure: JoinFailure::Rejected {
                code: 1005,
                message: "Room is full: a".into()
            }
        }));
        assert_eq!(protocol.state(), &JoinState::Idle);
    }

    #[test]
    fn test_forced_leave() {
        let mut protocol = JoinProtocol::default();
        joined(&mut protocol, "a");

        // Other rooms are not ours to leave.
        assert!(protocol
            .forced_leave("b", LeaveCause::RoomDeleted { reason: "gone".into() })
            .is_empty());

        let effects = protocol.forced_leave(
            "a",
            LeaveCause::Evicted {
                reason: "Connection timed out".into(),
            },
        );
        assert!(!effects.contains(&Effect::CancelDeadline));
        assert!(effects.contains(&Effect::ClearRoomView { room_id: "a".into() }));
        assert_eq!(protocol.state(), &JoinState::Idle);
    }

    #[test]
    fn test_forced_leave_while_joining_cancels_deadline() {
        let mut protocol = JoinProtocol::default();
        protocol.request("a");

        let effects = protocol.forced_leave("a", LeaveCause::RoomDeleted { reason: "gone".into() });
        assert_eq!(effects[0], Effect::CancelDeadline);
        assert!(protocol.deadline_elapsed(1).is_empty());
    }

    #[test]
    fn test_leave() {
        let mut protocol = JoinProtocol::default();
        assert!(protocol.leave().is_empty());

        joined(&mut protocol, "a");
        let effects = protocol.leave();
        assert_eq!(effects[0], Effect::SendLeave { room_id: "a".into() });
        assert!(effects.contains(&Effect::Left {
            room_id: "a".into(),
            cause: LeaveCause::Requested
        }));
        assert_eq!(protocol.state(), &JoinState::Idle);
    }
}
