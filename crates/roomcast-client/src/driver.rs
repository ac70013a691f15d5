//! Deadline ownership for the join protocol.
//!
//! [`JoinDriver`] runs the timer effects of a [`JoinProtocol`] and hands
//! every other effect back to its caller. It owns at most one deadline task;
//! arming a new one cancels the old, and so does dropping the driver.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::trace;

use crate::join::{Effect, JoinProtocol, LeaveCause};

struct Deadline {
    attempt: u64,
    _guard: DropGuard,
}

/// A [`JoinProtocol`] plus its single deadline timer.
pub struct JoinDriver {
    protocol: JoinProtocol,
    deadline: Option<Deadline>,
    expired_tx: mpsc::UnboundedSender<u64>,
    expired_rx: mpsc::UnboundedReceiver<u64>,
}

impl Default for JoinDriver {
    fn default() -> Self {
        Self::new(JoinProtocol::default())
    }
}

impl JoinDriver {
    #[must_use]
    pub fn new(protocol: JoinProtocol) -> Self {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            protocol,
            deadline: None,
            expired_tx,
            expired_rx,
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &JoinProtocol {
        &self.protocol
    }

    /// Attempt whose deadline is pending, if any.
    #[must_use]
    pub fn pending_deadline(&self) -> Option<u64> {
        self.deadline.as_ref().map(|d| d.attempt)
    }

    pub fn request(&mut self, room_id: &str) -> Vec<Effect> {
        let effects = self.protocol.request(room_id);
        self.run(effects)
    }

    pub fn ack(&mut self, room_id: &str) -> Vec<Effect> {
        let effects = self.protocol.ack(room_id);
        self.run(effects)
    }

    pub fn reject(&mut self, room_id: &str, code: u16, message: impl Into<String>) -> Vec<Effect> {
        let effects = self.protocol.reject(room_id, code, message);
        self.run(effects)
    }

    pub fn leave(&mut self) -> Vec<Effect> {
        let effects = self.protocol.leave();
        self.run(effects)
    }

    pub fn forced_leave(&mut self, room_id: &str, cause: LeaveCause) -> Vec<Effect> {
        let effects = self.protocol.forced_leave(room_id, cause);
        self.run(effects)
    }

    /// Wait for the pending deadline to elapse and apply it.
    ///
    /// Pends forever while no deadline is armed. Cancel safe.
    pub async fn expired(&mut self) -> Vec<Effect> {
        loop {
            // The driver holds a sender, so the channel never closes.
            let Some(attempt) = self.expired_rx.recv().await else {
                return Vec::new();
            };
            if self.pending_deadline() == Some(attempt) {
                self.deadline = None;
            }
            let effects = self.protocol.deadline_elapsed(attempt);
            if !effects.is_empty() {
                return self.run(effects);
            }
            trace!(attempt, "Ignoring stale join deadline");
        }
    }

    /// Apply timer effects; return the rest in order.
    fn run(&mut self, effects: Vec<Effect>) -> Vec<Effect> {
        effects
            .into_iter()
            .filter(|effect| match effect {
                Effect::ArmDeadline { attempt, after } => {
                    self.arm(*attempt, *after);
                    false
                }
                Effect::CancelDeadline => {
                    self.deadline = None;
                    false
                }
                _ => true,
            })
            .collect()
    }

    fn arm(&mut self, attempt: u64, after: Duration) {
        let token = CancellationToken::new();
        let child = token.clone();
        let expired = self.expired_tx.clone();
        let at = Instant::now() + after;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = tokio::time::sleep_until(at) => {
                    let _ = expired.send(attempt);
                }
            }
        });

        // Replacing the previous deadline drops its guard, cancelling it.
        self.deadline = Some(Deadline {
            attempt,
            _guard: token.drop_guard(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{JoinFailure, JoinState};

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_join() {
        let mut driver = JoinDriver::default();
        let effects = driver.request("a");

        assert_eq!(effects, vec![Effect::SendJoin { room_id: "a".into() }]);
        assert_eq!(driver.pending_deadline(), Some(1));

        let effects = driver.expired().await;
        assert_eq!(
            effects[0],
            Effect::JoinFailed {
                room_id: "a".into(),
                failure: JoinFailure::Timeout
            }
        );
        assert_eq!(driver.pending_deadline(), None);
        assert_eq!(driver.protocol().state(), &JoinState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_cancels_deadline() {
        let mut driver = JoinDriver::default();
        driver.request("a");
        driver.ack("a");
        assert_eq!(driver.pending_deadline(), None);

        tokio::time::advance(Duration::from_secs(10)).await;
        let waited = tokio::time::timeout(Duration::from_secs(1), driver.expired()).await;
        assert!(waited.is_err());
        assert_eq!(driver.protocol().joined_room(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_deadline_cannot_fire_for_new_target() {
        let mut driver = JoinDriver::default();
        driver.request("a");
        tokio::time::advance(Duration::from_secs(3)).await;

        driver.request("b");
        assert_eq!(driver.pending_deadline(), Some(2));

        // Past the first deadline, short of the second.
        tokio::time::advance(Duration::from_secs(3)).await;
        let early = tokio::time::timeout(Duration::from_millis(100), driver.expired()).await;
        assert!(early.is_err());
        assert_eq!(driver.protocol().target(), Some("b"));

        let effects = driver.expired().await;
        assert_eq!(
            effects[0],
            Effect::JoinFailed {
                room_id: "b".into(),
                failure: JoinFailure::Timeout
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_leave_cancels_deadline() {
        let mut driver = JoinDriver::default();
        driver.request("a");

        let effects = driver.forced_leave("a", LeaveCause::RoomDeleted { reason: "gone".into() });
        assert!(!effects.is_empty());
        assert_eq!(driver.pending_deadline(), None);

        let waited = tokio::time::timeout(Duration::from_secs(30), driver.expired()).await;
        assert!(waited.is_err());
    }
}
