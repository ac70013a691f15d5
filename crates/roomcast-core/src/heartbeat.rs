//! Heartbeat probing and stale-connection sweeping.
//!
//! Two timers per deployment, not per connection: the probe timer pings
//! every live connection, the sweep timer evicts connections whose last pong
//! is older than the timeout window. Both tasks stop when their
//! [`HeartbeatHandle`] is shut down or dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::service::ChatService;

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest accepted probe interval. Timers cannot tick at a zero period.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Period of both the probe and the sweep timer.
    pub probe_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

impl HeartbeatConfig {
    /// Intervals below [`MIN_PROBE_INTERVAL`] are raised to it.
    #[must_use]
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            probe_interval: probe_interval.max(MIN_PROBE_INTERVAL),
        }
    }

    /// Silence tolerated before eviction: two probe intervals, so one missed
    /// probe is absorbed.
    #[must_use]
    pub fn timeout_window(&self) -> Duration {
        self.probe_interval * 2
    }

    #[must_use]
    pub fn is_expired(&self, silent_for: Duration) -> bool {
        silent_for > self.timeout_window()
    }
}

/// Runs the probe and sweep timers against a [`ChatService`].
pub struct HeartbeatMonitor {
    service: Arc<ChatService>,
    config: HeartbeatConfig,
    token: CancellationToken,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(service: Arc<ChatService>) -> Self {
        // The field is public, so normalize whatever the service was given.
        let config = HeartbeatConfig::new(service.config().heartbeat.probe_interval);
        Self {
            service,
            config,
            token: CancellationToken::new(),
        }
    }

    /// Stop the monitor when `token` is cancelled, in addition to the handle.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Spawn both timers.
    pub fn start(self) -> HeartbeatHandle {
        let period = self.config.probe_interval;
        info!(
            probe_interval_ms = period.as_millis() as u64,
            timeout_ms = self.config.timeout_window().as_millis() as u64,
            "Starting heartbeat monitor"
        );

        let probe = {
            let service = Arc::clone(&self.service);
            let token = self.token.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let probed = service.probe();
                            trace!(probed, "Heartbeat probe sent");
                        }
                    }
                }
                debug!("Probe timer stopped");
            })
        };

        let sweep = {
            let service = Arc::clone(&self.service);
            let token = self.token.clone();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => {
                            // One clock read per pass.
                            let now = Instant::now();
                            let evicted = service.sweep(now).await;
                            if evicted > 0 {
                                debug!(evicted, "Heartbeat sweep evicted stale connections");
                            }
                        }
                    }
                }
                debug!("Sweep timer stopped");
            })
        };

        HeartbeatHandle {
            token: self.token,
            tasks: vec![probe, sweep],
        }
    }
}

/// Owns the running heartbeat timers. Dropping it cancels them.
pub struct HeartbeatHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// The token that stops the timers.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the timers and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        info!("Heartbeat monitor stopped");
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::RecordingAdapter;
    use crate::bus::RemovalCause;
    use crate::room::{ConnectionId, TransportKind};
    use crate::service::tests::{alice, service_with, service_with_config};
    use crate::service::ServiceConfig;

    #[test]
    fn test_timeout_window() {
        let config = HeartbeatConfig::new(Duration::from_secs(10));
        assert_eq!(config.timeout_window(), Duration::from_secs(20));
        assert!(!config.is_expired(Duration::from_secs(19)));
        assert!(!config.is_expired(Duration::from_secs(20)));
        assert!(config.is_expired(Duration::from_secs(21)));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = HeartbeatConfig::new(Duration::ZERO);
        assert_eq!(config.probe_interval, MIN_PROBE_INTERVAL);
        assert_eq!(config.timeout_window(), Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_starts_with_zero_interval() {
        let adapter = Arc::new(RecordingAdapter::default());
        let config = ServiceConfig {
            heartbeat: HeartbeatConfig {
                probe_interval: Duration::ZERO,
            },
            ..ServiceConfig::default()
        };
        let (service, _room) = service_with_config(adapter.clone(), config).await;

        let handle = HeartbeatMonitor::new(Arc::new(service)).start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(*adapter.probes.lock().unwrap() >= 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_probes_and_evicts() {
        let adapter = Arc::new(RecordingAdapter::default());
        let (service, room) = service_with(adapter.clone()).await;
        let service = Arc::new(service);

        let conn = ConnectionId::from("c1");
        service
            .join(&alice(), &room, conn.clone(), TransportKind::Push)
            .await
            .unwrap();

        let handle = HeartbeatMonitor::new(Arc::clone(&service)).start();

        // Sweeps at t=10 and t=20 see at most 20s of silence.
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(service.registry().room_size(&room), 1);
        assert_eq!(*adapter.probes.lock().unwrap(), 2);

        // The sweep at t=30 evicts.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.registry().room_size(&room), 0);
        assert!(adapter
            .detached()
            .contains(&(room.clone(), conn, RemovalCause::TimedOut)));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_connection_alive() {
        let adapter = Arc::new(RecordingAdapter::default());
        let (service, room) = service_with(adapter).await;
        let service = Arc::new(service);

        let conn = ConnectionId::from("c1");
        service
            .join(&alice(), &room, conn.clone(), TransportKind::Pull)
            .await
            .unwrap();

        let handle = HeartbeatMonitor::new(Arc::clone(&service)).start();
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert!(service.heartbeat(&room, &conn));
        }
        assert_eq!(service.registry().room_size(&room), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_timers() {
        let adapter = Arc::new(RecordingAdapter::default());
        let (service, _room) = service_with(adapter.clone()).await;

        let handle = HeartbeatMonitor::new(Arc::new(service)).start();
        let token = handle.token();
        drop(handle);
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*adapter.probes.lock().unwrap(), 0);
    }
}
