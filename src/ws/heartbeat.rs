//! Keep-alive pings and inbound liveness checks.
//!
//! Ping cadence and liveness are separate tasks: pings are sent without expecting a
//! reply, while the liveness task only looks for *any* inbound message since its previous
//! tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;

use super::config::HeartbeatConfig;
use super::traits::Transport;

/// Heartbeat tasks attached to one transport. Dropping the monitor detaches it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    activity: Arc<AtomicBool>,
    token: CancellationToken,
}

impl HeartbeatMonitor {
    /// Start the ping and liveness tasks. Both stop when `parent` is cancelled.
    #[must_use]
    pub fn attach(
        transport: Arc<dyn Transport>,
        config: &HeartbeatConfig,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let activity = Arc::new(AtomicBool::new(false));

        let ping_transport = Arc::clone(&transport);
        let message = config.message.clone();
        let ping_token = token.clone();
        let period = config.interval;
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;

                    () = ping_token.cancelled() => break,
                    _ = ticks.tick() => {
                        // Send failures surface through the transport's own events
                        if let Err(e) = ping_transport.send(message.next()) {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(error = %e, "Heartbeat ping failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                }
            }
        });

        let liveness_activity = Arc::clone(&activity);
        let liveness_token = token.clone();
        let window = config.timeout;
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + window, window);
            loop {
                tokio::select! {
                    biased;

                    () = liveness_token.cancelled() => break,
                    _ = ticks.tick() => {
                        if !liveness_activity.swap(false, Ordering::AcqRel) {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(?window, "No inbound activity, closing transport");
                            _ = transport.close();
                            break;
                        }
                    }
                }
            }
        });

        Self { activity, token }
    }

    /// Record that a message arrived. Consumed by the next liveness tick.
    pub fn mark_inbound_activity(&self) {
        self.activity.store(true, Ordering::Release);
    }

    pub fn detach(&self) {
        self.token.cancel();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Closes a transport that has been silent for longer than `timeout`.
///
/// Unlike the heartbeat liveness check this is a sliding window: every inbound message
/// restarts the countdown.
#[derive(Debug)]
pub struct MessageWatchdog {
    activity: Arc<Notify>,
    token: CancellationToken,
}

impl MessageWatchdog {
    #[must_use]
    pub fn attach(
        transport: Arc<dyn Transport>,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let activity = Arc::new(Notify::new());

        let task_activity = Arc::clone(&activity);
        let task_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = task_token.cancelled() => break,
                    () = task_activity.notified() => {}
                    () = sleep(timeout) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(?timeout, "Message timeout elapsed, closing transport");
                        _ = transport.close();
                        break;
                    }
                }
            }
        });

        Self { activity, token }
    }

    pub fn mark_inbound_activity(&self) {
        self.activity.notify_one();
    }

    pub fn detach(&self) {
        self.token.cancel();
    }
}

impl Drop for MessageWatchdog {
    fn drop(&mut self) {
        self.detach();
    }
}
