//! Retry budget and delay scheduling.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::{Sleep, sleep};

use super::config::{ReconnectConfig, ReconnectInterval};

/// Decides whether another reconnect attempt may run and after how long.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    interval: ReconnectInterval,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            interval: config.interval.clone(),
        }
    }

    /// Delay before the next attempt, or `None` once `attempt` has used up the budget.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.interval.delay(attempt))
    }

    /// Arm a timer for the next attempt.
    ///
    /// When the budget is exhausted no timer is returned and `on_stop` receives the
    /// configured maximum instead. The caller increments its attempt count when the timer
    /// completes, before reconnecting.
    pub fn schedule_retry<F>(&self, attempt: u32, on_stop: F) -> Option<ReconnectTimer>
    where
        F: FnOnce(u32),
    {
        if let Some(delay) = self.next_delay(attempt) {
            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, ?delay, "Scheduling reconnect");
            return Some(ReconnectTimer::after(delay));
        }

        #[cfg(feature = "tracing")]
        tracing::warn!("Max reconnect attempts of {} exceeded", self.max_attempts);
        on_stop(self.max_attempts);
        None
    }
}

/// A pending reconnect. Completes after its delay; dropping it cancels the retry.
#[derive(Debug)]
#[must_use = "a reconnect timer does nothing unless awaited"]
pub struct ReconnectTimer {
    sleep: Pin<Box<Sleep>>,
    delay: Duration,
}

impl ReconnectTimer {
    pub fn after(delay: Duration) -> Self {
        Self {
            sleep: Box::pin(sleep(delay)),
            delay,
        }
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

impl Future for ReconnectTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.sleep.as_mut().poll(cx)
    }
}
