#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use crate::Result;
use crate::error::Error;
use crate::types::{CloseInfo, ErrorInfo, Message};

pub(crate) const DEFAULT_RECONNECT_ATTEMPTS: u32 = 20;
pub(crate) const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(5000);
const DEFAULT_HEARTBEAT_MESSAGE: &str = "ping";
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(25);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

pub(crate) type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub(crate) type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Delay before a reconnect attempt.
#[non_exhaustive]
#[derive(Clone)]
pub enum ReconnectInterval {
    /// Same delay before every attempt.
    Fixed(Duration),
    /// Delay computed by the caller from the number of attempts already made.
    Computed(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
    /// Jittered exponential backoff.
    Exponential(ExponentialBackoffConfig),
}

impl ReconnectInterval {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Delay before the attempt that follows `attempt` previous ones.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Computed(f) => f(attempt),
            Self::Exponential(config) => {
                let mut backoff: ExponentialBackoff = config.clone().into();
                let mut delay = config.initial_backoff;
                for _ in 0..=attempt {
                    match backoff.next_backoff() {
                        Some(next) => delay = next,
                        None => break,
                    }
                }
                delay
            }
        }
    }
}

impl Default for ReconnectInterval {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_INTERVAL_DURATION)
    }
}

impl From<Duration> for ReconnectInterval {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl fmt::Debug for ReconnectInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
            Self::Exponential(config) => f.debug_tuple("Exponential").field(config).finish(),
        }
    }
}

/// Parameters for [`ReconnectInterval::Exponential`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ExponentialBackoffConfig {
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ExponentialBackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ExponentialBackoffConfig> for ExponentialBackoff {
    fn from(config: ExponentialBackoffConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // Attempts are budgeted separately
            .build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
    pub interval: ReconnectInterval,
    /// Also schedule a reconnect on transport `error`, not just on `close`.
    pub retry_on_error: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            interval: ReconnectInterval::default(),
            retry_on_error: false,
        }
    }
}

/// Keep-alive payload, either fixed or produced per tick.
#[non_exhaustive]
#[derive(Clone)]
pub enum HeartbeatMessage {
    Static(Message),
    Generated(Arc<dyn Fn() -> Message + Send + Sync>),
}

impl HeartbeatMessage {
    pub fn generated<F>(f: F) -> Self
    where
        F: Fn() -> Message + Send + Sync + 'static,
    {
        Self::Generated(Arc::new(f))
    }

    #[must_use]
    pub fn next(&self) -> Message {
        match self {
            Self::Static(message) => message.clone(),
            Self::Generated(f) => f(),
        }
    }
}

impl Default for HeartbeatMessage {
    fn default() -> Self {
        Self::Static(Message::from(DEFAULT_HEARTBEAT_MESSAGE))
    }
}

impl From<&str> for HeartbeatMessage {
    fn from(message: &str) -> Self {
        Self::Static(message.into())
    }
}

impl From<Message> for HeartbeatMessage {
    fn from(message: Message) -> Self {
        Self::Static(message)
    }
}

impl fmt::Debug for HeartbeatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(message) => f.debug_tuple("Static").field(message).finish(),
            Self::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

/// Heartbeat behaviour: `interval` is the ping cadence, `timeout` the liveness window.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct HeartbeatConfig {
    #[builder(into, default)]
    pub message: HeartbeatMessage,
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub interval: Duration,
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            message: HeartbeatMessage::default(),
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        }
    }
}

/// Observer callbacks of one subscriber.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    pub(crate) on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_close: Option<Callback<CloseInfo>>,
    pub(crate) on_message: Option<Callback<Message>>,
    pub(crate) on_error: Option<Callback<ErrorInfo>>,
    pub(crate) on_reconnect_stop: Option<Callback<u32>>,
    pub(crate) should_reconnect: Option<Predicate<CloseInfo>>,
}

/// Per-connection configuration.
///
/// ```
/// use std::time::Duration;
///
/// use socket_lifecycle::ws::config::{HeartbeatConfig, Options};
///
/// let options = Options::default()
///     .shared()
///     .reconnect_attempts(5)
///     .reconnect_interval(Duration::from_millis(250))
///     .heartbeat(HeartbeatConfig::builder().interval(Duration::from_secs(10)).build())
///     .should_reconnect(|close| close.code != 1000)
///     .on_message(|message| println!("{message:?}"));
/// # let _ = options;
/// ```
#[non_exhaustive]
#[derive(Clone, Default)]
pub struct Options {
    /// Route through the shared registry so equal endpoints use one physical connection.
    pub share: bool,
    /// Sub-protocols forwarded to the transport factory.
    pub protocols: Vec<String>,
    pub reconnect: ReconnectConfig,
    /// `None` disables heartbeats.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Close the transport if no inbound message arrives within this window.
    pub message_timeout: Option<Duration>,
    pub(crate) handlers: Handlers,
}

impl Options {
    #[must_use]
    pub fn shared(mut self) -> Self {
        self.share = true;
        self
    }

    #[must_use]
    pub fn protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn reconnect_interval<I: Into<ReconnectInterval>>(mut self, interval: I) -> Self {
        self.reconnect.interval = interval.into();
        self
    }

    #[must_use]
    pub fn retry_on_error(mut self, retry: bool) -> Self {
        self.reconnect.retry_on_error = retry;
        self
    }

    #[must_use]
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    #[must_use]
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn should_reconnect<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CloseInfo) -> bool + Send + Sync + 'static,
    {
        self.handlers.should_reconnect = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.on_open = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        self.handlers.on_close = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handlers.on_message = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorInfo) + Send + Sync + 'static,
    {
        self.handlers.on_error = Some(Arc::new(callback));
        self
    }

    /// Called with the attempt budget once it is exhausted.
    #[must_use]
    pub fn on_reconnect_stop<F>(mut self, callback: F) -> Self
    where
        F: Fn(&u32) + Send + Sync + 'static,
    {
        self.handlers.on_reconnect_stop = Some(Arc::new(callback));
        self
    }

    /// Reject configurations that would make timers spin or panic.
    pub fn validate(&self) -> Result<()> {
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.interval.is_zero() {
                return Err(Error::validation("heartbeat interval must be non-zero"));
            }
            if heartbeat.timeout.is_zero() {
                return Err(Error::validation("heartbeat timeout must be non-zero"));
            }
        }

        if self.message_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::validation("message timeout must be non-zero"));
        }

        if let ReconnectInterval::Exponential(config) = &self.reconnect.interval
            && (config.backoff_multiplier.is_nan() || config.backoff_multiplier < 1.0)
        {
            return Err(Error::validation(
                "exponential backoff multiplier must be at least 1.0",
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("share", &self.share)
            .field("protocols", &self.protocols)
            .field("reconnect", &self.reconnect)
            .field("heartbeat", &self.heartbeat)
            .field("message_timeout", &self.message_timeout)
            .field(
                "should_reconnect",
                &self.handlers.should_reconnect.is_some(),
            )
            .finish_non_exhaustive()
    }
}
