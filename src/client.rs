use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::types::{ErrorInfo, Message, ReadyState};
use crate::ws::config::Options;
use crate::ws::error::TransportError;
use crate::ws::registry::Membership;
use crate::ws::subscriber::Subscriber;
use crate::ws::{
    ConnectionConfig, ConnectionSupervisor, Delivery, Endpoint, Link, SharedConnectionRegistry,
    TransportFactory, TransportKind,
};

/// Opens supervised connections.
///
/// # Examples
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use futures::StreamExt as _;
/// use socket_lifecycle::Client;
/// use socket_lifecycle::ws::config::{HeartbeatConfig, Options};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::default();
///     let options = Options::default()
///         .heartbeat(HeartbeatConfig::default())
///         .should_reconnect(|_| true)
///         .reconnect_interval(Duration::from_secs(1));
///
///     let connection = client.open("wss://echo.example.com", options)?;
///     connection.send("hello", true)?;
///
///     let mut messages = Box::pin(connection.messages()?);
///     while let Some(message) = messages.next().await {
///         println!("{:?}", message?);
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    registry: Arc<SharedConnectionRegistry>,
    factory: Arc<dyn TransportFactory>,
}

#[cfg(feature = "tungstenite")]
impl Default for Client {
    fn default() -> Self {
        Self::new(crate::ws::TungsteniteFactory)
    }
}

impl Client {
    /// Client with its own registry.
    pub fn new<F: TransportFactory>(factory: F) -> Self {
        Self::with_registry(factory, Arc::new(SharedConnectionRegistry::new()))
    }

    /// Client whose shared connections live in `registry`.
    pub fn with_registry<F: TransportFactory>(
        factory: F,
        registry: Arc<SharedConnectionRegistry>,
    ) -> Self {
        Self {
            registry,
            factory: Arc::new(factory),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SharedConnectionRegistry> {
        &self.registry
    }

    /// Open a connection to `endpoint`.
    ///
    /// Fails only for invalid configuration; connection problems are reported through the
    /// callbacks in `options` and the handle's state.
    pub fn open<E: Into<Endpoint>>(&self, endpoint: E, options: Options) -> Result<ConnectionHandle> {
        options.validate()?;
        let endpoint = endpoint.into();
        if let Endpoint::Static(key) = &endpoint {
            self.factory.validate(key)?;
        }

        let subscriber = Subscriber::new(options);
        subscriber.set_state(ReadyState::Connecting);
        let config = ConnectionConfig::from(subscriber.options());
        let binding = Arc::new(Mutex::new(Binding::Pending));
        let token = CancellationToken::new();
        let mut resolution = None;

        match endpoint {
            endpoint if !subscriber.options().share => {
                let supervisor = ConnectionSupervisor::start(
                    endpoint,
                    Arc::clone(&self.factory),
                    config,
                    Arc::clone(&subscriber),
                );
                *lock(&binding) = Binding::Private(supervisor);
            }
            Endpoint::Static(key) => {
                let membership = self.registry.join(
                    key,
                    Arc::clone(&subscriber),
                    Arc::clone(&self.factory),
                    config,
                );
                *lock(&binding) = Binding::Shared(membership);
            }
            endpoint @ Endpoint::Dynamic(_) => {
                let shared = Arc::new(SharedResolution {
                    endpoint,
                    subscriber: Arc::clone(&subscriber),
                    binding: Arc::clone(&binding),
                    registry: Arc::clone(&self.registry),
                    factory: Arc::clone(&self.factory),
                    config,
                    token: token.clone(),
                });
                tokio::spawn(Arc::clone(&shared).run());
                resolution = Some(shared);
            }
        }

        Ok(ConnectionHandle {
            subscriber,
            binding,
            registry: Arc::clone(&self.registry),
            resolution,
            token,
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// What a handle is attached to.
enum Binding {
    /// A shared dynamic endpoint that is still being resolved, or gave up resolving.
    Pending,
    Private(ConnectionSupervisor),
    Shared(Membership),
    Released,
}

impl Binding {
    fn link(&self) -> Option<&Arc<Link>> {
        match self {
            Self::Private(supervisor) => Some(supervisor.link()),
            Self::Shared(membership) => Some(membership.supervisor().link()),
            Self::Pending | Self::Released => None,
        }
    }
}

fn lock(binding: &Mutex<Binding>) -> MutexGuard<'_, Binding> {
    binding.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves a dynamic endpoint once, retrying under the subscriber's policy, then joins the
/// registry with the resolved key.
struct SharedResolution {
    endpoint: Endpoint,
    subscriber: Arc<Subscriber>,
    binding: Arc<Mutex<Binding>>,
    registry: Arc<SharedConnectionRegistry>,
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    token: CancellationToken,
}

impl SharedResolution {
    async fn run(self: Arc<Self>) {
        loop {
            let resolved = tokio::select! {
                biased;

                () = self.token.cancelled() => return,
                key = self.endpoint.resolve() => key,
            };
            let validated = resolved.and_then(|key| {
                self.factory.validate(&key)?;
                Ok(key)
            });

            match validated {
                Ok(key) => {
                    let mut binding = lock(&self.binding);
                    if self.token.is_cancelled() || self.subscriber.is_disposed() {
                        return;
                    }
                    *binding = Binding::Shared(self.registry.join(
                        key,
                        Arc::clone(&self.subscriber),
                        Arc::clone(&self.factory),
                        self.config.clone(),
                    ));
                    return;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %e, "Unable to resolve endpoint");

                    self.subscriber.notify_error(&ErrorInfo::from(&e));
                    let Some(timer) = self.subscriber.schedule_retry() else {
                        self.subscriber.mark_closed();
                        return;
                    };
                    tokio::select! {
                        biased;

                        () = self.token.cancelled() => return,
                        () = timer => self.subscriber.increment_attempts(),
                    }
                }
            }
        }
    }
}

/// A caller's handle to one logical connection.
///
/// Dropping the handle disposes it.
pub struct ConnectionHandle {
    subscriber: Arc<Subscriber>,
    binding: Arc<Mutex<Binding>>,
    registry: Arc<SharedConnectionRegistry>,
    resolution: Option<Arc<SharedResolution>>,
    token: CancellationToken,
}

impl ConnectionHandle {
    /// Send `message` now if open. Otherwise buffer it when `keep` is set, or drop it.
    pub fn send<M: Into<Message>>(&self, message: M, keep: bool) -> Result<Delivery> {
        if self.subscriber.is_disposed() {
            return Err(TransportError::Disposed.into());
        }

        let link = lock(&self.binding).link().map(Arc::clone);
        self.subscriber.send(message.into(), keep, |message| match &link {
            Some(link) => link.send(message),
            None => Err(TransportError::ConnectionClosed.into()),
        })
    }

    /// Serialize `value` as JSON and [`send`](Self::send) it as text.
    pub fn send_json<T: Serialize>(&self, value: &T, keep: bool) -> Result<Delivery> {
        let json = serde_json::to_string(value)?;
        self.send(json, keep)
    }

    #[must_use]
    pub fn state(&self) -> ReadyState {
        self.subscriber.state()
    }

    /// Receiver notified on every state change of this handle.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ReadyState> {
        self.subscriber.state_receiver()
    }

    /// Stream of inbound messages. Ends when the handle is disposed.
    pub fn messages(&self) -> Result<impl Stream<Item = Result<Message>> + use<>> {
        let mut rx = self
            .subscriber
            .message_receiver()
            .ok_or(TransportError::Disposed)?;

        Ok(try_stream! {
            loop {
                match rx.recv().await {
                    Ok(message) => yield message,
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Message stream lagged, missed {n} messages");
                        Err(TransportError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Number of reconnect attempts since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.subscriber.attempts()
    }

    /// Restore this handle's retry budget and reconnect now if the connection is down.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] once the connection was torn down by
    /// [`SharedConnectionRegistry::reset`]; such a handle has to be opened again.
    pub fn reconnect(&self) -> Result<()> {
        if self.subscriber.is_disposed() {
            return Err(TransportError::Disposed.into());
        }
        self.subscriber.reset_attempts();

        match &*lock(&self.binding) {
            Binding::Private(supervisor) => supervisor.request_reconnect()?,
            Binding::Shared(membership) => membership.supervisor().request_reconnect()?,
            Binding::Pending => {
                if let Some(resolution) = &self.resolution
                    && self.subscriber.state() == ReadyState::Closed
                {
                    self.subscriber.set_state(ReadyState::Connecting);
                    tokio::spawn(Arc::clone(resolution).run());
                }
            }
            Binding::Released => return Err(TransportError::Disposed.into()),
        }
        Ok(())
    }

    /// Tear down this handle. Safe to call more than once.
    ///
    /// No callback fires once this returns, and a connection attempt still in flight can no
    /// longer revive the connection.
    pub fn dispose(&self) {
        if !self.subscriber.begin_dispose() {
            return;
        }

        let binding = std::mem::replace(&mut *lock(&self.binding), Binding::Released);
        let closing = self.subscriber.state().is_open()
            && binding.link().and_then(|link| link.kind()) == Some(TransportKind::Bidirectional);
        if closing {
            self.subscriber.begin_closing();
        }

        self.token.cancel();
        match binding {
            Binding::Private(supervisor) => supervisor.stop(),
            Binding::Shared(membership) => self.registry.leave(&membership),
            Binding::Pending | Binding::Released => {}
        }

        self.subscriber.finish_dispose();

        #[cfg(feature = "tracing")]
        tracing::debug!(subscriber = self.subscriber.id(), "Connection handle disposed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}
