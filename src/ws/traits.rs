//! Capability traits consumed by the engine.
//!
//! The engine never owns a transport implementation. It only needs something that can
//! `send` and `close`, plus a channel of [`TransportEvent`]s, handed out by a
//! [`TransportFactory`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::types::{CloseInfo, EndpointKey, ErrorInfo, Message};

/// The two transport shapes the engine understands.
///
/// A receive-only transport (server-sent events style) has no close handshake: it never
/// enters `Closing`, gets no heartbeat pings, and its `error` events are treated as a close.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Bidirectional,
    ReceiveOnly,
}

/// Events emitted by a transport, in the order they happened on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(Message),
    Error(ErrorInfo),
    Close(CloseInfo),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A live transport object. Implementations must be cheap to call from any thread;
/// neither method may block.
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind {
        TransportKind::Bidirectional
    }

    fn send(&self, message: Message) -> Result<()>;

    /// Begin closing the transport. A `Close` event is expected to follow.
    fn close(&self) -> Result<()>;
}

/// A freshly created transport and the receiving end of its event channel.
pub struct TransportHandle {
    transport: Arc<dyn Transport>,
    events: TransportEvents,
}

impl TransportHandle {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, events: TransportEvents) -> Self {
        Self { transport, events }
    }

    #[must_use]
    pub fn into_parts(self) -> (Arc<dyn Transport>, TransportEvents) {
        (self.transport, self.events)
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("kind", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

/// Creates transports for an endpoint.
///
/// `connect` must return immediately: the outcome of the connection attempt is reported
/// through the event channel (`Open`, or `Error` followed by `Close`).
pub trait TransportFactory: Send + Sync + 'static {
    /// Reject endpoints this factory can never connect to.
    fn validate(&self, endpoint: &EndpointKey) -> Result<()> {
        _ = endpoint;
        Ok(())
    }

    fn connect(&self, endpoint: &EndpointKey, protocols: &[String]) -> Result<TransportHandle>;
}

impl<F> TransportFactory for F
where
    F: Fn(&EndpointKey, &[String]) -> Result<TransportHandle> + Send + Sync + 'static,
{
    fn connect(&self, endpoint: &EndpointKey, protocols: &[String]) -> Result<TransportHandle> {
        self(endpoint, protocols)
    }
}

/// Produces an endpoint key asynchronously, e.g. after fetching a token.
#[async_trait]
pub trait EndpointResolver: Send + Sync + 'static {
    async fn resolve(&self) -> Result<EndpointKey>;
}

#[async_trait]
impl<F, Fut> EndpointResolver for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<EndpointKey>> + Send,
{
    async fn resolve(&self) -> Result<EndpointKey> {
        self().await
    }
}

/// Where a connection should go: a fixed key, or one resolved before every connect.
#[non_exhaustive]
#[derive(Clone)]
pub enum Endpoint {
    Static(EndpointKey),
    Dynamic(Arc<dyn EndpointResolver>),
}

impl Endpoint {
    pub fn dynamic<R: EndpointResolver>(resolver: R) -> Self {
        Self::Dynamic(Arc::new(resolver))
    }

    pub async fn resolve(&self) -> Result<EndpointKey> {
        match self {
            Self::Static(key) => Ok(key.clone()),
            Self::Dynamic(resolver) => resolver.resolve().await,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(key) => f.debug_tuple("Static").field(key).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<EndpointKey> for Endpoint {
    fn from(key: EndpointKey) -> Self {
        Self::Static(key)
    }
}

impl From<&str> for Endpoint {
    fn from(key: &str) -> Self {
        Self::Static(key.into())
    }
}

impl From<String> for Endpoint {
    fn from(key: String) -> Self {
        Self::Static(key.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[tokio::test]
    async fn closure_resolver_is_awaited() {
        let endpoint =
            Endpoint::dynamic(|| async { Ok::<_, Error>(EndpointKey::from("ws://resolved")) });

        let key = endpoint.resolve().await.unwrap();

        assert_eq!(key.as_str(), "ws://resolved");
    }

    #[tokio::test]
    async fn resolver_errors_propagate() {
        let endpoint =
            Endpoint::dynamic(|| async { Err::<EndpointKey, _>(Error::resolution("no token")) });

        let error = endpoint.resolve().await.unwrap_err();

        assert_eq!(error.kind(), Kind::Resolution);
    }
}
