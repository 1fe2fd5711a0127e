#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test crate uses a different subset of these helpers"
)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket_lifecycle::error::Error;
use socket_lifecycle::types::NORMAL_CLOSURE;
use socket_lifecycle::ws::config::Options;
use socket_lifecycle::ws::error::TransportError;
use socket_lifecycle::ws::{
    Transport, TransportEvent, TransportFactory, TransportHandle, TransportKind,
};
use socket_lifecycle::{CloseInfo, EndpointKey, ErrorInfo, Message, Result};
use tokio::sync::mpsc;

/// How the mock factory's transports behave once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// The test drives every event by hand
    Manual,
    /// Opens as soon as it is created
    AutoOpen,
    /// Reports an error then closes without ever opening
    FailOpen,
    /// `connect` itself returns an error
    Refuse,
}

#[derive(Clone)]
pub struct MockFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    behavior: Mutex<Behavior>,
    kind: TransportKind,
    connections: Mutex<Vec<MockConnection>>,
    attempts: AtomicUsize,
}

impl MockFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self::with_kind(behavior, TransportKind::Bidirectional)
    }

    pub fn with_kind(behavior: Behavior, kind: TransportKind) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                behavior: Mutex::new(behavior),
                kind,
                connections: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.inner.behavior.lock().unwrap() = behavior;
    }

    /// Number of `connect` calls, including refused ones.
    pub fn connects(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> MockConnection {
        self.inner.connections.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> MockConnection {
        self.inner
            .connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap()
    }

    pub fn keys(&self) -> Vec<EndpointKey> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|connection| connection.key.clone())
            .collect()
    }
}

impl TransportFactory for MockFactory {
    fn connect(&self, endpoint: &EndpointKey, _protocols: &[String]) -> Result<TransportHandle> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.inner.behavior.lock().unwrap();
        if behavior == Behavior::Refuse {
            return Err(TransportError::ConnectionClosed.into());
        }

        let (events, rx) = mpsc::unbounded_channel();
        let connection = MockConnection {
            key: endpoint.clone(),
            events: events.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let transport = MockTransport {
            kind: self.inner.kind,
            events,
            sent: Arc::clone(&connection.sent),
            closes: Arc::clone(&connection.closes),
            closed: AtomicBool::new(false),
        };

        match behavior {
            Behavior::AutoOpen => connection.open(),
            Behavior::FailOpen => {
                connection.error("connection refused");
                connection.close(1006, "connection refused");
            }
            Behavior::Manual | Behavior::Refuse => {}
        }

        self.inner.connections.lock().unwrap().push(connection);
        Ok(TransportHandle::new(Arc::new(transport), rx))
    }
}

struct MockTransport {
    kind: TransportKind,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<Message>>>,
    closes: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed.into());
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Like a socket, a bidirectional transport confirms with a close event
        if !self.closed.swap(true, Ordering::SeqCst) && self.kind == TransportKind::Bidirectional {
            _ = self.events.send(TransportEvent::Close(CloseInfo::new(
                NORMAL_CLOSURE,
                "",
                true,
            )));
        }
        Ok(())
    }
}

/// Test-side controls of one transport created by [`MockFactory`].
#[derive(Clone)]
pub struct MockConnection {
    pub key: EndpointKey,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Arc<Mutex<Vec<Message>>>,
    closes: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn open(&self) {
        _ = self.events.send(TransportEvent::Open);
    }

    pub fn message(&self, text: &str) {
        _ = self.events.send(TransportEvent::Message(text.into()));
    }

    pub fn error(&self, message: &str) {
        _ = self.events.send(TransportEvent::Error(ErrorInfo::new(message)));
    }

    pub fn close(&self, code: u16, reason: &str) {
        _ = self.events.send(TransportEvent::Close(CloseInfo::new(
            code,
            reason,
            code == NORMAL_CLOSURE,
        )));
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of times the engine called `close` on this transport.
    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Records observer callbacks as short strings, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every callback on `options`.
    pub fn attach(&self, options: Options) -> Options {
        let on_open = self.clone();
        let on_close = self.clone();
        let on_message = self.clone();
        let on_error = self.clone();
        let on_stop = self.clone();

        options
            .on_open(move || on_open.push("open".to_owned()))
            .on_close(move |close| on_close.push(format!("close:{}", close.code)))
            .on_message(move |message| {
                on_message.push(format!("message:{}", message.as_text().unwrap_or_default()));
            })
            .on_error(move |error| on_error.push(format!("error:{}", error.message)))
            .on_reconnect_stop(move |max| on_stop.push(format!("stop:{max}")))
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

/// Let spawned tasks run until they are all idle, without letting paused time move far.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn endpoint_error() -> Error {
    Error::resolution("token service unavailable")
}
