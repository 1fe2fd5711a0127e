#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{HeartbeatConfig, Options};
use super::error::TransportError;
use super::heartbeat::{HeartbeatMonitor, MessageWatchdog};
use super::reconnect::ReconnectTimer;
use super::subscriber::Subscriber;
use super::traits::{
    Endpoint, Transport, TransportEvent, TransportEvents, TransportFactory, TransportKind,
};
use crate::Result;
use crate::error::Error;
use crate::types::{CloseInfo, ErrorInfo, Message, NORMAL_CLOSURE, ReadyState};

/// Settings of the physical connection, taken from the subscriber that created it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionConfig {
    pub(crate) protocols: Vec<String>,
    pub(crate) heartbeat: Option<HeartbeatConfig>,
    pub(crate) message_timeout: Option<Duration>,
}

impl From<&Options> for ConnectionConfig {
    fn from(options: &Options) -> Self {
        Self {
            protocols: options.protocols.clone(),
            heartbeat: options.heartbeat.clone(),
            message_timeout: options.message_timeout,
        }
    }
}

#[derive(Default)]
struct Slot {
    transport: Option<Arc<dyn Transport>>,
    shut: bool,
}

struct Members {
    state: ReadyState,
    dormant: bool,
    subscribers: Vec<Arc<Subscriber>>,
}

/// State shared between a supervisor's actor task and its callers: the live transport and
/// the subscriber set.
pub(crate) struct Link {
    slot: Mutex<Slot>,
    members: Mutex<Members>,
}

impl Link {
    fn new(subscriber: Arc<Subscriber>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            members: Mutex::new(Members {
                state: ReadyState::Connecting,
                dormant: false,
                subscribers: vec![subscriber],
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new transport. After shutdown the transport is closed instead.
    fn install(&self, transport: Arc<dyn Transport>) -> bool {
        let mut slot = self.slot();
        if slot.shut {
            drop(slot);
            _ = transport.close();
            return false;
        }
        slot.transport = Some(transport);
        true
    }

    fn release(&self) -> Option<Arc<dyn Transport>> {
        self.slot().transport.take()
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.slot().transport.clone()
    }

    /// Close the transport for good. Errors from an already dead transport are swallowed.
    fn shutdown(&self) {
        let transport = {
            let mut slot = self.slot();
            slot.shut = true;
            slot.transport.take()
        };

        if let Some(transport) = transport
            && let Err(e) = transport.close()
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Ignoring close error during teardown");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    pub(crate) fn kind(&self) -> Option<TransportKind> {
        self.slot().transport.as_ref().map(|transport| transport.kind())
    }

    /// Write a message to the live transport.
    pub(crate) fn send(&self, message: Message) -> Result<()> {
        let transport = self.transport().ok_or(TransportError::ConnectionClosed)?;
        if transport.kind() == TransportKind::ReceiveOnly {
            return Err(TransportError::Unsupported("send").into());
        }
        transport.send(message)
    }

    pub(crate) fn state(&self) -> ReadyState {
        self.members().state
    }

    fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.members().subscribers.clone()
    }

    /// Move the physical connection to `state` and return the subscribers to notify.
    /// Nothing moves once the link is shut.
    fn transition(&self, state: ReadyState) -> Vec<Arc<Subscriber>> {
        let mut members = self.members();
        if self.slot().shut {
            return Vec::new();
        }
        members.state = state;
        members.dormant = state == ReadyState::Closed;
        members.subscribers.clone()
    }

    /// Add a subscriber and report the current state to it under the same lock, so no
    /// transition can slip between the two. Returns whether the connection is dormant, in
    /// which case the subscriber stays `Connecting` for the revival that follows.
    fn attach(&self, subscriber: Arc<Subscriber>) -> bool {
        let mut members = self.members();
        if !members.dormant {
            subscriber.adopt(members.state, |message| self.send(message));
        }
        members.subscribers.push(subscriber);
        members.dormant
    }

    fn close_all(&self) -> Vec<Arc<Subscriber>> {
        let mut members = self.members();
        members.state = ReadyState::Closed;
        members.dormant = true;
        members.subscribers.clone()
    }

    fn detach(&self, id: u64) -> usize {
        let mut members = self.members();
        members.subscribers.retain(|subscriber| subscriber.id() != id);
        members.subscribers.len()
    }
}

#[derive(Debug)]
enum Command {
    Reconnect,
}

/// Owns the lifecycle of one physical connection.
///
/// All transitions, timers and event deliveries for the connection run on a single actor
/// task, so handlers never race one another. [`stop`](Self::stop) is synchronous and
/// idempotent: it cancels every timer and closes the transport before returning.
pub(crate) struct ConnectionSupervisor {
    link: Arc<Link>,
    commands: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl ConnectionSupervisor {
    pub(crate) fn start(
        endpoint: Endpoint,
        factory: Arc<dyn TransportFactory>,
        config: ConnectionConfig,
        subscriber: Arc<Subscriber>,
    ) -> Self {
        let link = Arc::new(Link::new(subscriber));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let actor = Actor {
            endpoint,
            factory,
            config,
            link: Arc::clone(&link),
            token: token.clone(),
            commands: commands_rx,
            events: None,
            opened: false,
            pending: None,
            heartbeat: None,
            watchdog: None,
        };
        tokio::spawn(actor.run());

        Self {
            link,
            commands,
            token,
        }
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub(crate) fn state(&self) -> ReadyState {
        self.link.state()
    }

    /// Reconnect now if the connection is down, cancelling any pending retry.
    ///
    /// Fails once the supervisor has been stopped.
    pub(crate) fn request_reconnect(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(TransportError::ConnectionClosed.into());
        }
        self.commands
            .send(Command::Reconnect)
            .map_err(|_e| TransportError::ConnectionClosed)?;
        Ok(())
    }

    /// Attach another subscriber, reviving the connection if it closed for good.
    pub(crate) fn add_subscriber(&self, subscriber: Arc<Subscriber>) {
        if self.link.attach(subscriber) {
            // Only registered supervisors are joined, and those are never stopped
            _ = self.request_reconnect();
        }
    }

    /// Returns the number of subscribers left.
    pub(crate) fn remove_subscriber(&self, id: u64) -> usize {
        self.link.detach(id)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.link.members().subscribers.len()
    }

    pub(crate) fn stop(&self) {
        if self.token.is_cancelled() {
            return;
        }

        self.token.cancel();
        self.link.shutdown();
        for subscriber in self.link.close_all() {
            subscriber.mark_closed();
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PendingReconnect {
    timer: ReconnectTimer,
    drivers: Vec<Arc<Subscriber>>,
}

struct Actor {
    endpoint: Endpoint,
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    link: Arc<Link>,
    token: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Option<TransportEvents>,
    opened: bool,
    pending: Option<PendingReconnect>,
    heartbeat: Option<HeartbeatMonitor>,
    watchdog: Option<MessageWatchdog>,
}

impl Actor {
    async fn run(mut self) {
        self.connect().await;

        loop {
            tokio::select! {
                biased;

                () = self.token.cancelled() => break,
                () = Self::pending_timer(&mut self.pending) => self.fire_reconnect().await,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                event = Self::next_event(&mut self.events) => self.handle_event(event),
            }
        }

        self.pending = None;
        self.detach_monitors();
        self.events = None;
        self.link.shutdown();

        #[cfg(feature = "tracing")]
        tracing::debug!("Connection supervisor stopped");
    }

    async fn pending_timer(pending: &mut Option<PendingReconnect>) {
        match pending {
            Some(pending) => (&mut pending.timer).await,
            None => future::pending().await,
        }
    }

    async fn next_event(events: &mut Option<TransportEvents>) -> TransportEvent {
        let Some(rx) = events else {
            return future::pending().await;
        };

        if let Some(event) = rx.recv().await {
            event
        } else {
            *events = None;
            TransportEvent::Close(CloseInfo::abnormal("transport went away"))
        }
    }

    fn detach_monitors(&mut self) {
        self.heartbeat = None;
        self.watchdog = None;
    }

    async fn connect(&mut self) {
        if self.token.is_cancelled() {
            return;
        }
        self.detach_monitors();
        self.events = None;
        let was_open = std::mem::take(&mut self.opened);
        if let Some(previous) = self.link.release() {
            // A retry armed by an error replaces a transport that never closed
            _ = previous.close();
            let close = CloseInfo::new(NORMAL_CLOSURE, "reconnecting", true);
            for subscriber in self.link.transition(ReadyState::Connecting) {
                subscriber.notify_close(&close, was_open, ReadyState::Connecting);
            }
        }

        for subscriber in self.link.transition(ReadyState::Connecting) {
            subscriber.set_state(ReadyState::Connecting);
        }

        let resolved = tokio::select! {
            biased;

            () = self.token.cancelled() => return,
            key = self.endpoint.resolve() => key,
        };

        let connected = resolved.and_then(|key| {
            #[cfg(feature = "tracing")]
            tracing::debug!(endpoint = %key, "Connecting");
            self.factory.connect(&key, &self.config.protocols)
        });

        match connected {
            Ok(handle) => {
                let (transport, events) = handle.into_parts();
                if self.link.install(transport) {
                    self.events = Some(events);
                }
            }
            Err(e) => self.connect_failed(&e),
        }
    }

    /// The transport could not even be created: report it and retry like a failed open.
    fn connect_failed(&mut self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %error, "Unable to create transport");

        let info = ErrorInfo::from(error);
        let subscribers = self.link.subscribers();
        for subscriber in &subscribers {
            subscriber.notify_error(&info);
        }

        let voters = subscribers
            .into_iter()
            .filter(|subscriber| subscriber.can_retry())
            .collect();
        self.schedule(voters);

        let next = self.next_state();
        let close = CloseInfo::abnormal(info.message);
        for subscriber in self.link.transition(next) {
            subscriber.notify_close(&close, false, next);
        }
    }

    async fn fire_reconnect(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        for driver in &pending.drivers {
            if !driver.is_disposed() {
                driver.increment_attempts();
            }
        }
        self.connect().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Reconnect => {
                if self.link.transport().is_none() {
                    self.pending = None;
                    self.connect().await;
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(message) => self.on_message(&message),
            TransportEvent::Error(error) => self.on_error(&error),
            TransportEvent::Close(close) => self.on_close(&close),
        }
    }

    fn on_open(&mut self) {
        self.opened = true;
        self.pending = None;

        #[cfg(feature = "tracing")]
        tracing::debug!("Transport open");

        for subscriber in self.link.transition(ReadyState::Open) {
            subscriber.notify_open(|message| self.link.send(message));
        }

        let Some(transport) = self.link.transport() else {
            return;
        };
        if transport.kind() == TransportKind::Bidirectional
            && let Some(heartbeat) = &self.config.heartbeat
        {
            self.heartbeat = Some(HeartbeatMonitor::attach(
                Arc::clone(&transport),
                heartbeat,
                &self.token,
            ));
        }
        if let Some(timeout) = self.config.message_timeout {
            self.watchdog = Some(MessageWatchdog::attach(transport, timeout, &self.token));
        }
    }

    fn on_message(&self, message: &Message) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.mark_inbound_activity();
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.mark_inbound_activity();
        }

        for subscriber in self.link.subscribers() {
            subscriber.notify_message(message);
        }
    }

    /// Errors never change state on their own. Receive-only transports have no close
    /// event, so their errors are followed by a synthesized one.
    fn on_error(&mut self, error: &ErrorInfo) {
        let subscribers = self.link.subscribers();
        for subscriber in &subscribers {
            subscriber.notify_error(error);
        }

        if self.pending.is_none() {
            let voters = subscribers
                .into_iter()
                .filter(|subscriber| subscriber.retries_on_error())
                .collect();
            self.schedule(voters);
        }

        if self.link.kind() == Some(TransportKind::ReceiveOnly) {
            self.on_close(&CloseInfo::abnormal(error.message.clone()));
        }
    }

    fn on_close(&mut self, close: &CloseInfo) {
        let was_open = std::mem::take(&mut self.opened);
        self.detach_monitors();
        self.events = None;
        if let Some(transport) = self.link.release()
            && transport.kind() == TransportKind::ReceiveOnly
        {
            _ = transport.close();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(code = close.code, reason = %close.reason, "Transport closed");

        if self.pending.is_none() {
            let voters = self
                .link
                .subscribers()
                .into_iter()
                .filter(|subscriber| subscriber.should_reconnect(close))
                .collect();
            self.schedule(voters);
        }

        let next = self.next_state();
        for subscriber in self.link.transition(next) {
            subscriber.notify_close(close, was_open, next);
        }
    }

    fn next_state(&self) -> ReadyState {
        if self.pending.is_some() {
            ReadyState::Connecting
        } else {
            ReadyState::Closed
        }
    }

    /// Arm the single reconnect timer.
    ///
    /// Every voter with budget left becomes a driver whose counter advances when the timer
    /// fires; the first driver's delay is used.
    fn schedule(&mut self, voters: Vec<Arc<Subscriber>>) {
        if self.pending.is_some() {
            return;
        }

        let mut timer = None;
        let mut drivers = Vec::with_capacity(voters.len());
        for voter in voters {
            if let Some(next) = voter.schedule_retry() {
                timer.get_or_insert(next);
                drivers.push(voter);
            }
        }

        if let Some(timer) = timer {
            self.pending = Some(PendingReconnect { timer, drivers });
        }
    }
}
