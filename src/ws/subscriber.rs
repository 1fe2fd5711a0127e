use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};

use super::config::Options;
use super::queue::{Delivery, OutboundQueue};
use super::reconnect::{ReconnectPolicy, ReconnectTimer};
use crate::Result;
use crate::types::{CloseInfo, ErrorInfo, Message, ReadyState};

/// Broadcast channel capacity for inbound messages.
const BROADCAST_CAPACITY: usize = 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One logical client of an endpoint.
///
/// Every callback is a no-op once the subscriber is disposed, so events racing with
/// teardown never reach user code.
pub(crate) struct Subscriber {
    id: u64,
    options: Options,
    policy: ReconnectPolicy,
    attempts: AtomicU32,
    stop_reported: AtomicBool,
    disposed: AtomicBool,
    state: watch::Sender<ReadyState>,
    queue: OutboundQueue,
    messages: Mutex<Option<broadcast::Sender<Message>>>,
}

impl Subscriber {
    pub(crate) fn new(options: Options) -> Arc<Self> {
        let (messages, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state, _) = watch::channel(ReadyState::Uninstantiated);

        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            policy: ReconnectPolicy::new(&options.reconnect),
            options,
            attempts: AtomicU32::new(0),
            stop_reported: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            state,
            queue: OutboundQueue::new(),
            messages: Mutex::new(Some(messages)),
        })
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) const fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ReadyState> {
        self.state.subscribe()
    }

    pub(crate) fn message_receiver(&self) -> Option<broadcast::Receiver<Message>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Publish `state` unless disposed.
    pub(crate) fn set_state(&self, state: ReadyState) {
        if self.is_disposed() {
            return;
        }
        self.publish(state);
    }

    fn publish(&self, state: ReadyState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        #[cfg(feature = "tracing")]
        if changed {
            tracing::trace!(subscriber = self.id, %state, "State changed");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = changed;
    }

    /// The transport opened: reset the retry budget, tell the caller, then flush.
    pub(crate) fn notify_open<F>(&self, sink: F)
    where
        F: FnMut(Message) -> Result<()>,
    {
        if self.is_disposed() {
            return;
        }

        self.reset_attempts();
        if let Some(on_open) = &self.options.handlers.on_open {
            on_open();
        }
        self.publish(ReadyState::Open);
        self.queue.flush(sink);
    }

    /// Join a connection that is already in `state`.
    pub(crate) fn adopt<F>(&self, state: ReadyState, sink: F)
    where
        F: FnMut(Message) -> Result<()>,
    {
        if self.is_disposed() {
            return;
        }

        self.publish(state);
        if state.is_open() {
            self.queue.flush(sink);
        }
    }

    pub(crate) fn notify_message(&self, message: &Message) {
        if self.is_disposed() {
            return;
        }

        if let Some(on_message) = &self.options.handlers.on_message {
            on_message(message);
        }
        if let Some(tx) = &*self.messages.lock().unwrap_or_else(PoisonError::into_inner) {
            _ = tx.send(message.clone());
        }
    }

    pub(crate) fn notify_error(&self, error: &ErrorInfo) {
        if self.is_disposed() {
            return;
        }

        if let Some(on_error) = &self.options.handlers.on_error {
            on_error(error);
        }
    }

    /// The transport closed. `on_close` only fires for a transport that had opened.
    pub(crate) fn notify_close(&self, close: &CloseInfo, was_open: bool, next: ReadyState) {
        self.queue.close();
        if self.is_disposed() {
            return;
        }

        if was_open && let Some(on_close) = &self.options.handlers.on_close {
            on_close(close);
        }
        self.publish(next);
    }

    /// The connection is gone without a close event reaching this subscriber.
    pub(crate) fn mark_closed(&self) {
        self.queue.close();
        self.set_state(ReadyState::Closed);
    }

    /// Whether this subscriber votes for a reconnect after `close`.
    pub(crate) fn should_reconnect(&self, close: &CloseInfo) -> bool {
        self.can_retry()
            && self
                .options
                .handlers
                .should_reconnect
                .as_ref()
                .is_some_and(|predicate| predicate(close))
    }

    /// Whether this subscriber votes for a reconnect after a transport error.
    pub(crate) fn retries_on_error(&self) -> bool {
        self.can_retry() && self.options.reconnect.retry_on_error
    }

    /// Not disposed and the retry budget has not been reported exhausted.
    pub(crate) fn can_retry(&self) -> bool {
        !self.is_disposed() && !self.stop_reported.load(Ordering::Acquire)
    }

    /// Ask the policy for a timer; reports `on_reconnect_stop` once if the budget is spent.
    pub(crate) fn schedule_retry(&self) -> Option<ReconnectTimer> {
        self.policy
            .schedule_retry(self.attempts(), |max| self.report_reconnect_stop(max))
    }

    fn report_reconnect_stop(&self, max_attempts: u32) {
        if self.is_disposed() || self.stop_reported.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(on_reconnect_stop) = &self.options.handlers.on_reconnect_stop {
            on_reconnect_stop(&max_attempts);
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn increment_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
        self.stop_reported.store(false, Ordering::Release);
    }

    pub(crate) fn send<F>(&self, message: Message, keep: bool, sink: F) -> Result<Delivery>
    where
        F: FnOnce(Message) -> Result<()>,
    {
        self.queue.send(message, keep, sink)
    }

    /// Mark disposed. Returns `false` if it already was.
    pub(crate) fn begin_dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Disposal of an open connection passes through `Closing`.
    pub(crate) fn begin_closing(&self) {
        self.publish(ReadyState::Closing);
    }

    /// Publish the final state of a disposal and end every message stream.
    pub(crate) fn finish_dispose(&self) {
        self.queue.close();
        self.publish(ReadyState::Closed);
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_options(stops: &Arc<AtomicUsize>, closes: &Arc<AtomicUsize>) -> Options {
        let stops = Arc::clone(stops);
        let closes = Arc::clone(closes);
        Options::default()
            .reconnect_attempts(1)
            .should_reconnect(|_| true)
            .on_reconnect_stop(move |_| {
                stops.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_| {
                closes.fetch_add(1, Ordering::SeqCst);
            })
    }

    #[tokio::test]
    async fn reconnect_stop_is_reported_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let subscriber = Subscriber::new(counting_options(&stops, &closes));

        assert!(subscriber.schedule_retry().is_some());
        subscriber.increment_attempts();
        assert!(subscriber.schedule_retry().is_none());
        assert!(subscriber.schedule_retry().is_none());

        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!subscriber.can_retry());
        assert!(!subscriber.should_reconnect(&CloseInfo::abnormal("gone")));
    }

    #[test]
    fn close_before_open_is_silent() {
        let stops = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let subscriber = Subscriber::new(counting_options(&stops, &closes));

        subscriber.notify_close(&CloseInfo::abnormal("refused"), false, ReadyState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(subscriber.state(), ReadyState::Closed);

        subscriber.notify_close(&CloseInfo::new(1000, "", true), true, ReadyState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_resets_attempts_before_flushing() {
        let subscriber = Subscriber::new(Options::default());
        subscriber.increment_attempts();
        subscriber.increment_attempts();
        _ = subscriber.send("queued".into(), true, |_| Ok(())).unwrap();

        let mut flushed = Vec::new();
        subscriber.notify_open(|m| {
            flushed.push(m);
            Ok(())
        });

        assert_eq!(subscriber.attempts(), 0);
        assert_eq!(subscriber.state(), ReadyState::Open);
        assert_eq!(flushed, vec![Message::from("queued")]);
    }

    #[test]
    fn disposed_subscriber_ignores_events() {
        let stops = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let subscriber = Subscriber::new(counting_options(&stops, &closes));

        assert!(subscriber.begin_dispose());
        assert!(!subscriber.begin_dispose());
        subscriber.finish_dispose();

        subscriber.notify_open(|_| Ok(()));
        subscriber.notify_close(&CloseInfo::abnormal("late"), true, ReadyState::Connecting);

        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(subscriber.state(), ReadyState::Closed);
        assert!(subscriber.message_receiver().is_none());
    }
}
