use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Result;
use crate::types::Message;

/// What happened to a message handed to [`OutboundQueue::send`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the open transport.
    Sent,
    /// Buffered until the connection opens.
    Queued,
    /// Discarded because the connection is not open and buffering was not requested.
    Dropped,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Message>,
    open: bool,
    flushing: bool,
}

/// FIFO buffer for messages sent while the connection is not open.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // The queue holds no invariant a panicking sink could break halfway, so a poisoned
    // lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer `message` unless the connection is closed and `keep` is false.
    ///
    /// Returns whether the message was kept.
    pub fn enqueue(&self, message: Message, keep: bool) -> bool {
        let mut inner = self.lock();
        if inner.open || keep {
            inner.pending.push_back(message);
            true
        } else {
            false
        }
    }

    /// Send `message` through `sink` when open, otherwise queue or drop it.
    ///
    /// While a flush is running, new messages go to the tail of the queue so that they
    /// are written after everything buffered before them.
    pub fn send<F>(&self, message: Message, keep: bool, sink: F) -> Result<Delivery>
    where
        F: FnOnce(Message) -> Result<()>,
    {
        let mut inner = self.lock();
        if inner.open && !inner.flushing && inner.pending.is_empty() {
            sink(message)?;
            return Ok(Delivery::Sent);
        }

        if inner.open || keep {
            inner.pending.push_back(message);
            Ok(Delivery::Queued)
        } else {
            Ok(Delivery::Dropped)
        }
    }

    /// Mark the queue open and drain it in order through `sink`.
    ///
    /// Messages enqueued while draining are drained too. If `sink` fails the message is put
    /// back at the head and draining stops; it will be retried on the next flush.
    pub fn flush<F>(&self, mut sink: F) -> usize
    where
        F: FnMut(Message) -> Result<()>,
    {
        {
            let mut inner = self.lock();
            inner.open = true;
            if inner.flushing {
                return 0;
            }
            inner.flushing = true;
        }

        let mut sent = 0;
        loop {
            let Some(message) = self.lock().pending.pop_front() else {
                break;
            };

            if let Err(e) = sink(message.clone()) {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "Flush interrupted, keeping remaining messages");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.lock().pending.push_front(message);
                break;
            }
            sent += 1;
        }

        let mut inner = self.lock();
        inner.flushing = false;
        drop(inner);

        sent
    }

    /// The connection went down: stop writing through and start buffering.
    pub fn close(&self) {
        self.lock().open = false;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}
