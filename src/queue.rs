//! Ingest queue between the capture and dispatch stages.
//!
//! Holds decode handles in capture order. Two policies:
//! - bounded-blocking: fixed capacity, `push` blocks while full so backpressure
//!   reaches the network read;
//! - latest-only: a single slot, `push` overwrites whatever the dispatcher has not
//!   picked up yet.
//!
//! Neither policy reorders entries.

use crossbeam_channel::{select, Receiver, SendTimeoutError, Sender};
use std::time::Duration;

use crate::decode::DecodePolicy;
use crate::sync::{CancelToken, SingleSlot};

/// How long a blocked bounded `push` waits before re-checking for abort.
const PUSH_POLL: Duration = Duration::from_millis(50);

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_DECODE_WORKERS: usize = 3;

/// Queueing and decode policy of a receiver, chosen before `start()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Every frame is decoded and delivered; capture blocks when `capacity` is reached.
    Bounded {
        capacity: usize,
        decode_workers: usize,
    },
    /// Only the newest frame matters; superseded frames are dropped silently.
    LatestOnly,
}

impl QueuePolicy {
    pub fn decode_policy(&self) -> DecodePolicy {
        match self {
            QueuePolicy::Bounded { decode_workers, .. } => DecodePolicy::Pool {
                workers: *decode_workers,
            },
            QueuePolicy::LatestOnly => DecodePolicy::LatestOnly,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            QueuePolicy::Bounded { capacity, .. } => *capacity,
            QueuePolicy::LatestOnly => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueuePolicy::Bounded { .. } => "bounded",
            QueuePolicy::LatestOnly => "latest_only",
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Bounded {
            capacity: DEFAULT_QUEUE_CAPACITY,
            decode_workers: DEFAULT_DECODE_WORKERS,
        }
    }
}

/// Result of `IngestQueue::push`.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Queued,
    /// Latest-only: the item that was overwritten.
    Replaced(T),
    /// The queue was closed or aborted; the item is handed back.
    Closed(T),
}

enum Inner<T> {
    Bounded { tx: Sender<T>, rx: Receiver<T> },
    Latest(SingleSlot<T>),
}

/// FIFO of pending frames shared by exactly one producer and one consumer.
pub struct IngestQueue<T> {
    inner: Inner<T>,
    closed: CancelToken,
    aborted: CancelToken,
}

impl<T> IngestQueue<T> {
    pub fn new(policy: &QueuePolicy) -> Self {
        let inner = match policy {
            QueuePolicy::Bounded { capacity, .. } => {
                let (tx, rx) = crossbeam_channel::bounded((*capacity).max(1));
                Inner::Bounded { tx, rx }
            }
            QueuePolicy::LatestOnly => Inner::Latest(SingleSlot::new()),
        };
        Self {
            inner,
            closed: CancelToken::new(),
            aborted: CancelToken::new(),
        }
    }

    /// Insert `item`, blocking while a bounded queue is full.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        if self.closed.is_cancelled() || self.aborted.is_cancelled() {
            return PushOutcome::Closed(item);
        }
        match &self.inner {
            Inner::Bounded { tx, .. } => {
                let mut item = item;
                loop {
                    match tx.send_timeout(item, PUSH_POLL) {
                        Ok(()) => return PushOutcome::Queued,
                        Err(SendTimeoutError::Timeout(back)) => {
                            if self.aborted.is_cancelled() {
                                return PushOutcome::Closed(back);
                            }
                            item = back;
                        }
                        Err(SendTimeoutError::Disconnected(back)) => {
                            return PushOutcome::Closed(back)
                        }
                    }
                }
            }
            Inner::Latest(slot) => match slot.put(item) {
                Ok(Some(replaced)) => PushOutcome::Replaced(replaced),
                Ok(None) => PushOutcome::Queued,
                Err(item) => PushOutcome::Closed(item),
            },
        }
    }

    /// Take the oldest entry, blocking while empty.
    ///
    /// `None` once aborted, or once closed and fully drained.
    pub fn pop(&self) -> Option<T> {
        match &self.inner {
            Inner::Bounded { rx, .. } => {
                if self.aborted.is_cancelled() {
                    return None;
                }
                select! {
                    recv(rx) -> item => item.ok(),
                    recv(self.closed.channel()) -> _ => {
                        if self.aborted.is_cancelled() {
                            None
                        } else {
                            rx.try_recv().ok()
                        }
                    },
                    recv(self.aborted.channel()) -> _ => None,
                }
            }
            Inner::Latest(slot) => slot.take(),
        }
    }

    /// The producer is done; the consumer drains what is left, then sees `None`.
    pub fn close(&self) {
        self.closed.cancel();
        if let Inner::Latest(slot) = &self.inner {
            slot.close();
        }
    }

    /// Forced stop: wake everyone. Nothing is handed out afterwards; entries
    /// still buffered in a bounded queue are dropped with the queue.
    pub fn abort(&self) {
        self.aborted.cancel();
        if let Inner::Latest(slot) = &self.inner {
            slot.abort();
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::Bounded { rx, .. } => rx.len(),
            Inner::Latest(slot) => usize::from(slot.is_occupied()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
