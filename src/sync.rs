//! Synchronisation primitives shared by the pipeline stages.
//!
//! - `CancelToken`: one-shot stop signal that can also be waited on inside
//!   `crossbeam_channel::select!`, so blocked stages wake up promptly.
//! - `SingleSlot`: lock-protected holder for at most one item where a new
//!   `put` overwrites instead of blocking. Backs both latest-only queues.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex whose contents stay consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// CancelToken
// ----------------------------------------------------------------------------

/// Cloneable stop signal.
///
/// Cancelling drops the only sender of an internal channel, so every clone's
/// `channel()` becomes permanently ready. Blocking operations select on it next
/// to their real work.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Signal every clone. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        lock(&self.trigger).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver that disconnects on cancel; use inside `select!`.
    pub fn channel(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleep for `duration` or until cancelled. Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.signal.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// SingleSlot
// ----------------------------------------------------------------------------

struct SlotState<T> {
    item: Option<T>,
    closed: bool,
    aborted: bool,
}

/// Holder for at most one item. `put` replaces, `take` blocks.
///
/// `close` lets a consumer drain the current item and then observe the end;
/// `abort` discards the item and wakes everyone immediately.
pub(crate) struct SingleSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> SingleSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                item: None,
                closed: false,
                aborted: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store `item`, handing back whatever unconsumed item it replaced.
    /// Fails with the item itself once the slot is closed or aborted.
    pub(crate) fn put(&self, item: T) -> Result<Option<T>, T> {
        let mut state = lock(&self.state);
        if state.closed || state.aborted {
            return Err(item);
        }
        let replaced = state.item.replace(item);
        drop(state);
        self.ready.notify_all();
        Ok(replaced)
    }

    /// Wait for an item. `None` once aborted, or once closed and empty.
    pub(crate) fn take(&self) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if state.aborted {
                return None;
            }
            if let Some(item) = state.item.take() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_all();
    }

    pub(crate) fn abort(&self) {
        let discarded = {
            let mut state = lock(&self.state);
            state.aborted = true;
            state.item.take()
        };
        self.ready.notify_all();
        drop(discarded);
    }

    pub(crate) fn is_occupied(&self) -> bool {
        lock(&self.state).item.is_some()
    }
}
