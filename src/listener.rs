//! Frame listeners and the registry the dispatch stage fans frames out to.

use anyhow::Result;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::frame::DecodedFrame;
use crate::sync::{lock, CancelToken};

thread_local! {
    /// Listener callbacks currently running on this thread, across all registries.
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        CallbackScope
    }

    fn active() -> bool {
        CALLBACK_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Receives every dispatched frame, synchronously, on the dispatch thread.
///
/// Implementations must not block indefinitely: a slow listener delays every
/// frame after it. Returning an error (or panicking) is logged and does not
/// affect other listeners. Calling `add_listener`/`remove_listener` from inside
/// `on_frame` is allowed.
pub trait FrameListener<E>: Send + Sync {
    fn on_frame(&self, frame: &Arc<DecodedFrame<E>>) -> Result<()>;
}

impl<E, F> FrameListener<E> for F
where
    F: Fn(&Arc<DecodedFrame<E>>) + Send + Sync,
{
    fn on_frame(&self, frame: &Arc<DecodedFrame<E>>) -> Result<()> {
        self(frame);
        Ok(())
    }
}

struct Entry<E> {
    listener: Arc<dyn FrameListener<E>>,
    active: AtomicBool,
    /// Held for the duration of each callback so `remove` can wait it out.
    in_call: Mutex<()>,
}

/// Thread-safe, ordered set of listeners.
///
/// Identity is the `Arc` allocation: adding the same `Arc` twice is a no-op.
/// `notify_all` works on a snapshot, so listeners may add or remove listeners
/// (themselves included) while being notified.
pub struct ListenerRegistry<E> {
    entries: Mutex<Vec<Arc<Entry<E>>>>,
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `listener`. Returns false if it was already registered.
    pub fn add(&self, listener: Arc<dyn FrameListener<E>>) -> bool {
        let mut entries = lock(&self.entries);
        if entries
            .iter()
            .any(|entry| same_listener(&entry.listener, &listener))
        {
            return false;
        }
        entries.push(Arc::new(Entry {
            listener,
            active: AtomicBool::new(true),
            in_call: Mutex::new(()),
        }));
        true
    }

    /// Unregister `listener`. Returns false if it was not registered.
    ///
    /// Once this returns, the listener is not called again. If its callback is
    /// running on another thread, this waits for that call to finish. Called from
    /// inside any listener callback it returns immediately instead, since waiting
    /// there could wait on the caller itself.
    pub fn remove(&self, listener: &Arc<dyn FrameListener<E>>) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            let position = entries
                .iter()
                .position(|entry| same_listener(&entry.listener, listener));
            position.map(|index| entries.remove(index))
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.active.store(false, Ordering::SeqCst);
        if !CallbackScope::active() {
            drop(lock(&entry.in_call));
        }
        true
    }

    pub fn contains(&self, listener: &Arc<dyn FrameListener<E>>) -> bool {
        lock(&self.entries)
            .iter()
            .any(|entry| same_listener(&entry.listener, listener))
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every registered listener in registration order.
    ///
    /// Returns the number of listeners that failed.
    pub fn notify_all(&self, frame: &Arc<DecodedFrame<E>>) -> usize {
        self.notify(frame, None)
    }

    /// Like `notify_all`, but stops before the next listener once `cancel` fires.
    pub fn notify_until(&self, frame: &Arc<DecodedFrame<E>>, cancel: &CancelToken) -> usize {
        self.notify(frame, Some(cancel))
    }

    fn notify(&self, frame: &Arc<DecodedFrame<E>>, cancel: Option<&CancelToken>) -> usize {
        let snapshot: Vec<Arc<Entry<E>>> = lock(&self.entries).clone();
        let mut failures = 0;
        for entry in snapshot {
            let _in_call = lock(&entry.in_call);
            if cancel.is_some_and(CancelToken::is_cancelled) {
                log::debug!("delivery of frame {} cut short by shutdown", frame.sequence());
                break;
            }
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            let _scope = CallbackScope::enter();
            match panic::catch_unwind(AssertUnwindSafe(|| entry.listener.on_frame(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    log::warn!("listener failed on frame {}: {:#}", frame.sequence(), err);
                }
                Err(_) => {
                    failures += 1;
                    log::error!("listener panicked on frame {}", frame.sequence());
                }
            }
        }
        failures
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener<E>(a: &Arc<dyn FrameListener<E>>, b: &Arc<dyn FrameListener<E>>) -> bool {
    // Compare allocations only; vtable pointers are not guaranteed unique.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
