//! Pipeline counters and health.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::sync::lock;

/// How long a started receiver may go without dispatching before it is unhealthy.
pub const HEALTH_GRACE: Duration = Duration::from_secs(5);

/// Counters shared by the capture, decode and dispatch stages of one receiver.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_dispatched: AtomicU64,
    frames_dropped: AtomicU64,
    decode_failures: AtomicU64,
    listener_failures: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    last_dispatch_at: Mutex<Option<Instant>>,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    pub frames_captured: u64,
    pub frames_dispatched: u64,
    /// Frames superseded under the latest-only policy.
    pub frames_dropped: u64,
    pub decode_failures: u64,
    pub listener_failures: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter at the beginning of a session.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.frames_captured,
            &self.frames_dispatched,
            &self.frames_dropped,
            &self.decode_failures,
            &self.listener_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *lock(&self.started_at) = Some(Instant::now());
        *lock(&self.last_dispatch_at) = None;
    }

    pub(crate) fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last_dispatch_at) = Some(Instant::now());
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listener_failures(&self, count: usize) {
        if count > 0 {
            self.listener_failures
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }

    /// Healthy while frames keep arriving, or shortly after a session started.
    pub fn is_healthy(&self) -> bool {
        let Some(started_at) = *lock(&self.started_at) else {
            return false;
        };
        match *lock(&self.last_dispatch_at) {
            Some(last) => last.elapsed() <= HEALTH_GRACE,
            None => started_at.elapsed() <= HEALTH_GRACE,
        }
    }
}
