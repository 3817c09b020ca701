//! Dispatch stage.
//!
//! Takes pending decodes off the ingest queue in capture order, waits for each to
//! resolve, publishes successful frames to the `LastFrame` slot and then calls
//! every registered listener on this thread.
//!
//! Once the session is cancelled nothing more is published, even by a thread
//! that outlived `stop()`: the token is checked before the slot is written and
//! before each listener call. When the queue drains because the source ended,
//! the `on_drained` hook runs.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::decode::{PendingResult, Resolved};
use crate::frame::LastFrame;
use crate::listener::ListenerRegistry;
use crate::queue::IngestQueue;
use crate::stats::PipelineStats;
use crate::sync::CancelToken;

pub(crate) struct DispatchStage<E> {
    pub queue: Arc<IngestQueue<PendingResult<E>>>,
    pub cancel: CancelToken,
    pub registry: Arc<ListenerRegistry<E>>,
    pub last_frame: Arc<LastFrame<E>>,
    pub stats: Arc<PipelineStats>,
    pub on_drained: Option<Box<dyn FnOnce() + Send>>,
}

impl<E: Send + Sync + 'static> DispatchStage<E> {
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("mjpeg-dispatch".to_string())
            .spawn(move || self.run())
            .context("spawn dispatch thread")
    }
}

impl<E> DispatchStage<E> {
    fn run(mut self) {
        while let Some(pending) = self.queue.pop() {
            let sequence = pending.sequence();
            match pending.resolve(&self.cancel) {
                Resolved::Frame(_) if self.cancel.is_cancelled() => break,
                Resolved::Frame(frame) => {
                    self.last_frame.store(frame.clone());
                    self.stats.record_dispatched();
                    let failures = self.registry.notify_until(&frame, &self.cancel);
                    self.stats.record_listener_failures(failures);
                }
                Resolved::Failed(err) => {
                    self.stats.record_decode_failure();
                    log::warn!("skipping frame {}: {:#}", sequence, err);
                }
                Resolved::Discarded if self.cancel.is_cancelled() => break,
                Resolved::Discarded => {
                    self.stats.record_dropped();
                    log::debug!("frame {} superseded before decode", sequence);
                }
                Resolved::Interrupted => break,
            }
        }

        if self.cancel.is_cancelled() {
            log::debug!("dispatch stopped");
            return;
        }
        log::debug!("dispatch drained after end of stream");
        if let Some(on_drained) = self.on_drained.take() {
            on_drained();
        }
    }
}
