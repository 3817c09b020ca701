//! Capture stage.
//!
//! Reads encoded frames from the source, numbers them, hands each one to the
//! decode executor and queues the resulting `PendingResult` for dispatch. The
//! stage never retries: a read error or end of stream ends the session's capture
//! and is recorded as a `SourceTermination`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::decode::{DecodeExecutor, PendingResult};
use crate::frame::RawFrame;
use crate::ingest::FrameSource;
use crate::queue::{IngestQueue, PushOutcome};
use crate::stats::PipelineStats;
use crate::sync::{lock, CancelToken};

/// Why the source stopped producing frames on its own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    EndOfStream,
    Failed(String),
}

/// Recorded when a session's source ends without `stop()` being called.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceTermination {
    pub source: String,
    pub cause: TerminationCause,
    pub frames_captured: u64,
}

pub(crate) type TerminationSlot = Arc<Mutex<Option<SourceTermination>>>;

pub(crate) struct CaptureStage<E> {
    pub source: Box<dyn FrameSource>,
    pub executor: Arc<DecodeExecutor<E>>,
    pub queue: Arc<IngestQueue<PendingResult<E>>>,
    pub cancel: CancelToken,
    pub stats: Arc<PipelineStats>,
    pub termination: TerminationSlot,
}

impl<E: Send + Sync + 'static> CaptureStage<E> {
    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("mjpeg-capture".to_string())
            .spawn(move || self.run())
            .context("spawn capture thread")
    }
}

impl<E> CaptureStage<E> {
    fn run(mut self) {
        let origin = self.source.describe();
        log::info!("capture started: {}", origin);

        let mut sequence = 0u64;
        let cause = loop {
            let bytes = match self.source.next_frame(&self.cancel) {
                Ok(Some(bytes)) => bytes,
                Ok(None) if self.cancel.is_cancelled() => break None,
                Ok(None) => break Some(TerminationCause::EndOfStream),
                Err(_) if self.cancel.is_cancelled() => break None,
                Err(err) => break Some(TerminationCause::Failed(format!("{:#}", err))),
            };

            sequence += 1;
            self.stats.record_captured();
            let Some(pending) = self.executor.submit(RawFrame::new(bytes, sequence)) else {
                break None;
            };
            match self.queue.push(pending) {
                PushOutcome::Queued => {}
                PushOutcome::Replaced(stale) => {
                    self.stats.record_dropped();
                    log::trace!(
                        "frame {} superseded by frame {} before dispatch",
                        stale.sequence(),
                        sequence
                    );
                }
                PushOutcome::Closed(_) => break None,
            }
        };

        match cause {
            Some(cause) => {
                match &cause {
                    TerminationCause::EndOfStream => {
                        log::info!("source {} ended after {} frames", origin, sequence)
                    }
                    TerminationCause::Failed(reason) => log::error!(
                        "source {} failed after {} frames: {}",
                        origin,
                        sequence,
                        reason
                    ),
                }
                *lock(&self.termination) = Some(SourceTermination {
                    source: origin,
                    cause,
                    frames_captured: sequence,
                });
            }
            None => log::debug!("capture stopped after {} frames", sequence),
        }
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodePolicy, FrameDecoder, Resolved};
    use crate::ingest::channel::frame_feed;
    use crate::queue::QueuePolicy;

    fn capture_stage(
        source: Box<dyn FrameSource>,
        policy: QueuePolicy,
    ) -> (CaptureStage<u64>, CancelToken) {
        let cancel = CancelToken::new();
        let decoder: Arc<dyn FrameDecoder<u64>> =
            Arc::new(|raw: &RawFrame| -> anyhow::Result<u64> { Ok(raw.sequence()) });
        let executor =
            DecodeExecutor::spawn(DecodePolicy::Pool { workers: 2 }, decoder, cancel.clone())
                .unwrap();
        let stage = CaptureStage {
            source,
            executor: Arc::new(executor),
            queue: Arc::new(IngestQueue::new(&policy)),
            cancel: cancel.clone(),
            stats: Arc::new(PipelineStats::new()),
            termination: Arc::new(Mutex::new(None)),
        };
        (stage, cancel)
    }

    #[test]
    fn end_of_stream_closes_queue_and_records_termination() {
        let (feed, source) = frame_feed("cam");
        for _ in 0..3 {
            feed.send(vec![0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        }
        drop(feed);

        let (stage, cancel) = capture_stage(Box::new(source), QueuePolicy::default());
        let queue = stage.queue.clone();
        let termination = stage.termination.clone();
        stage.spawn().unwrap().join().unwrap();

        let mut sequences = Vec::new();
        while let Some(pending) = queue.pop() {
            match pending.resolve(&cancel) {
                Resolved::Frame(frame) => sequences.push(*frame.image()),
                other => panic!("unexpected resolution: {:?}", other),
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(
            lock(&termination).clone(),
            Some(SourceTermination {
                source: "channel:cam".to_string(),
                cause: TerminationCause::EndOfStream,
                frames_captured: 3,
            })
        );
    }

    #[test]
    fn read_error_is_recorded_as_failure() {
        let (feed, source) = frame_feed("cam");
        feed.send(vec![1]).unwrap();
        feed.fail("socket closed").unwrap();

        let (stage, _cancel) = capture_stage(Box::new(source), QueuePolicy::default());
        let termination = stage.termination.clone();
        stage.spawn().unwrap().join().unwrap();

        let recorded = lock(&termination).clone().unwrap();
        assert_eq!(recorded.cause, TerminationCause::Failed("socket closed".to_string()));
        assert_eq!(recorded.frames_captured, 1);
    }

    #[test]
    fn cancelled_capture_records_nothing() {
        let (feed, source) = frame_feed("cam");
        let (stage, cancel) = capture_stage(Box::new(source), QueuePolicy::LatestOnly);
        let termination = stage.termination.clone();
        let handle = stage.spawn().unwrap();
        cancel.cancel();
        handle.join().unwrap();
        assert!(lock(&termination).is_none());
        drop(feed);
    }
}
