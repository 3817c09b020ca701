//! Decode executor.
//!
//! Decoding runs off the capture thread so a slow codec never blocks network reads.
//! Every submitted `RawFrame` yields a `PendingResult` that the dispatch stage
//! resolves later, strictly in submission order.
//!
//! Two policies:
//! - `DecodePolicy::Pool`: N workers on an unbounded work queue. Every frame is
//!   decoded; completion order across workers is not guaranteed.
//! - `DecodePolicy::LatestOnly`: one worker behind a single-slot work queue. A new
//!   submission discards the job still waiting in the slot.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{select, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::frame::{DecodedFrame, RawFrame};
use crate::sync::{lock, CancelToken, SingleSlot};

/// Turns one encoded buffer into one in-memory image.
///
/// Called concurrently from every worker of a pool, hence `Sync`.
pub trait FrameDecoder<E>: Send + Sync {
    fn decode(&self, raw: &RawFrame) -> Result<E>;
}

impl<E, F> FrameDecoder<E> for F
where
    F: Fn(&RawFrame) -> Result<E> + Send + Sync,
{
    fn decode(&self, raw: &RawFrame) -> Result<E> {
        self(raw)
    }
}

/// Worker layout of the decode executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Fixed pool of workers, unbounded work queue, nothing dropped.
    Pool { workers: usize },
    /// Single worker, single-slot work queue, stale jobs discarded.
    LatestOnly,
}

impl DecodePolicy {
    pub fn workers(&self) -> usize {
        match self {
            DecodePolicy::Pool { workers } => *workers,
            DecodePolicy::LatestOnly => 1,
        }
    }
}

type DecodeOutcome<E> = Result<Arc<DecodedFrame<E>>>;

struct Job<E> {
    raw: RawFrame,
    reply: Sender<DecodeOutcome<E>>,
}

// ----------------------------------------------------------------------------
// PendingResult: handle to a decode that may not have finished
// ----------------------------------------------------------------------------

/// What resolving a `PendingResult` produced.
#[derive(Debug)]
pub enum Resolved<E> {
    Frame(Arc<DecodedFrame<E>>),
    /// The decoder returned an error or panicked.
    Failed(anyhow::Error),
    /// The job was discarded before it ran (superseded or executor shut down).
    Discarded,
    /// The cancel token fired while waiting.
    Interrupted,
}

/// Single-use handle to the decode of one raw frame.
#[derive(Debug)]
pub struct PendingResult<E> {
    sequence: u64,
    reply: Receiver<DecodeOutcome<E>>,
}

impl<E> PendingResult<E> {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Block until the decode finishes or `cancel` fires.
    pub fn resolve(self, cancel: &CancelToken) -> Resolved<E> {
        select! {
            recv(self.reply) -> outcome => match outcome {
                Ok(Ok(frame)) => Resolved::Frame(frame),
                Ok(Err(err)) => Resolved::Failed(err),
                Err(_) => Resolved::Discarded,
            },
            recv(cancel.channel()) -> _ => Resolved::Interrupted,
        }
    }
}

// ----------------------------------------------------------------------------
// DecodeExecutor
// ----------------------------------------------------------------------------

enum WorkQueue<E> {
    Pool {
        submit: Mutex<Option<Sender<Job<E>>>>,
        drain: Receiver<Job<E>>,
    },
    Latest(Arc<SingleSlot<Job<E>>>),
}

/// Worker threads plus the work queue feeding them.
pub struct DecodeExecutor<E> {
    work: WorkQueue<E>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
}

impl<E: Send + Sync + 'static> DecodeExecutor<E> {
    /// Spawn the workers for `policy`.
    ///
    /// `cancel` stops the workers; it is usually the session-wide token.
    pub fn spawn(
        policy: DecodePolicy,
        decoder: Arc<dyn FrameDecoder<E>>,
        cancel: CancelToken,
    ) -> Result<Self> {
        if policy.workers() == 0 {
            return Err(anyhow!("decode executor needs at least one worker"));
        }

        let (work, handles) = match policy {
            DecodePolicy::Pool { workers } => {
                let (tx, rx) = crossbeam_channel::unbounded::<Job<E>>();
                let mut handles = Vec::with_capacity(workers);
                for index in 0..workers {
                    let rx = rx.clone();
                    let decoder = decoder.clone();
                    let cancel = cancel.clone();
                    let handle = thread::Builder::new()
                        .name(format!("mjpeg-decode-{}", index))
                        .spawn(move || pool_worker(rx, decoder, cancel))
                        .context("spawn decode worker")?;
                    handles.push(handle);
                }
                let work = WorkQueue::Pool {
                    submit: Mutex::new(Some(tx)),
                    drain: rx,
                };
                (work, handles)
            }
            DecodePolicy::LatestOnly => {
                let slot = Arc::new(SingleSlot::new());
                let worker_slot = slot.clone();
                let handle = thread::Builder::new()
                    .name("mjpeg-decode-latest".to_string())
                    .spawn(move || latest_worker(worker_slot, decoder))
                    .context("spawn decode worker")?;
                (WorkQueue::Latest(slot), vec![handle])
            }
        };

        log::debug!("decode executor started: {:?}", policy);
        Ok(Self {
            work,
            workers: Mutex::new(handles),
            cancel,
        })
    }
}

impl<E> DecodeExecutor<E> {
    /// Queue `raw` for decoding. `None` once the executor has been shut down.
    pub fn submit(&self, raw: RawFrame) -> Option<PendingResult<E>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let sequence = raw.sequence();
        let (reply, pending) = crossbeam_channel::bounded(1);
        let job = Job { raw, reply };

        match &self.work {
            WorkQueue::Pool { submit, .. } => {
                let guard = lock(submit);
                let tx = guard.as_ref()?;
                tx.send(job).ok()?;
            }
            WorkQueue::Latest(slot) => match slot.put(job) {
                Ok(Some(superseded)) => {
                    log::trace!(
                        "decode of frame {} superseded by frame {}",
                        superseded.raw.sequence(),
                        sequence
                    );
                }
                Ok(None) => {}
                Err(_) => return None,
            },
        }

        Some(PendingResult {
            sequence,
            reply: pending,
        })
    }

    /// Stop accepting work and discard everything still queued.
    ///
    /// In-flight decodes are not awaited; their results are simply never read.
    pub fn shutdown_now(&self) {
        self.cancel.cancel();
        let discarded = match &self.work {
            WorkQueue::Pool { submit, drain } => {
                lock(submit).take();
                drain.try_iter().count()
            }
            WorkQueue::Latest(slot) => {
                let pending = usize::from(slot.is_occupied());
                slot.abort();
                pending
            }
        };
        if discarded > 0 {
            log::debug!("decode executor discarded {} queued job(s)", discarded);
        }
    }

    /// Take the worker handles so the caller can join them with its own deadline.
    pub(crate) fn take_workers(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.workers))
    }
}

impl<E> Drop for DecodeExecutor<E> {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn pool_worker<E>(jobs: Receiver<Job<E>>, decoder: Arc<dyn FrameDecoder<E>>, cancel: CancelToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        select! {
            recv(jobs) -> job => match job {
                Ok(job) => run_job(job, decoder.as_ref()),
                Err(_) => break,
            },
            recv(cancel.channel()) -> _ => break,
        }
    }
}

fn latest_worker<E>(slot: Arc<SingleSlot<Job<E>>>, decoder: Arc<dyn FrameDecoder<E>>) {
    while let Some(job) = slot.take() {
        run_job(job, decoder.as_ref());
    }
}

fn run_job<E>(job: Job<E>, decoder: &dyn FrameDecoder<E>) {
    let Job { raw, reply } = job;
    let started = Instant::now();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(&raw))) {
        Ok(Ok(image)) => Ok(Arc::new(DecodedFrame::new(image, &raw))),
        Ok(Err(err)) => Err(err.context(format!("decode frame {}", raw.sequence()))),
        Err(_) => Err(anyhow!("decoder panicked on frame {}", raw.sequence())),
    };
    log::trace!(
        "frame {} decoded in {:?} (ok={})",
        raw.sequence(),
        started.elapsed(),
        outcome.is_ok()
    );
    // The resolver may already be gone (superseded or shutting down).
    let _ = reply.send(outcome);
}

// ----------------------------------------------------------------------------
// JPEG -> RGB decoder (image crate)
// ----------------------------------------------------------------------------

/// Decoded 8-bit RGB pixels.
#[cfg(feature = "ingest-http")]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decodes JPEG (or any format the `image` crate recognises) into `RgbImage`.
#[cfg(feature = "ingest-http")]
#[derive(Clone, Copy, Debug, Default)]
pub struct RgbImageDecoder;

#[cfg(feature = "ingest-http")]
impl FrameDecoder<RgbImage> for RgbImageDecoder {
    fn decode(&self, raw: &RawFrame) -> Result<RgbImage> {
        use image::GenericImageView;

        let image = image::load_from_memory(raw.bytes()).context("decode jpeg")?;
        let (width, height) = image.dimensions();
        Ok(RgbImage {
            pixels: image.into_rgb8().into_raw(),
            width,
            height,
        })
    }
}
