//! The receiver: lifecycle and public surface of one capture/decode/dispatch pipeline.
//!
//! A `Receiver` owns its listeners, its `LastFrame` slot and its statistics for its
//! whole life. Everything else (source, ingest queue, decode workers, stage threads)
//! belongs to a session that `start()` creates and `stop()` tears down.
//!
//! A source that ends on its own moves the receiver to `SourceEnded` once every
//! frame already captured has been dispatched. `stop()` then tears the finished
//! session down; `start()` is a no-op until it has.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::{CaptureStage, SourceTermination, TerminationSlot};
use crate::config::{validate_url, ReceiverConfig};
use crate::decode::{DecodeExecutor, FrameDecoder, PendingResult};
use crate::dispatch::DispatchStage;
use crate::frame::{DecodedFrame, LastFrame};
use crate::ingest::{open_source, FrameSource};
use crate::listener::{FrameListener, ListenerRegistry};
use crate::queue::IngestQueue;
use crate::stats::{PipelineStats, ReceiverStats};
use crate::sync::{lock, CancelToken};

const JOIN_POLL: Duration = Duration::from_millis(5);

/// Builds a fresh, unconnected source for every session.
pub type SourceFactory =
    Box<dyn Fn(&ReceiverConfig) -> Result<Box<dyn FrameSource>> + Send + Sync>;

type TerminationHook = Arc<dyn Fn(&SourceTermination) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverState {
    Stopped,
    Starting,
    Started,
    /// The source ended or failed and dispatch has drained; waiting for `stop()`.
    SourceEnded,
    Stopping,
}

struct Session<E> {
    cancel: CancelToken,
    executor: Arc<DecodeExecutor<E>>,
    queue: Arc<IngestQueue<PendingResult<E>>>,
    capture: JoinHandle<()>,
    dispatch: JoinHandle<()>,
}

pub struct Receiver<E> {
    config: Mutex<ReceiverConfig>,
    decoder: Arc<dyn FrameDecoder<E>>,
    source_factory: SourceFactory,
    registry: Arc<ListenerRegistry<E>>,
    last_frame: Arc<LastFrame<E>>,
    stats: Arc<PipelineStats>,
    termination: TerminationSlot,
    termination_hook: Arc<Mutex<Option<TerminationHook>>>,
    state: Arc<Mutex<ReceiverState>>,
    /// Serialises start and stop.
    transition: Mutex<()>,
    session: Mutex<Option<Session<E>>>,
}

impl<E: Send + Sync + 'static> Receiver<E> {
    /// Receiver whose sources are opened from `config.url` by scheme
    /// (`http(s)://`, `file://`, `stub://`).
    pub fn new(config: ReceiverConfig, decoder: Arc<dyn FrameDecoder<E>>) -> Result<Self> {
        Self::with_source_factory(config, decoder, |config: &ReceiverConfig| {
            open_source(&config.url, config.read_timeout)
        })
    }

    /// Receiver with a custom source per session.
    pub fn with_source_factory<F>(
        config: ReceiverConfig,
        decoder: Arc<dyn FrameDecoder<E>>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(&ReceiverConfig) -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        config.validate().context("invalid receiver config")?;
        Ok(Self {
            config: Mutex::new(config),
            decoder,
            source_factory: Box::new(factory),
            registry: Arc::new(ListenerRegistry::new()),
            last_frame: Arc::new(LastFrame::new()),
            stats: Arc::new(PipelineStats::new()),
            termination: Arc::new(Mutex::new(None)),
            termination_hook: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(ReceiverState::Stopped)),
            transition: Mutex::new(()),
            session: Mutex::new(None),
        })
    }

    /// Connect the source and launch the pipeline. A no-op unless stopped.
    ///
    /// Each start is a fresh session: the latest frame, the recorded source
    /// termination and the statistics are cleared. On error the receiver is left
    /// stopped.
    pub fn start(&self) -> Result<()> {
        let _transition = lock(&self.transition);
        {
            let mut state = lock(&self.state);
            if *state != ReceiverState::Stopped {
                log::debug!("start ignored: receiver is {:?}", *state);
                return Ok(());
            }
            *state = ReceiverState::Starting;
        }

        match self.launch() {
            Ok(session) => {
                *lock(&self.session) = Some(session);
                // A source that already ran dry has moved the state on by itself.
                let mut state = lock(&self.state);
                if *state == ReceiverState::Starting {
                    *state = ReceiverState::Started;
                }
                Ok(())
            }
            Err(err) => {
                self.set_state(ReceiverState::Stopped);
                log::error!("receiver failed to start: {:#}", err);
                Err(err)
            }
        }
    }

    /// Alias of `start`.
    pub fn create_connection(&self) -> Result<()> {
        self.start()
    }

    fn launch(&self) -> Result<Session<E>> {
        let config = self.config();
        self.last_frame.clear();
        *lock(&self.termination) = None;
        self.stats.reset();

        let mut source = (self.source_factory)(&config).context("create frame source")?;
        let origin = source.describe();
        source
            .connect()
            .with_context(|| format!("connect to {}", origin))?;

        let cancel = CancelToken::new();
        let executor = Arc::new(DecodeExecutor::spawn(
            config.policy.decode_policy(),
            self.decoder.clone(),
            cancel.clone(),
        )?);
        let queue = Arc::new(IngestQueue::new(&config.policy));

        let dispatch = DispatchStage {
            queue: queue.clone(),
            cancel: cancel.clone(),
            registry: self.registry.clone(),
            last_frame: self.last_frame.clone(),
            stats: self.stats.clone(),
            on_drained: Some(self.source_ended_hook(cancel.clone())),
        }
        .spawn()?;

        let capture = CaptureStage {
            source,
            executor: executor.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            stats: self.stats.clone(),
            termination: self.termination.clone(),
        }
        .spawn();
        let capture = match capture {
            Ok(handle) => handle,
            Err(err) => {
                cancel.cancel();
                executor.shutdown_now();
                queue.abort();
                return Err(err);
            }
        };

        log::info!(
            "receiver started: {} (policy={}, capacity={}, decode workers={})",
            origin,
            config.policy.label(),
            config.policy.capacity(),
            config.policy.decode_policy().workers()
        );
        Ok(Session {
            cancel,
            executor,
            queue,
            capture,
            dispatch,
        })
    }

    /// Runs on the dispatch thread once a session's source has ended and every
    /// captured frame has been dispatched.
    fn source_ended_hook(&self, cancel: CancelToken) -> Box<dyn FnOnce() + Send> {
        let state = self.state.clone();
        let termination = self.termination.clone();
        let hook = self.termination_hook.clone();
        Box::new(move || {
            {
                let mut state = lock(&state);
                let live = matches!(*state, ReceiverState::Starting | ReceiverState::Started);
                if !live || cancel.is_cancelled() {
                    return;
                }
                *state = ReceiverState::SourceEnded;
            }
            let Some(ended) = lock(&termination).clone() else {
                return;
            };
            log::info!("receiver source ended ({:?}); stop() to release it", ended.cause);
            let hook = lock(&hook).clone();
            if let Some(hook) = hook {
                hook(&ended);
            }
        })
    }
}

impl<E> Receiver<E> {
    /// Tear the session down. A no-op unless started or source-ended.
    ///
    /// Every blocked stage is interrupted; threads are joined until the configured
    /// stop timeout and detached (with a warning) after it. Safe to call from a
    /// listener callback or the source termination hook.
    pub fn stop(&self) {
        if !has_session(*lock(&self.state)) {
            return;
        }
        let _transition = lock(&self.transition);
        {
            let mut state = lock(&self.state);
            if !has_session(*state) {
                return;
            }
            *state = ReceiverState::Stopping;
        }

        let stop_timeout = lock(&self.config).stop_timeout;
        if let Some(session) = lock(&self.session).take() {
            shutdown_session(session, stop_timeout);
        }
        self.set_state(ReceiverState::Stopped);
        log::info!("receiver stopped");
    }

    /// Alias of `stop`.
    pub fn close_connection(&self) {
        self.stop()
    }

    /// Most recently dispatched frame of the current session. Never blocks.
    pub fn latest_frame(&self) -> Option<Arc<DecodedFrame<E>>> {
        self.last_frame.get()
    }

    /// Register a listener; returns false if it already was. Allowed at any time.
    pub fn add_listener(&self, listener: Arc<dyn FrameListener<E>>) -> bool {
        self.registry.add(listener)
    }

    /// Unregister a listener; returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn FrameListener<E>>) -> bool {
        self.registry.remove(listener)
    }

    pub fn state(&self) -> ReceiverState {
        *lock(&self.state)
    }

    pub fn is_started(&self) -> bool {
        self.state() == ReceiverState::Started
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.snapshot()
    }

    /// Started and dispatching frames (or started within the health grace period).
    pub fn is_healthy(&self) -> bool {
        self.is_started() && self.stats.is_healthy()
    }

    /// Why the current session's source stopped on its own, if it has.
    pub fn source_termination(&self) -> Option<SourceTermination> {
        lock(&self.termination).clone()
    }

    /// Call `hook` on the dispatch thread whenever a session's source ends on its
    /// own, right after the receiver moves to `SourceEnded`. Replaces any earlier
    /// hook. The hook may call `stop()`.
    pub fn on_source_termination<F>(&self, hook: F)
    where
        F: Fn(&SourceTermination) + Send + Sync + 'static,
    {
        *lock(&self.termination_hook) = Some(Arc::new(hook));
    }

    /// Change the stream URL. Only allowed while stopped.
    pub fn set_url(&self, url: &str) -> Result<()> {
        let _transition = lock(&self.transition);
        let state = self.state();
        if state != ReceiverState::Stopped {
            return Err(anyhow!(
                "cannot change the stream url while the receiver is {:?}",
                state
            ));
        }
        validate_url(url)?;
        lock(&self.config).url = url.trim().to_string();
        Ok(())
    }

    pub fn config(&self) -> ReceiverConfig {
        lock(&self.config).clone()
    }

    fn set_state(&self, state: ReceiverState) {
        *lock(&self.state) = state;
    }
}

impl<E> Drop for Receiver<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn has_session(state: ReceiverState) -> bool {
    matches!(state, ReceiverState::Started | ReceiverState::SourceEnded)
}

fn shutdown_session<E>(session: Session<E>, stop_timeout: Duration) {
    let Session {
        cancel,
        executor,
        queue,
        capture,
        dispatch,
    } = session;

    cancel.cancel();
    executor.shutdown_now();
    queue.abort();

    let deadline = Instant::now() + stop_timeout;
    let mut handles = vec![capture, dispatch];
    handles.extend(executor.take_workers());
    let mut detached = 0;
    for handle in handles {
        if !join_until(handle, deadline) {
            detached += 1;
        }
    }
    if detached > 0 {
        log::warn!(
            "{} pipeline thread(s) still busy after {:?}; detached",
            detached,
            stop_timeout
        );
    }
}

/// Join `handle` unless the deadline passes first. Returns false if detached.
fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    let name = handle.thread().name().unwrap_or("pipeline").to_string();
    if handle.thread().id() == thread::current().id() {
        // stop() called from a listener: this thread exits once the callback returns.
        return true;
    }
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{} thread did not stop in time", name);
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        log::error!("{} thread panicked", name);
    }
    true
}
