//! MJPEG Receiver
//!
//! Pulls a Motion-JPEG stream, decodes it off the network thread and hands every
//! decoded frame to registered listeners.
//!
//! # Architecture
//!
//! One receiver runs a three-stage pipeline per session:
//!
//! 1. **Capture**: one thread reads encoded frames from a `FrameSource`, numbers
//!    them, submits each to the decode executor and queues the pending result.
//! 2. **Decode**: a worker pool (bounded policy) or a single worker that skips
//!    stale work (latest-only policy) runs the `FrameDecoder`.
//! 3. **Dispatch**: one thread resolves pending results in capture order,
//!    publishes each frame as the latest frame and calls every listener.
//!
//! Frames are never reordered. Under the latest-only policy superseded frames are
//! dropped and counted in the statistics.
//!
//! # Module Structure
//!
//! - `receiver`: lifecycle (`start`/`stop`) and the public surface
//! - `ingest`: frame sources (HTTP MJPEG, MJPEG files, synthetic, channel-fed)
//! - `decode`: decoder trait, executor policies, pending results
//! - `queue`: ingest queue between capture and dispatch
//! - `listener`: listener trait and registry
//! - `frame`: raw and decoded frames, the latest-frame slot
//! - `config`: file and environment configuration
//! - `stats`: pipeline counters and health

mod capture;
mod dispatch;
mod sync;

pub mod config;
pub mod decode;
pub mod frame;
pub mod ingest;
pub mod listener;
pub mod queue;
pub mod receiver;
pub mod stats;

pub use capture::{SourceTermination, TerminationCause};
pub use config::ReceiverConfig;
#[cfg(feature = "ingest-http")]
pub use decode::{RgbImage, RgbImageDecoder};
pub use decode::{DecodePolicy, FrameDecoder, PendingResult, Resolved};
pub use frame::{DecodedFrame, LastFrame, RawFrame, MAX_JPEG_BYTES};
pub use ingest::channel::frame_feed;
pub use ingest::{open_source, ChannelSource, FileMjpegSource, FrameFeed, FrameSource};
#[cfg(feature = "ingest-http")]
pub use ingest::HttpMjpegSource;
pub use ingest::{synthetic::synthetic_frame_number, SyntheticSource};
pub use listener::{FrameListener, ListenerRegistry};
pub use queue::QueuePolicy;
pub use receiver::{Receiver, ReceiverState, SourceFactory};
pub use stats::ReceiverStats;
pub use sync::CancelToken;
