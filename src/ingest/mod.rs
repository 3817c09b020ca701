//! Frame sources.
//!
//! A source yields encoded frames one at a time, blocking until the next frame
//! arrives. Available sources:
//! - HTTP multipart MJPEG streams (feature: ingest-http)
//! - Concatenated MJPEG files (`file://`)
//! - Synthetic frames for demos and tests (`stub://`)
//! - Frames pushed from another thread (`ChannelSource`)
//!
//! Sources never retry. A read error or end of stream ends the capture session;
//! reconnecting means starting a new session with a fresh source.

pub mod channel;
pub mod file;
#[cfg(feature = "ingest-http")]
pub mod http;
pub mod mjpeg;
pub mod synthetic;

pub use channel::{ChannelSource, FrameFeed};
pub use file::FileMjpegSource;
#[cfg(feature = "ingest-http")]
pub use http::HttpMjpegSource;
pub use mjpeg::MjpegStream;
pub use synthetic::SyntheticSource;

use anyhow::{anyhow, bail, Result};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::sync::CancelToken;

/// Producer of encoded frames.
pub trait FrameSource: Send {
    /// Open the underlying stream. Called once per session, from `Receiver::start`.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Block until the next encoded frame is available.
    ///
    /// `Ok(None)` means the stream ended or `cancel` fired. Implementations must
    /// notice `cancel` within a bounded time even while the stream is stalled.
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Open a source for `url` by scheme.
///
/// `read_timeout` bounds how long a network read may block before the source
/// re-checks for cancellation.
pub fn open_source(url: &str, read_timeout: Duration) -> Result<Box<dyn FrameSource>> {
    let url = url.trim();
    if let Some(target) = url.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticSource::from_location(target)?));
    }
    if let Some(target) = url.strip_prefix("file://") {
        return Ok(Box::new(FileMjpegSource::from_location(target)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "ingest-http")]
        {
            return Ok(Box::new(HttpMjpegSource::new(url, read_timeout)?));
        }
        #[cfg(not(feature = "ingest-http"))]
        {
            let _ = read_timeout;
            bail!("http streams require the ingest-http feature");
        }
    }
    Err(anyhow!(
        "unsupported stream url '{}'; expected http(s)://, file:// or stub://",
        url
    ))
}

/// `location?key=value&key=value` as used by `stub://` and `file://` URLs.
pub(crate) struct SourceLocation<'a> {
    pub location: &'a str,
    params: Vec<(&'a str, &'a str)>,
}

impl<'a> SourceLocation<'a> {
    pub(crate) fn parse(target: &'a str) -> Self {
        let (location, query) = target.split_once('?').unwrap_or((target, ""));
        let params = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();
        Self { location, params }
    }

    pub(crate) fn param<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some((_, raw)) = self.params.iter().find(|(name, _)| *name == key) else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => bail!("invalid value '{}' for '{}'", raw, key),
        }
    }
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// Sleep off whatever is left of the frame interval. Returns true if cancelled.
pub(crate) fn pace(last_frame_at: Option<Instant>, target_fps: u32, cancel: &CancelToken) -> bool {
    let Some(last) = last_frame_at else {
        return cancel.is_cancelled();
    };
    let remaining = frame_interval(target_fps).saturating_sub(last.elapsed());
    if remaining.is_zero() {
        return cancel.is_cancelled();
    }
    cancel.sleep(remaining)
}
