//! Synthetic frame source for `stub://` URLs.
//!
//! Produces small JPEG-framed buffers (start/end markers around a numbered
//! payload) at a target rate. Useful for demos and pipeline tests where no camera
//! is reachable. The payload is not a decodable image.
//!
//! URL form: `stub://name?fps=10&frames=100` (`frames` limits the stream length).

use anyhow::Result;
use std::time::Instant;

use super::{pace, FrameSource, SourceLocation};
use crate::sync::CancelToken;

const DEFAULT_FPS: u32 = 10;
const PAYLOAD_BYTES: usize = 256;

pub struct SyntheticSource {
    name: String,
    target_fps: u32,
    frame_limit: Option<u64>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(name: &str, target_fps: u32, frame_limit: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            target_fps,
            frame_limit,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub(crate) fn from_location(target: &str) -> Result<Self> {
        let target = SourceLocation::parse(target);
        Ok(Self::new(
            target.location,
            target.param("fps")?.unwrap_or(DEFAULT_FPS),
            target.param("frames")?,
        ))
    }

    /// Marker-framed payload that starts with the frame number as 16 hex digits.
    fn generate_frame(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAYLOAD_BYTES + 20);
        bytes.extend_from_slice(&[0xFF, 0xD8]);
        bytes.extend_from_slice(format!("{:016x}", self.frame_count).as_bytes());
        for i in 0..PAYLOAD_BYTES {
            // Never emit 0xFF so the payload cannot contain a marker.
            bytes.push(((i as u64 + self.frame_count) % 255) as u8);
        }
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to stub://{}", self.name);
        Ok(())
    }

    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        if self
            .frame_limit
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Ok(None);
        }
        if pace(self.last_frame_at, self.target_fps, cancel) {
            return Ok(None);
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(self.generate_frame()))
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }
}

/// Frame number embedded by `SyntheticSource`, if `bytes` came from one.
pub fn synthetic_frame_number(bytes: &[u8]) -> Option<u64> {
    let digits = std::str::from_utf8(bytes.get(2..18)?).ok()?;
    u64::from_str_radix(digits, 16).ok()
}
