//! MJPEG file source.
//!
//! Replays a file of concatenated JPEG images (what `curl` saves from an MJPEG
//! endpoint, or `ffmpeg -f mjpeg` writes). Multipart headers between images are
//! tolerated. The stream ends at end of file.
//!
//! URL form: `file:///path/to/capture.mjpeg?fps=10` (`fps=0` replays unpaced).

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::mjpeg::MjpegStream;
use super::{pace, FrameSource, SourceLocation};
use crate::sync::CancelToken;

const DEFAULT_FPS: u32 = 10;

pub struct FileMjpegSource {
    path: PathBuf,
    target_fps: u32,
    stream: Option<MjpegStream<BufReader<File>>>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

impl FileMjpegSource {
    pub fn new(path: impl AsRef<Path>, target_fps: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            target_fps,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        }
    }

    pub(crate) fn from_location(target: &str) -> Result<Self> {
        let target = SourceLocation::parse(target);
        if target.location.is_empty() {
            return Err(anyhow!("file url is missing a path"));
        }
        Ok(Self::new(
            target.location,
            target.param("fps")?.unwrap_or(DEFAULT_FPS),
        ))
    }
}

impl FrameSource for FileMjpegSource {
    fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("open mjpeg file {}", self.path.display()))?;
        self.stream = Some(MjpegStream::new(BufReader::new(file)));
        log::info!("FileMjpegSource: replaying {}", self.path.display());
        Ok(())
    }

    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("file source not connected; call connect() first"))?;
        if pace(self.last_frame_at, self.target_fps, cancel) {
            return Ok(None);
        }
        let frame = stream.read_next_jpeg(cancel)?;
        if frame.is_some() {
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
        } else {
            log::info!(
                "FileMjpegSource: {} finished after {} frames",
                self.path.display(),
                self.frame_count
            );
        }
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}
