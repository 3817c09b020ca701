//! Splitting a Motion-JPEG byte stream into individual JPEG images.
//!
//! Frames are cut on JPEG start/end-of-image markers rather than on multipart
//! boundaries, so part headers and boundary lines are skipped without parsing them.
//! The same splitter serves HTTP `multipart/x-mixed-replace` bodies and raw
//! concatenated `.mjpeg` files.

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read};

use crate::frame::MAX_JPEG_BYTES;
use crate::sync::CancelToken;

const READ_CHUNK: usize = 8192;
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegStream<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Read until one complete JPEG is buffered and return it.
    ///
    /// `Ok(None)` on a clean end of stream or when `cancel` fires. Reads that time
    /// out are retried after checking `cancel`, which keeps a stalled stream
    /// interruptible as long as the reader has a read timeout.
    pub fn read_next_jpeg(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(read) => read,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(err).context("read mjpeg chunk"),
            };
            if read == 0 {
                if !self.buffer.is_empty() {
                    log::debug!(
                        "mjpeg stream ended with {} unframed bytes",
                        self.buffer.len()
                    );
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            self.trim_buffer();
        }
    }

    /// Bound memory when the stream carries no frames or an oversized frame.
    fn trim_buffer(&mut self) {
        if find_marker(&self.buffer, 0, JPEG_SOI).is_none() {
            // Keep a trailing 0xFF in case the marker straddles two reads.
            let keep = 1.min(self.buffer.len());
            let drain_len = self.buffer.len() - keep;
            self.buffer.drain(..drain_len);
        } else if self.buffer.len() > MAX_JPEG_BYTES * 2 {
            log::warn!(
                "mjpeg frame exceeded {} bytes without an end marker; resyncing",
                MAX_JPEG_BYTES
            );
            let keep = 2.min(self.buffer.len());
            let drain_len = self.buffer.len() - keep;
            self.buffer.drain(..drain_len);
        }
    }
}

/// Bounds of the first complete JPEG in `buffer`.
///
/// Start and end markers nest, so an EXIF thumbnail (a whole JPEG inside the
/// APP1 segment) does not end the outer image early.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find_marker(buffer, 0, JPEG_SOI)?;
    let mut depth = 0usize;
    let mut at = start + 2;
    loop {
        let offset = buffer
            .get(at..)?
            .windows(2)
            .position(|window| window == JPEG_SOI || window == JPEG_EOI)?;
        let marker = at + offset;
        if buffer[marker + 1] == JPEG_EOI[1] {
            if depth == 0 {
                return Some((start, marker + 2));
            }
            depth -= 1;
        } else {
            depth += 1;
        }
        at = marker + 2;
    }
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|window| window == marker)
        .map(|offset| from + offset)
}
