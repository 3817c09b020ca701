//! Frame types flowing through the receive pipeline.
//!
//! - `RawFrame`: one encoded image exactly as cut from the stream.
//! - `DecodedFrame<E>`: the decoded image. Immutable, shared read-only once dispatched.
//! - `LastFrame<E>`: the most recently dispatched frame, readable from any thread
//!   without taking a lock.

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for a single encoded frame cut from a stream.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

// ----------------------------------------------------------------------------
// RawFrame: encoded bytes, owned by capture until handed to the decoder
// ----------------------------------------------------------------------------

/// One encoded frame as extracted from the stream.
///
/// Sequence numbers are assigned by the capture stage, start at 1 for every
/// session and never repeat within a session.
pub struct RawFrame {
    data: Vec<u8>,
    sequence: u64,
    captured_at: Instant,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Encoded payloads can be megabytes; never dump them into logs.
impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// DecodedFrame: the decoder's output plus capture metadata
// ----------------------------------------------------------------------------

/// A decoded image together with the sequence number of the raw frame it came from.
#[derive(Debug)]
pub struct DecodedFrame<E> {
    image: E,
    sequence: u64,
    captured_at: Instant,
    decoded_at: Instant,
}

impl<E> DecodedFrame<E> {
    pub fn new(image: E, raw: &RawFrame) -> Self {
        Self {
            image,
            sequence: raw.sequence(),
            captured_at: raw.captured_at(),
            decoded_at: Instant::now(),
        }
    }

    pub fn image(&self) -> &E {
        &self.image
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Time spent between capture and decode completion.
    pub fn decode_latency(&self) -> Duration {
        self.decoded_at.duration_since(self.captured_at)
    }
}

// ----------------------------------------------------------------------------
// LastFrame: single-writer, many-reader slot
// ----------------------------------------------------------------------------

/// Most recently dispatched frame.
///
/// Written only by the dispatch stage; `get` is a single atomic load, so a reader
/// sees either the previous frame or the new one, never a partially built value.
pub struct LastFrame<E> {
    slot: ArcSwapOption<DecodedFrame<E>>,
}

impl<E> LastFrame<E> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
        }
    }

    pub fn get(&self) -> Option<Arc<DecodedFrame<E>>> {
        self.slot.load_full()
    }

    pub(crate) fn store(&self, frame: Arc<DecodedFrame<E>>) {
        self.slot.store(Some(frame));
    }

    pub(crate) fn clear(&self) {
        self.slot.store(None);
    }
}

impl<E> Default for LastFrame<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_decoded(sequence: u64) -> Arc<DecodedFrame<Vec<u64>>> {
        let raw = RawFrame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], sequence);
        Arc::new(DecodedFrame::new(vec![sequence; 1024], &raw))
    }

    #[test]
    fn raw_frame_debug_hides_payload() {
        let raw = RawFrame::new(vec![1, 2, 3], 7);
        let rendered = format!("{:?}", raw);
        assert!(rendered.contains("sequence: 7"));
        assert!(rendered.contains("len: 3"));
        assert!(!rendered.contains("[1, 2, 3]"));
    }

    #[test]
    fn decoded_frame_carries_raw_sequence() {
        let frame = make_decoded(42);
        assert_eq!(frame.sequence(), 42);
        assert_eq!(frame.image().len(), 1024);
        assert!(frame.decode_latency() < Duration::from_secs(5));
    }

    #[test]
    fn last_frame_starts_empty_and_keeps_latest() {
        let last = LastFrame::new();
        assert!(last.get().is_none());

        last.store(make_decoded(1));
        last.store(make_decoded(2));
        assert_eq!(last.get().map(|f| f.sequence()), Some(2));

        last.clear();
        assert!(last.get().is_none());
    }

    #[test]
    fn concurrent_readers_never_see_partial_frames() {
        let last = Arc::new(LastFrame::new());
        let writer = {
            let last = last.clone();
            thread::spawn(move || {
                for seq in 1..=2_000 {
                    last.store(make_decoded(seq));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let last = last.clone();
                thread::spawn(move || {
                    let mut highest = 0;
                    for _ in 0..5_000 {
                        if let Some(frame) = last.get() {
                            let seq = frame.sequence();
                            assert!(frame.image().iter().all(|v| *v == seq));
                            assert!(seq >= highest, "last frame went backwards");
                            highest = seq;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(last.get().map(|f| f.sequence()), Some(2_000));
    }
}
