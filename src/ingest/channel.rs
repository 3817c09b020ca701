//! Frames pushed into the pipeline from another thread.
//!
//! `frame_feed()` returns a `FrameFeed` (producer side) and a `ChannelSource`.
//! The source can be cloned, so a source factory can hand a fresh source to
//! every session while the feed keeps working across stop/start cycles.
//! Dropping every `FrameFeed` ends the stream.

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver, Sender};

use super::FrameSource;
use crate::sync::CancelToken;

type FeedItem = Result<Vec<u8>>;

/// Producer side of a `ChannelSource`.
#[derive(Clone)]
pub struct FrameFeed {
    tx: Sender<FeedItem>,
}

impl FrameFeed {
    /// Queue one encoded frame.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(Ok(bytes))
            .map_err(|_| anyhow!("frame feed disconnected"))
    }

    /// Make the source's next read fail with `reason`.
    pub fn fail(&self, reason: &str) -> Result<()> {
        self.tx
            .send(Err(anyhow!("{}", reason)))
            .map_err(|_| anyhow!("frame feed disconnected"))
    }
}

#[derive(Clone)]
pub struct ChannelSource {
    rx: Receiver<FeedItem>,
    name: String,
}

/// Create a connected feed/source pair.
pub fn frame_feed(name: &str) -> (FrameFeed, ChannelSource) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        FrameFeed { tx },
        ChannelSource {
            rx,
            name: name.to_string(),
        },
    )
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        select! {
            recv(self.rx) -> item => match item {
                Ok(Ok(bytes)) => Ok(Some(bytes)),
                Ok(Err(err)) => Err(err),
                Err(_) => Ok(None),
            },
            recv(cancel.channel()) -> _ => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn delivers_frames_errors_and_end_of_stream() {
        let (feed, mut source) = frame_feed("test");
        let cancel = CancelToken::new();

        feed.send(vec![1]).unwrap();
        feed.fail("camera unplugged").unwrap();
        drop(feed);

        assert_eq!(source.next_frame(&cancel).unwrap(), Some(vec![1]));
        let err = source.next_frame(&cancel).unwrap_err();
        assert_eq!(err.to_string(), "camera unplugged");
        assert_eq!(source.next_frame(&cancel).unwrap(), None);
    }

    #[test]
    fn blocked_read_returns_on_cancel() {
        let (_feed, mut source) = frame_feed("idle");
        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.cancel();
            })
        };
        assert_eq!(source.next_frame(&cancel).unwrap(), None);
        canceller.join().unwrap();
    }
}
