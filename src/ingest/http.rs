//! HTTP MJPEG source.
//!
//! Connects to an HTTP(S) endpoint serving `multipart/x-mixed-replace` MJPEG and
//! splits the body into JPEG frames. Endpoints that answer with a single image
//! are polled as snapshots instead.
//!
//! The connection uses a short read timeout so a stalled camera never blocks
//! `stop()`: each timed-out read re-checks the cancel token and retries.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use url::Url;

use super::mjpeg::MjpegStream;
use super::FrameSource;
use crate::frame::MAX_JPEG_BYTES;
use crate::sync::CancelToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(100);

pub struct HttpMjpegSource {
    url: String,
    read_timeout: Duration,
    stream: Option<HttpStream>,
    connected_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream<Box<dyn Read + Send>>),
    Snapshot(ureq::Agent),
}

impl HttpMjpegSource {
    pub fn new(url: &str, read_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse stream url '{}'", url))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported http source scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            url: url.to_string(),
            read_timeout,
            stream: None,
            connected_at: None,
            frame_count: 0,
        })
    }

    fn agent(&self, read_timeout: Duration) -> ureq::Agent {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(read_timeout)
            .build()
    }
}

impl FrameSource for HttpMjpegSource {
    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent(self.read_timeout)
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            let reader: Box<dyn Read + Send> = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
            log::info!("HttpMjpegSource: streaming {} ({})", self.url, content_type);
        } else {
            self.stream = Some(HttpStream::Snapshot(self.agent(SNAPSHOT_TIMEOUT)));
            log::info!(
                "HttpMjpegSource: {} is not multipart ({}); polling snapshots",
                self.url,
                content_type
            );
        }
        self.connected_at = Some(Instant::now());
        Ok(())
    }

    fn next_frame(&mut self, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source not connected; call connect() first"))?;
        let frame = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(cancel)?,
            HttpStream::Snapshot(agent) => {
                if self.frame_count > 0 && cancel.sleep(SNAPSHOT_INTERVAL) {
                    return Ok(None);
                }
                Some(fetch_snapshot(agent, &self.url)?)
            }
        };
        match &frame {
            Some(_) => self.frame_count += 1,
            None if !cancel.is_cancelled() => log::info!(
                "HttpMjpegSource: {} closed after {} frames ({:?} connected)",
                self.url,
                self.frame_count,
                self.connected_at.map(|at| at.elapsed()).unwrap_or_default()
            ),
            None => {}
        }
        Ok(frame)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!("jpeg snapshot exceeded {} bytes", MAX_JPEG_BYTES));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        let timeout = Duration::from_millis(100);
        assert!(HttpMjpegSource::new("ftp://camera/stream", timeout).is_err());
        assert!(HttpMjpegSource::new("not a url", timeout).is_err());
        let source = HttpMjpegSource::new("http://127.0.0.1:81/stream", timeout).unwrap();
        assert_eq!(source.describe(), "http://127.0.0.1:81/stream");
    }

    #[test]
    fn next_frame_requires_connect() {
        let mut source =
            HttpMjpegSource::new("http://127.0.0.1:81/stream", Duration::from_millis(100))
                .unwrap();
        assert!(source.next_frame(&CancelToken::new()).is_err());
    }
}
