//! Remote camera ingestion over HTTP.
//!
//! Pulls frames from an ESP32-CAM style endpoint: either a multipart MJPEG
//! stream (scanned for JPEG SOI/EOI markers) or a single-JPEG snapshot URL,
//! auto-detected from the response content type. Reads are bounded by a
//! short timeout so a wedged camera can never stall the pipeline; callers
//! retry through [`Backoff`].

use crate::frame::Frame;
use rand::Rng;
use std::io::Read;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    #[error("bad stream url: {0}")]
    BadUrl(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Anything the pipeline can pull grayscale frames from.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, StreamError>;
    /// False once frames have stopped arriving for longer than the grace
    /// window; surfaces as the camera-error placeholder upstream.
    fn healthy(&self) -> bool;
    /// Human-readable origin for logs and status output.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// http(s) URL of the MJPEG stream or snapshot endpoint.
    pub url: String,
    /// Per-read network timeout.
    pub read_timeout: Duration,
    /// Frames stop counting as healthy after this much silence.
    pub health_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://192.168.1.101:81/stream".to_string(),
            read_timeout: Duration::from_secs(2),
            health_grace: Duration::from_secs(5),
        }
    }
}

enum Mode {
    Mjpeg(MjpegReader),
    Snapshot,
}

/// HTTP MJPEG / snapshot frame source.
pub struct MjpegSource {
    config: StreamConfig,
    agent: ureq::Agent,
    mode: Option<Mode>,
    last_frame_at: Option<Instant>,
    sequence: u64,
}

impl MjpegSource {
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| StreamError::BadUrl(format!("{}: {e}", config.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StreamError::BadUrl(format!(
                "unsupported scheme '{}': expected http(s)",
                parsed.scheme()
            )));
        }

        let agent = ureq::builder()
            .timeout_connect(config.read_timeout)
            .timeout_read(config.read_timeout)
            .build();

        Ok(Self {
            config,
            agent,
            mode: None,
            last_frame_at: None,
            sequence: 0,
        })
    }

    fn connect(&mut self) -> Result<(), StreamError> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .map_err(|e| StreamError::Unavailable(format!("connect {}: {e}", self.config.url)))?;

        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            tracing::info!(url = %self.config.url, "connected to MJPEG stream");
            self.mode = Some(Mode::Mjpeg(MjpegReader::new(response.into_reader())));
        } else {
            tracing::info!(url = %self.config.url, content_type, "using snapshot mode");
            self.mode = Some(Mode::Snapshot);
        }
        Ok(())
    }

    fn pull_jpeg(&mut self) -> Result<Vec<u8>, StreamError> {
        if self.mode.is_none() {
            self.connect()?;
        }
        let result = match self.mode.as_mut() {
            Some(Mode::Mjpeg(reader)) => reader.read_next_jpeg(),
            Some(Mode::Snapshot) => fetch_snapshot(&self.agent, &self.config.url),
            None => unreachable!("connect() either sets a mode or errors"),
        };
        if result.is_err() {
            // Reconnect from scratch on the next pull.
            self.mode = None;
        }
        result
    }
}

impl FrameSource for MjpegSource {
    fn next_frame(&mut self) -> Result<Frame, StreamError> {
        let jpeg = self.pull_jpeg()?;
        let luma = image::load_from_memory(&jpeg)
            .map_err(|e| StreamError::Decode(format!("jpeg: {e}")))?
            .into_luma8();

        let (width, height) = luma.dimensions();
        self.sequence += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame {
            data: luma.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
            sequence: self.sequence,
        })
    }

    fn healthy(&self) -> bool {
        self.last_frame_at
            .map(|t| t.elapsed() <= self.config.health_grace)
            .unwrap_or(false)
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

/// Incremental scanner over a multipart body, yielding complete JPEGs.
struct MjpegReader {
    reader: Box<dyn Read + Send + Sync + 'static>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: impl Read + Send + Sync + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| StreamError::Unavailable(format!("read mjpeg chunk: {e}")))?;
            if read == 0 {
                return Err(StreamError::Unavailable("mjpeg stream ended".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // A buffer without a complete frame at this size means garbage;
            // keep the tail so a marker split across reads survives.
            if self.buffer.len() > MAX_JPEG_BYTES {
                let keep = self.buffer.len().min(2);
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, StreamError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| StreamError::Unavailable(format!("snapshot {url}: {e}")))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .map_err(|e| StreamError::Unavailable(format!("read snapshot: {e}")))?;
    if bytes.is_empty() {
        return Err(StreamError::Unavailable("empty snapshot".to_string()));
    }
    Ok(bytes)
}

/// Locate one complete JPEG (SOI 0xFFD8 .. EOI 0xFFD9) in the buffer.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer
        .windows(2)
        .position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .map(|p| start + 2 + p + 2)?;
    Some((start, end))
}

/// Bounded exponential backoff with jitter for stream reconnects.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next retry; doubles per attempt up to `max`, with
    /// up to 25% added jitter so a fleet of daemons does not reconnect in
    /// lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        capped.mul_f64(1.0 + jitter).min(self.max.mul_f64(1.25))
    }

    /// Rearm after a successful pull.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jpeg_bounds_found_in_noise() {
        let mut buf = vec![0x01, 0x02];
        buf.extend_from_slice(&[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
        buf.extend_from_slice(&[0x03]);
        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!(&buf[start..end], &[0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
    }

    #[test]
    fn jpeg_bounds_requires_both_markers() {
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00, 0x01]).is_none());
        assert!(find_jpeg_bounds(&[0x00, 0xFF, 0xD9]).is_none());
        assert!(find_jpeg_bounds(&[]).is_none());
    }

    #[test]
    fn mjpeg_reader_splits_consecutive_frames() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--boundary\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(&[0xFF, 0xD8, 0x11, 0xFF, 0xD9]);
        body.extend_from_slice(b"\r\n--boundary\r\n\r\n");
        body.extend_from_slice(&[0xFF, 0xD8, 0x22, 0x22, 0xFF, 0xD9]);

        let mut reader = MjpegReader::new(std::io::Cursor::new(body));
        assert_eq!(reader.read_next_jpeg().unwrap(), vec![0xFF, 0xD8, 0x11, 0xFF, 0xD9]);
        assert_eq!(
            reader.read_next_jpeg().unwrap(),
            vec![0xFF, 0xD8, 0x22, 0x22, 0xFF, 0xD9]
        );
        // Stream exhausted afterwards.
        assert!(reader.read_next_jpeg().is_err());
    }

    #[test]
    fn rejects_non_http_url() {
        let config = StreamConfig {
            url: "rtsp://camera/stream".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            MjpegSource::new(config),
            Err(StreamError::BadUrl(_))
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(second >= Duration::from_millis(200));

        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(5).mul_f64(1.25));
        }

        backoff.reset();
        let rearmed = backoff.next_delay();
        assert!(rearmed < Duration::from_millis(100).mul_f64(2.0));
    }
}
