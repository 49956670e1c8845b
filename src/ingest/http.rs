//! IP webcam frame source.
//!
//! Phone "IP Webcam" style cameras serve either a `multipart/x-mixed-replace`
//! MJPEG stream or a single JPEG per request. `HttpCameraSource` handles both:
//! - MJPEG: one long-lived response, frames split on JPEG SOI/EOI markers
//! - snapshot: one GET per frame
//!
//! Frames are decoded in memory; nothing is written to disk here.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Instant;

use super::{frame_interval, health_grace, CameraSettings, FrameSource, SourceStats};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpCameraSource {
    settings: CameraSettings,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl HttpCameraSource {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        let parsed = url::Url::parse(&settings.url).context("parse camera url")?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera scheme '{}'; expected http(s)",
                parsed.scheme()
            ));
        }
        // No overall request timeout: an MJPEG response never finishes.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .build();
        Ok(Self {
            settings,
            agent,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            last_error: None,
        })
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.settings.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.settings.url))?;
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
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(HttpStream::Snapshot) => self.fetch_snapshot(),
            None => Err(anyhow!("http camera not connected; call connect() first")),
        }
    }
}

impl FrameSource for HttpCameraSource {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.settings.url)
            .call()
            .map_err(|e| {
                self.last_error = Some(e.to_string());
                anyhow!(e)
            })
            .context("connect to http camera")?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            log::info!("HttpCameraSource: {} is an mjpeg stream", self.settings.url);
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            log::info!(
                "HttpCameraSource: {} serves snapshots ({})",
                self.settings.url,
                if content_type.is_empty() {
                    "no content-type"
                } else {
                    content_type.as_str()
                }
            );
            self.stream = Some(HttpStream::Snapshot);
        }
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.settings.target_fps);
        let snapshot = matches!(self.stream, Some(HttpStream::Snapshot));
        loop {
            // Snapshots cost one request each: wait out the interval instead of
            // fetching and dropping.
            if snapshot {
                if let Some(last) = self.last_frame_at {
                    let elapsed = last.elapsed();
                    if elapsed < min_interval {
                        std::thread::sleep(min_interval - elapsed);
                    }
                }
            }

            let jpeg_bytes = self.read_jpeg().map_err(|e| {
                self.last_error = Some(e.to_string());
                e
            })?;

            // An MJPEG stream pushes at its own rate; decimate by dropping.
            let now = Instant::now();
            if !snapshot {
                if let Some(last) = self.last_frame_at {
                    if now.duration_since(last) < min_interval {
                        continue;
                    }
                }
            }

            let image = decode_jpeg(&jpeg_bytes)?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return Ok(Frame::new(image));
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("HttpCameraSource: released {}", self.settings.url);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= health_grace(0);
        };
        last_frame_at.elapsed() <= health_grace(self.settings.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.settings.url.clone(),
        }
    }
}

/// Splits a multipart MJPEG body into JPEG images.
pub(crate) struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub(crate) fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<image::RgbImage> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
