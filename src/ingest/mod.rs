//! Camera frame sources.
//!
//! The camera address given at startup is opaque to the pipeline; this module
//! turns it into a `FrameSource`:
//! - `http://` / `https://`: IP webcam, MJPEG stream or JPEG snapshots
//! - `stub://<scenario>`: synthetic scene for demos and tests
//! - device path (e.g. `/dev/video0`): V4L2 (feature: camera-v4l2)
//!
//! Sources never retry a failed read. A read error ends the stream.

pub mod http;
#[cfg(feature = "camera-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::frame::Frame;

pub use http::HttpCameraSource;
pub use synthetic::{SyntheticScenario, SyntheticSource};
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Source;

/// Settings shared by all camera backends.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    /// Camera address: stream URL, `stub://` scenario or device path.
    pub url: String,
    /// Target frame rate. Sources decimate to this rate; 0 disables decimation.
    pub target_fps: u32,
    /// Preferred frame width (synthetic and V4L2 sources).
    pub width: u32,
    /// Preferred frame height (synthetic and V4L2 sources).
    pub height: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            url: "stub://sweep".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Statistics reported by a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// A readable frame source.
pub trait FrameSource {
    /// Human-readable source address, for logs and errors.
    fn describe(&self) -> String;

    /// Open the underlying camera.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    /// Release the camera. Must be safe to call more than once.
    fn release(&mut self) {}

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Frame> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Pick a backend for the configured camera address. Does not connect.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let url = settings.url.trim();
    if url.is_empty() {
        return Err(anyhow!("camera url is empty"));
    }
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpCameraSource::new(settings.clone())?));
    }
    if url.contains("://") {
        return Err(anyhow!(
            "unsupported camera scheme in '{}'; expected http(s)://, stub:// or a device path",
            url
        ));
    }
    open_device(settings)
}

#[cfg(feature = "camera-v4l2")]
fn open_device(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(settings.clone())?))
}

#[cfg(not(feature = "camera-v4l2"))]
fn open_device(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera device {} requires the camera-v4l2 feature",
        settings.url
    ))
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> CameraSettings {
        CameraSettings {
            url: url.to_string(),
            ..CameraSettings::default()
        }
    }

    #[test]
    fn dispatches_on_scheme() {
        assert!(open_source(&settings("stub://sweep")).is_ok());
        assert!(open_source(&settings("http://192.168.1.4:8080/video")).is_ok());
        assert!(open_source(&settings("rtsp://camera/stream")).is_err());
        assert!(open_source(&settings("   ")).is_err());
    }

    #[cfg(not(feature = "camera-v4l2"))]
    #[test]
    fn device_paths_need_v4l2_feature() {
        let err = open_source(&settings("/dev/video0")).err().unwrap();
        assert!(err.to_string().contains("camera-v4l2"));
    }

    #[test]
    fn frame_interval_handles_zero_fps() {
        assert_eq!(frame_interval(0), Duration::ZERO);
        assert_eq!(frame_interval(10), Duration::from_millis(100));
        assert_eq!(health_grace(10), Duration::from_millis(2_000));
    }
}
