//! V4L2 camera source (feature: camera-v4l2).
//!
//! Opens a local device node such as `/dev/video0`, asks for RGB24 and falls
//! back to whatever the driver keeps (RGB3 or NV12 are accepted).

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Instant;

use super::normalize::{to_rgb_image, PixelFormat};
use super::{health_grace, CameraSettings, FrameSource, SourceStats};
use crate::frame::Frame;

pub struct V4l2Source {
    settings: CameraSettings,
    state: Option<DeviceState>,
    pixel_format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        if settings.url.trim().is_empty() {
            return Err(anyhow!("v4l2 device path is empty"));
        }
        Ok(Self {
            active_width: settings.width,
            active_height: settings.height,
            settings,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        })
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.settings.url)
            .with_context(|| format!("open v4l2 device {}", self.settings.url))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: {} rejected RGB3 {}x{}: {}",
                    self.settings.url,
                    self.settings.width,
                    self.settings.height,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr)?;

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: cannot set fps on {}: {}", self.settings.url, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.settings.url,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let image = state
            .with_stream_mut(|stream| {
                let (buf, _meta) = stream.next().context("capture v4l2 frame")?;
                to_rgb_image(buf, self.active_width, self.active_height, self.pixel_format)
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                err
            })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::new(image))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.settings.url);
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        self.last_frame_at
            .map_or(true, |at| at.elapsed() <= health_grace(self.settings.target_fps))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.settings.url.clone(),
        }
    }
}
