//! Synthetic frame source (`stub://`).
//!
//! Renders a static gray "parking lane" background. In the `sweep` scenario a
//! silver vehicle-sized block crosses the frame for a few frames every
//! `SWEEP_PERIOD` frames; `static` never changes. Used for demos and tests.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::time::Instant;

use super::{frame_interval, CameraSettings, FrameSource, SourceStats};
use crate::frame::Frame;

const SWEEP_PERIOD: u64 = 60;
const SWEEP_FRAMES: u64 = 6;
const VEHICLE_COLOR: Rgb<u8> = Rgb([225, 228, 232]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticScenario {
    Sweep,
    Static,
}

impl SyntheticScenario {
    fn from_url(url: &str) -> Result<Self> {
        let name = url.trim_start_matches("stub://");
        match name {
            "" | "sweep" | "front_gate" => Ok(SyntheticScenario::Sweep),
            "static" => Ok(SyntheticScenario::Static),
            other => Err(anyhow!("unknown synthetic scenario '{}'", other)),
        }
    }
}

pub struct SyntheticSource {
    settings: CameraSettings,
    scenario: SyntheticScenario,
    connected: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        let scenario = SyntheticScenario::from_url(&settings.url)?;
        if settings.width < 16 || settings.height < 16 {
            return Err(anyhow!(
                "synthetic frames must be at least 16x16, got {}x{}",
                settings.width,
                settings.height
            ));
        }
        Ok(Self {
            settings,
            scenario,
            connected: false,
            frame_count: 0,
            last_frame_at: None,
        })
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.settings.width, self.settings.height);
        let mut img = RgbImage::from_fn(w, h, |_, y| {
            // Lane markings every 40 rows keep the background non-uniform.
            if y % 40 < 2 {
                Rgb([180, 180, 60])
            } else {
                Rgb([70, 72, 75])
            }
        });

        if self.scenario == SyntheticScenario::Sweep {
            let phase = self.frame_count % SWEEP_PERIOD;
            if phase < SWEEP_FRAMES {
                let block_w = w / 3;
                let block_h = h / 3;
                let step = (w - block_w) / SWEEP_FRAMES as u32;
                let x0 = step * phase as u32;
                let y0 = h / 3;
                for y in y0..(y0 + block_h).min(h) {
                    for x in x0..(x0 + block_w).min(w) {
                        img.put_pixel(x, y, VEHICLE_COLOR);
                    }
                }
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({:?}, {}x{})",
            self.settings.url,
            self.scenario,
            self.settings.width,
            self.settings.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        // Pace like a real camera running at target_fps.
        if let Some(last) = self.last_frame_at {
            let interval = frame_interval(self.settings.target_fps);
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        let frame = Frame::new(self.render());
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn release(&mut self) {
        self.connected = false;
        self.last_frame_at = None;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.settings.url.clone(),
        }
    }
}
