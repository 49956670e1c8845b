use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_colors;
use imageproc::morphology::dilate;

use crate::frame::{Frame, GrayFrame};

/// Sigma matching a 21x21 Gaussian kernel (`0.3 * ((21 - 1) / 2 - 1) + 0.8`).
pub const DEFAULT_BLUR_SIGMA: f32 = 3.5;
pub const DEFAULT_DIFF_THRESHOLD: u8 = 25;
pub const DEFAULT_DILATE_ITERATIONS: u8 = 2;
pub const DEFAULT_MIN_AREA: u64 = 5000;

#[derive(Clone, Debug, PartialEq)]
pub struct DifferencerConfig {
    pub blur_sigma: f32,
    /// Intensity delta (0..=255) above which a pixel counts as changed.
    pub threshold: u8,
    /// Number of 3x3 dilation passes applied to the change mask.
    pub dilate_iterations: u8,
    /// Minimum bounding-box area, in px², for a region to count as motion.
    pub min_area: u64,
}

impl Default for DifferencerConfig {
    fn default() -> Self {
        Self {
            blur_sigma: DEFAULT_BLUR_SIGMA,
            threshold: DEFAULT_DIFF_THRESHOLD,
            dilate_iterations: DEFAULT_DILATE_ITERATIONS,
            min_area: DEFAULT_MIN_AREA,
        }
    }
}

/// Axis-aligned box around one changed blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area: u64,
}

/// Regions that changed relative to the previous frame. Empty means no motion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionScore {
    regions: Vec<MotionRegion>,
}

impl MotionScore {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_regions(regions: Vec<MotionRegion>) -> Self {
        Self { regions }
    }

    pub fn has_motion(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn regions(&self) -> &[MotionRegion] {
        &self.regions
    }

    pub fn largest_area(&self) -> u64 {
        self.regions.iter().map(|r| r.area).max().unwrap_or(0)
    }
}

/// Frame differencing motion detector.
///
/// Stateless: the caller keeps the returned `GrayFrame` and hands it back as
/// `previous` on the next call.
#[derive(Clone, Debug, Default)]
pub struct FrameDifferencer {
    config: DifferencerConfig,
}

impl FrameDifferencer {
    pub fn new(config: DifferencerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DifferencerConfig {
        &self.config
    }

    /// Convert `current` to a blurred grayscale frame and score it against `previous`.
    ///
    /// The first frame (no `previous`) is only a baseline and never scores motion.
    pub fn diff(&self, previous: Option<&GrayFrame>, current: &Frame) -> (GrayFrame, MotionScore) {
        let gray = self.prepare(current);
        let Some(previous) = previous else {
            return (gray, MotionScore::none());
        };
        if previous.dimensions() != gray.dimensions() {
            log::warn!(
                "frame size changed from {:?} to {:?}; resetting motion baseline",
                previous.dimensions(),
                gray.dimensions()
            );
            return (gray, MotionScore::none());
        }

        let mask = self.change_mask(previous.image(), gray.image());
        let regions = self.regions(&mask);
        (gray, MotionScore::from_regions(regions))
    }

    fn prepare(&self, frame: &Frame) -> GrayFrame {
        let luma = luma_bt601(frame.image());
        if self.config.blur_sigma > 0.0 {
            GrayFrame::new(gaussian_blur_f32(&luma, self.config.blur_sigma))
        } else {
            GrayFrame::new(luma)
        }
    }

    /// Absolute difference, thresholded to {0, 255}, then dilated.
    fn change_mask(&self, previous: &GrayImage, current: &GrayImage) -> GrayImage {
        let threshold = self.config.threshold;
        let mask = GrayImage::from_fn(current.width(), current.height(), |x, y| {
            let a = previous.get_pixel(x, y)[0];
            let b = current.get_pixel(x, y)[0];
            if a.abs_diff(b) > threshold {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        if self.config.dilate_iterations == 0 {
            return mask;
        }
        // n passes of a 3x3 square element equal one pass with chessboard radius n.
        dilate(&mask, Norm::LInf, self.config.dilate_iterations)
    }

    fn regions(&self, mask: &GrayImage) -> Vec<MotionRegion> {
        find_contours::<i32>(mask)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .filter_map(|c| bounding_region(&c.points))
            .filter(|r| r.area >= self.config.min_area)
            .collect()
    }
}

/// BT.601 luma (OpenCV's BGR2GRAY weights) in 14-bit fixed point.
pub(crate) fn luma_bt601(image: &RgbImage) -> GrayImage {
    map_colors(image, |Rgb([r, g, b]): Rgb<u8>| {
        let y = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + (1 << 13)) >> 14;
        Luma([y.min(255) as u8])
    })
}

fn bounding_region(points: &[imageproc::point::Point<i32>]) -> Option<MotionRegion> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let width = (max_x - min_x + 1) as u32;
    let height = (max_y - min_y + 1) as u32;
    Some(MotionRegion {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        width,
        height,
        area: width as u64 * height as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    const W: u32 = 320;
    const H: u32 = 240;

    fn background() -> RgbImage {
        RgbImage::from_pixel(W, H, Rgb([40, 40, 40]))
    }

    fn with_block(x0: u32, y0: u32, size: u32) -> Frame {
        let mut img = background();
        for y in y0..(y0 + size).min(H) {
            for x in x0..(x0 + size).min(W) {
                img.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        Frame::new(img)
    }

    #[test]
    fn first_frame_is_baseline_only() {
        let differencer = FrameDifferencer::default();
        let (_, score) = differencer.diff(None, &with_block(10, 10, 120));
        assert!(!score.has_motion());
    }

    #[test]
    fn static_scene_has_no_motion() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let (_, score) = differencer.diff(Some(&baseline), &Frame::new(background()));
        assert!(!score.has_motion());
    }

    #[test]
    fn large_block_is_reported_with_its_bounds() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let (_, score) = differencer.diff(Some(&baseline), &with_block(100, 60, 100));

        assert_eq!(score.regions().len(), 1);
        let region = score.regions()[0];
        assert!(region.area >= 100 * 100);
        assert!(region.x <= 100 && region.y <= 60);
        assert!(region.x + region.width >= 200);
        assert!(region.y + region.height >= 160);
    }

    #[test]
    fn small_changes_fall_below_min_area() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let (_, score) = differencer.diff(Some(&baseline), &with_block(20, 20, 20));
        assert!(!score.has_motion());

        let sensitive = FrameDifferencer::new(DifferencerConfig {
            min_area: 100,
            ..DifferencerConfig::default()
        });
        let (_, score) = sensitive.diff(Some(&baseline), &with_block(20, 20, 20));
        assert!(score.has_motion());
    }

    #[test]
    fn faint_changes_stay_under_threshold() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let mut img = background();
        for p in img.pixels_mut() {
            *p = Rgb([50, 50, 50]);
        }
        let (_, score) = differencer.diff(Some(&baseline), &Frame::new(img));
        assert!(!score.has_motion());
    }

    #[test]
    fn luma_uses_bt601_weights() {
        let img = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            _ => Rgb([70, 72, 75]),
        });
        let luma = luma_bt601(&img);
        assert_eq!(luma.get_pixel(0, 0)[0], 76);
        assert_eq!(luma.get_pixel(1, 0)[0], 150);
        assert_eq!(luma.get_pixel(2, 0)[0], 72);
    }

    #[test]
    fn saturated_red_vehicle_is_detected() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let mut img = background();
        for y in 60..160 {
            for x in 100..200 {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        let (_, score) = differencer.diff(Some(&baseline), &Frame::new(img));
        assert!(score.has_motion());
        assert!(score.largest_area() >= 90 * 90);
    }

    #[test]
    fn resized_frame_resets_baseline() {
        let differencer = FrameDifferencer::default();
        let (baseline, _) = differencer.diff(None, &Frame::new(background()));
        let other = Frame::new(RgbImage::from_pixel(160, 120, Rgb([255, 255, 255])));
        let (gray, score) = differencer.diff(Some(&baseline), &other);
        assert!(!score.has_motion());
        assert_eq!(gray.dimensions(), (160, 120));
    }
}
