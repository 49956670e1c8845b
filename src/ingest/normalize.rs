use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

/// Pixel layouts a V4L2 device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Result<Self> {
        match fourcc {
            b"RGB3" => Ok(PixelFormat::Rgb24),
            b"NV12" => Ok(PixelFormat::Nv12),
            other => Err(anyhow!(
                "unsupported v4l2 pixel format {}",
                String::from_utf8_lossy(other)
            )),
        }
    }

    fn expected_len(self, width: u32, height: u32) -> Option<usize> {
        let plane = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Rgb24 => plane.checked_mul(3),
            PixelFormat::Nv12 => plane.checked_add(plane / 2),
        }
    }
}

/// Convert a captured device buffer into an RGB image.
pub(crate) fn to_rgb_image(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    let expected = format
        .expected_len(width, height)
        .ok_or_else(|| anyhow!("{:?} frame dimensions overflow", format))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "{:?} frame too short: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }

    match format {
        PixelFormat::Rgb24 => RgbImage::from_raw(width, height, pixels[..expected].to_vec())
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height)),
        PixelFormat::Nv12 => {
            let w = width as usize;
            let y_plane = w * height as usize;
            Ok(RgbImage::from_fn(width, height, |x, y| {
                let (i, j) = (x as usize, y as usize);
                let luma = pixels[j * w + i] as f32;
                let uv = y_plane + (j / 2) * w + (i / 2) * 2;
                let u = pixels[uv] as f32 - 128.0;
                let v = pixels[uv + 1] as f32 - 128.0;
                Rgb([
                    clamp_to_u8(luma + 1.402 * v),
                    clamp_to_u8(luma - 0.344_136 * u - 0.714_136 * v),
                    clamp_to_u8(luma + 1.772 * u),
                ])
            }))
        }
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_nv12_is_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = to_rgb_image(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert!(rgb.pixels().all(|p| *p == Rgb([128, 128, 128])));
        Ok(())
    }

    #[test]
    fn rgb_buffers_are_length_checked() {
        let pixels = vec![1u8; 9];
        assert!(to_rgb_image(&pixels, 1, 3, PixelFormat::Rgb24).is_ok());
        assert!(to_rgb_image(&pixels, 2, 3, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"RGB3").unwrap(), PixelFormat::Rgb24);
        assert_eq!(PixelFormat::from_fourcc(b"NV12").unwrap(), PixelFormat::Nv12);
        assert!(PixelFormat::from_fourcc(b"MJPG").is_err());
    }
}
