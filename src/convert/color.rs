//! Linear HDR → encoder-ready pixel format conversion
//!
//! Pure CPU fallback for frames that were not converted on the GPU. Input is
//! an interleaved linear RGBA float buffer; output is an NV12, P010 or BGRA8
//! payload with ITU-R BT.709 studio-range scaling.

use anyhow::{Result, bail};

use crate::pipeline::types::Resolution;
use crate::settings::GammaMode;

/// NV12 plane pair: full-resolution Y, half-resolution interleaved UV.
#[derive(Debug, Clone)]
pub struct Nv12Planes {
    pub resolution: Resolution,
    pub y: Vec<u8>,
    pub uv: Vec<u8>,
}

impl Nv12Planes {
    /// Flatten into the contiguous Y-then-UV layout encoders expect.
    pub fn collapse(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.y.len() + self.uv.len());
        data.extend_from_slice(&self.y);
        data.extend_from_slice(&self.uv);
        data
    }
}

/// P010 plane pair, 10-bit samples in 16-bit containers.
#[derive(Debug, Clone)]
pub struct P010Planes {
    pub resolution: Resolution,
    pub y: Vec<u16>,
    pub uv: Vec<u16>,
}

impl P010Planes {
    /// Flatten into contiguous little-endian bytes, Y plane then UV plane.
    pub fn collapse(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.y.len() + self.uv.len()) * 2);
        for sample in self.y.iter().chain(self.uv.iter()) {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        data
    }
}

fn clamp_to_byte(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn clamp_to_ten_bit(value: f32) -> u16 {
    value.round().clamp(0.0, 1023.0) as u16
}

/// sRGB transfer function (BT.709 OETF) for a single linear channel in [0, 1].
fn srgb_encode(linear: f32) -> f32 {
    if linear <= 0.003_130_8 {
        linear * 12.92
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

/// Clamp a linear RGBA pixel to [0, 1] and apply the configured gamma.
///
/// Alpha is never gamma-encoded. HDR values above 1.0 clamp rather than wrap.
fn gamma_adjusted(pixel: &[f32], gamma: GammaMode) -> [f32; 4] {
    let r = pixel[0].clamp(0.0, 1.0);
    let g = pixel[1].clamp(0.0, 1.0);
    let b = pixel[2].clamp(0.0, 1.0);
    let a = pixel[3].clamp(0.0, 1.0);

    match gamma {
        GammaMode::Srgb => [srgb_encode(r), srgb_encode(g), srgb_encode(b), a],
        GammaMode::Linear => [r, g, b, a],
    }
}

/// BT.709 luma/chroma from gamma-adjusted RGB.
fn bt709_yuv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let u = -0.1146 * r - 0.3854 * g + 0.5000 * b;
    let v = 0.5000 * r - 0.4542 * g - 0.0458 * b;
    (y, u, v)
}

fn check_dimensions(pixels: &[f32], resolution: Resolution, subsampled: bool) -> Result<usize> {
    if !resolution.is_positive() {
        bail!("non-positive resolution {resolution}");
    }
    if subsampled && !resolution.has_even_dims() {
        bail!("resolution {resolution} not divisible by 2");
    }
    let expected = resolution.pixel_count();
    if pixels.len() != expected * 4 {
        bail!(
            "pixel buffer holds {} components, expected {} for {resolution}",
            pixels.len(),
            expected * 4
        );
    }
    Ok(expected)
}

/// Convert a linear RGBA buffer to NV12 planes.
///
/// Luma is computed per pixel; chroma is 2×2-block-averaged over the
/// per-pixel chroma bytes, so a uniform input collapses to a single repeated
/// (u, v) pair.
pub fn linear_to_nv12(
    pixels: &[f32],
    resolution: Resolution,
    gamma: GammaMode,
) -> Result<Nv12Planes> {
    let pixel_count = check_dimensions(pixels, resolution, true)?;

    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let block_width = width / 2;
    let block_height = height / 2;

    let mut y_plane = vec![0u8; pixel_count];
    let mut u_accum = vec![0.0f32; block_width * block_height];
    let mut v_accum = vec![0.0f32; block_width * block_height];
    let mut samples = vec![0u32; block_width * block_height];

    for row in 0..height {
        for col in 0..width {
            let index = row * width + col;
            let [r, g, b, _a] = gamma_adjusted(&pixels[index * 4..index * 4 + 4], gamma);
            let (y, u, v) = bt709_yuv(r, g, b);

            y_plane[index] = clamp_to_byte(16.0 + 219.0 * y);

            let block = (row / 2) * block_width + col / 2;
            u_accum[block] += clamp_to_byte(128.0 + 224.0 * u) as f32;
            v_accum[block] += clamp_to_byte(128.0 + 224.0 * v) as f32;
            samples[block] += 1;
        }
    }

    let mut uv_plane = vec![0u8; pixel_count / 2];
    for block_row in 0..block_height {
        for block_col in 0..block_width {
            let block = block_row * block_width + block_col;
            let count = samples[block].max(1) as f32;
            let offset = block_row * width + block_col * 2;
            uv_plane[offset] = clamp_to_byte(u_accum[block] / count);
            uv_plane[offset + 1] = clamp_to_byte(v_accum[block] / count);
        }
    }

    Ok(Nv12Planes {
        resolution,
        y: y_plane,
        uv: uv_plane,
    })
}

/// Convert a linear RGBA buffer to P010 planes (10-bit scaling).
pub fn linear_to_p010(
    pixels: &[f32],
    resolution: Resolution,
    gamma: GammaMode,
) -> Result<P010Planes> {
    let pixel_count = check_dimensions(pixels, resolution, true)?;

    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let block_width = width / 2;
    let block_height = height / 2;

    let mut y_plane = vec![0u16; pixel_count];
    let mut u_accum = vec![0.0f32; block_width * block_height];
    let mut v_accum = vec![0.0f32; block_width * block_height];
    let mut samples = vec![0u32; block_width * block_height];

    for row in 0..height {
        for col in 0..width {
            let index = row * width + col;
            let [r, g, b, _a] = gamma_adjusted(&pixels[index * 4..index * 4 + 4], gamma);
            let (y, u, v) = bt709_yuv(r, g, b);

            y_plane[index] = clamp_to_ten_bit(64.0 + 876.0 * y);

            let block = (row / 2) * block_width + col / 2;
            u_accum[block] += clamp_to_ten_bit(512.0 + 896.0 * u) as f32;
            v_accum[block] += clamp_to_ten_bit(512.0 + 896.0 * v) as f32;
            samples[block] += 1;
        }
    }

    let mut uv_plane = vec![0u16; pixel_count / 2];
    for block_row in 0..block_height {
        for block_col in 0..block_width {
            let block = block_row * block_width + block_col;
            let count = samples[block].max(1) as f32;
            let offset = block_row * width + block_col * 2;
            uv_plane[offset] = clamp_to_ten_bit(u_accum[block] / count);
            uv_plane[offset + 1] = clamp_to_ten_bit(v_accum[block] / count);
        }
    }

    Ok(P010Planes {
        resolution,
        y: y_plane,
        uv: uv_plane,
    })
}

/// Convert a linear RGBA buffer to an interleaved BGRA8 payload.
///
/// No chroma subsampling, so odd dimensions are allowed.
pub fn linear_to_bgra(pixels: &[f32], resolution: Resolution, gamma: GammaMode) -> Result<Vec<u8>> {
    let pixel_count = check_dimensions(pixels, resolution, false)?;

    let mut data = vec![0u8; pixel_count * 4];
    for index in 0..pixel_count {
        let [r, g, b, a] = gamma_adjusted(&pixels[index * 4..index * 4 + 4], gamma);
        data[index * 4] = clamp_to_byte(b * 255.0);
        data[index * 4 + 1] = clamp_to_byte(g * 255.0);
        data[index * 4 + 2] = clamp_to_byte(r * 255.0);
        data[index * 4 + 3] = clamp_to_byte(a * 255.0);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(resolution: Resolution, rgba: [f32; 4]) -> Vec<f32> {
        let mut pixels = Vec::with_capacity(resolution.pixel_count() * 4);
        for _ in 0..resolution.pixel_count() {
            pixels.extend_from_slice(&rgba);
        }
        pixels
    }

    #[test]
    fn test_nv12_uniform_collapses() {
        let res = Resolution::new(8, 4);
        let pixels = uniform(res, [0.25, 0.5, 0.75, 1.0]);
        let planes = linear_to_nv12(&pixels, res, GammaMode::Linear).unwrap();

        assert_eq!(planes.y.len(), 32);
        assert_eq!(planes.uv.len(), 16);
        // Uniform input: every 2x2 block averages to the same constant.
        let y0 = planes.y[0];
        assert!(planes.y.iter().all(|&y| y == y0));
        let (u0, v0) = (planes.uv[0], planes.uv[1]);
        for pair in planes.uv.chunks(2) {
            assert_eq!((pair[0], pair[1]), (u0, v0));
        }

        let flat = planes.collapse();
        assert_eq!(flat.len(), 32 + 16);
        assert_eq!(&flat[..32], planes.y.as_slice());
    }

    #[test]
    fn test_nv12_range_bounds() {
        let res = Resolution::new(4, 4);
        // HDR values far above 1.0 and below 0.0 must clamp, never wrap.
        for rgba in [
            [10.0, 10.0, 10.0, 1.0],
            [-3.0, -3.0, -3.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [1.0, 1.0, 1.0, 1.0],
        ] {
            let planes = linear_to_nv12(&uniform(res, rgba), res, GammaMode::Srgb).unwrap();
            for &y in &planes.y {
                assert!((16..=235).contains(&y), "luma {y} out of studio range");
            }
            for &c in &planes.uv {
                assert!((16..=240).contains(&c), "chroma {c} out of studio range");
            }
        }
    }

    #[test]
    fn test_p010_range_bounds() {
        let res = Resolution::new(4, 2);
        let planes =
            linear_to_p010(&uniform(res, [2.0, 2.0, 2.0, 1.0]), res, GammaMode::Srgb).unwrap();
        for &y in &planes.y {
            assert!((64..=940).contains(&y));
        }
        for &c in &planes.uv {
            assert!((64..=960).contains(&c));
        }

        // Collapse is little-endian, Y first.
        let flat = planes.collapse();
        assert_eq!(flat.len(), (planes.y.len() + planes.uv.len()) * 2);
        assert_eq!(u16::from_le_bytes([flat[0], flat[1]]), planes.y[0]);
    }

    #[test]
    fn test_bgra_channel_order() {
        let res = Resolution::new(2, 1);
        let pixels = uniform(res, [1.0, 0.0, 0.0, 1.0]); // pure red
        let data = linear_to_bgra(&pixels, res, GammaMode::Linear).unwrap();
        assert_eq!(&data[..4], &[0, 0, 255, 255]); // B, G, R, A
    }

    #[test]
    fn test_bgra_allows_odd_dims() {
        let res = Resolution::new(3, 1);
        let pixels = uniform(res, [0.5, 0.5, 0.5, 1.0]);
        assert!(linear_to_bgra(&pixels, res, GammaMode::Srgb).is_ok());
    }

    #[test]
    fn test_rejects_bad_input() {
        let res = Resolution::new(3, 2);
        let pixels = uniform(res, [0.0; 4]);
        // Odd width is invalid for subsampled formats.
        assert!(linear_to_nv12(&pixels, res, GammaMode::Linear).is_err());
        assert!(linear_to_p010(&pixels, res, GammaMode::Linear).is_err());

        // Pixel count mismatch.
        let even = Resolution::new(4, 2);
        assert!(linear_to_nv12(&pixels, even, GammaMode::Linear).is_err());
        assert!(linear_to_bgra(&pixels, even, GammaMode::Linear).is_err());

        // Degenerate resolution.
        assert!(linear_to_nv12(&[], Resolution::ZERO, GammaMode::Linear).is_err());
    }

    #[test]
    fn test_srgb_brightens_midtones() {
        let res = Resolution::new(2, 2);
        let pixels = uniform(res, [0.5, 0.5, 0.5, 1.0]);
        let linear = linear_to_nv12(&pixels, res, GammaMode::Linear).unwrap();
        let srgb = linear_to_nv12(&pixels, res, GammaMode::Srgb).unwrap();
        // The sRGB OETF lifts 0.5 to ~0.735, so encoded luma must be higher.
        assert!(srgb.y[0] > linear.y[0]);
    }
}
