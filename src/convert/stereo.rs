//! Stereo pair compositing
//!
//! Joins two equal-resolution eye payloads into one image, either
//! side-by-side (row-interleaved copy, doubling width) or top-bottom
//! (plane concatenation, doubling height).

use anyhow::{Result, bail};

use crate::pipeline::types::Resolution;
use crate::settings::{ColorFormat, StereoLayout};

/// Resolution of the combined image for the given layout.
pub fn combined_resolution(per_eye: Resolution, layout: StereoLayout) -> Resolution {
    match layout {
        StereoLayout::SideBySide => Resolution::new(per_eye.width * 2, per_eye.height),
        StereoLayout::TopBottom => Resolution::new(per_eye.width, per_eye.height * 2),
    }
}

/// Join one plane of each eye row by row (side-by-side) or back to back
/// (top-bottom).
fn join_plane(dst: &mut Vec<u8>, left: &[u8], right: &[u8], row_bytes: usize, layout: StereoLayout) {
    match layout {
        StereoLayout::SideBySide => {
            for (l_row, r_row) in left.chunks(row_bytes).zip(right.chunks(row_bytes)) {
                dst.extend_from_slice(l_row);
                dst.extend_from_slice(r_row);
            }
        }
        StereoLayout::TopBottom => {
            dst.extend_from_slice(left);
            dst.extend_from_slice(right);
        }
    }
}

/// Composite two collapsed per-eye payloads of the given color format.
///
/// `per_eye` is the resolution of each input; both payloads must be exactly
/// the size that format and resolution imply.
pub fn composite_payloads(
    left: &[u8],
    right: &[u8],
    per_eye: Resolution,
    format: ColorFormat,
    layout: StereoLayout,
) -> Result<Vec<u8>> {
    let expected = format.frame_bytes(per_eye);
    if left.len() != expected || right.len() != expected {
        bail!(
            "stereo payload size mismatch: {} / {} bytes, expected {expected} for {per_eye}",
            left.len(),
            right.len()
        );
    }

    let width = per_eye.width as usize;
    let height = per_eye.height as usize;
    let mut combined = Vec::with_capacity(expected * 2);

    match format {
        // Planar 4:2:0: join the Y planes, then the interleaved UV planes.
        ColorFormat::Nv12 => {
            let y_bytes = width * height;
            join_plane(&mut combined, &left[..y_bytes], &right[..y_bytes], width, layout);
            join_plane(&mut combined, &left[y_bytes..], &right[y_bytes..], width, layout);
        }
        ColorFormat::P010 => {
            let y_bytes = width * height * 2;
            let row = width * 2;
            join_plane(&mut combined, &left[..y_bytes], &right[..y_bytes], row, layout);
            join_plane(&mut combined, &left[y_bytes..], &right[y_bytes..], row, layout);
        }
        ColorFormat::Bgra8 => {
            join_plane(&mut combined, left, right, width * 4, layout);
        }
    }

    Ok(combined)
}

/// Composite two per-eye linear RGBA float buffers (PNG path).
///
/// Returns the combined buffer and its resolution.
pub fn composite_linear(
    left: &[f32],
    right: &[f32],
    per_eye: Resolution,
    layout: StereoLayout,
) -> Result<(Vec<f32>, Resolution)> {
    let expected = per_eye.pixel_count() * 4;
    if !per_eye.is_positive() || left.len() != expected || right.len() != expected {
        bail!(
            "stereo pixel buffer mismatch: {} / {} components, expected {expected} for {per_eye}",
            left.len(),
            right.len()
        );
    }

    let row = per_eye.width as usize * 4;
    let mut combined = Vec::with_capacity(expected * 2);
    match layout {
        StereoLayout::SideBySide => {
            for (l_row, r_row) in left.chunks(row).zip(right.chunks(row)) {
                combined.extend_from_slice(l_row);
                combined.extend_from_slice(r_row);
            }
        }
        StereoLayout::TopBottom => {
            combined.extend_from_slice(left);
            combined.extend_from_slice(right);
        }
    }

    Ok((combined, combined_resolution(per_eye, layout)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_resolution() {
        let res = Resolution::new(8, 4);
        assert_eq!(
            combined_resolution(res, StereoLayout::SideBySide),
            Resolution::new(16, 4)
        );
        assert_eq!(
            combined_resolution(res, StereoLayout::TopBottom),
            Resolution::new(8, 8)
        );
    }

    #[test]
    fn test_nv12_side_by_side_rows() {
        let res = Resolution::new(2, 2);
        // Y plane 4 bytes + UV plane 2 bytes per eye.
        let left = vec![1, 2, 3, 4, 10, 11];
        let right = vec![5, 6, 7, 8, 20, 21];
        let combined =
            composite_payloads(&left, &right, res, ColorFormat::Nv12, StereoLayout::SideBySide)
                .unwrap();
        // Rows interleave: L-row0 R-row0 L-row1 R-row1, then UV rows.
        assert_eq!(combined, vec![1, 2, 5, 6, 3, 4, 7, 8, 10, 11, 20, 21]);
    }

    #[test]
    fn test_nv12_top_bottom_concatenates_planes() {
        let res = Resolution::new(2, 2);
        let left = vec![1, 2, 3, 4, 10, 11];
        let right = vec![5, 6, 7, 8, 20, 21];
        let combined =
            composite_payloads(&left, &right, res, ColorFormat::Nv12, StereoLayout::TopBottom)
                .unwrap();
        // Y(L) Y(R) then UV(L) UV(R).
        assert_eq!(combined, vec![1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 20, 21]);
    }

    #[test]
    fn test_p010_doubles_sample_width() {
        let res = Resolution::new(2, 2);
        let bytes = ColorFormat::P010.frame_bytes(res);
        let left = vec![0xAAu8; bytes];
        let right = vec![0xBBu8; bytes];
        let combined =
            composite_payloads(&left, &right, res, ColorFormat::P010, StereoLayout::SideBySide)
                .unwrap();
        assert_eq!(combined.len(), bytes * 2);
        // First row: 4 left bytes (two u16 samples) then 4 right bytes.
        assert_eq!(&combined[..8], &[0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
    }

    #[test]
    fn test_bgra_top_bottom() {
        let res = Resolution::new(1, 2);
        let left = vec![1u8; 8];
        let right = vec![2u8; 8];
        let combined =
            composite_payloads(&left, &right, res, ColorFormat::Bgra8, StereoLayout::TopBottom)
                .unwrap();
        assert_eq!(&combined[..8], &[1u8; 8]);
        assert_eq!(&combined[8..], &[2u8; 8]);
    }

    #[test]
    fn test_linear_composite() {
        let res = Resolution::new(2, 1);
        let left = vec![0.1f32; 8];
        let right = vec![0.9f32; 8];
        let (combined, combined_res) =
            composite_linear(&left, &right, res, StereoLayout::SideBySide).unwrap();
        assert_eq!(combined_res, Resolution::new(4, 1));
        assert_eq!(combined.len(), 16);
        assert_eq!(combined[0], 0.1);
        assert_eq!(combined[8], 0.9);
    }

    #[test]
    fn test_mismatched_sizes_fail() {
        let res = Resolution::new(2, 2);
        let ok = vec![0u8; ColorFormat::Nv12.frame_bytes(res)];
        let short = vec![0u8; 3];
        assert!(
            composite_payloads(&ok, &short, res, ColorFormat::Nv12, StereoLayout::TopBottom)
                .is_err()
        );
        assert!(composite_linear(&[0.0; 4], &[0.0; 16], res, StereoLayout::TopBottom).is_err());
    }
}
