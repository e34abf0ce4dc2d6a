//! Capture session configuration
//!
//! Settings are plain value snapshots: the manager copies them at
//! `start_capture` time, so mutating a settings source mid-session is never
//! observed until the next session.

use serde::{Deserialize, Serialize};

use crate::pipeline::types::Resolution;

/// Mono or stereo (per-eye) capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureMode {
    Mono,
    Stereo,
}

/// What the pipeline produces on disk before muxing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// One 16-bit PNG per frame, assembled by the muxer afterwards.
    PngSequence,
    /// Raw or hardware-compressed elementary stream written by the encoder.
    Hardware,
}

/// Gamma handling applied during color conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GammaMode {
    /// Apply the sRGB transfer function (BT.709 OETF) before quantizing.
    Srgb,
    /// Pass linear values through, clamped to [0, 1].
    Linear,
}

/// Layout used when compositing a stereo pair into one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StereoLayout {
    TopBottom,
    SideBySide,
}

/// Rate-control preset forwarded to the hardware encoder session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateControlPreset {
    Default,
    LowLatency,
    HighQuality,
}

/// Pixel format of the encoder-ready payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    /// 8-bit 4:2:0, full-res Y plane followed by interleaved UV.
    Nv12,
    /// 10-bit 4:2:0 in 16-bit little-endian containers.
    P010,
    /// 8-bit interleaved B, G, R, A.
    Bgra8,
}

impl ColorFormat {
    /// ffmpeg `-pix_fmt` name for the raw-video demuxer.
    pub fn ffmpeg_pix_fmt(&self) -> &'static str {
        match self {
            ColorFormat::Nv12 => "nv12",
            ColorFormat::P010 => "p010le",
            ColorFormat::Bgra8 => "bgra",
        }
    }

    /// Size in bytes of one frame at the given resolution.
    pub fn frame_bytes(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixel_count();
        match self {
            ColorFormat::Nv12 => pixels + pixels / 2,
            ColorFormat::P010 => (pixels + pixels / 2) * 2,
            ColorFormat::Bgra8 => pixels * 4,
        }
    }
}

/// Video side of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSettings {
    /// Per-eye equirect output resolution.
    pub resolution: Resolution,
    pub target_bitrate_mbps: u32,
    pub gop_length: u32,
    pub num_b_frames: u32,
    pub use_hevc: bool,
    pub output_format: OutputFormat,
    pub capture_mode: CaptureMode,
    pub gamma: GammaMode,
    pub color_format: ColorFormat,
    /// Layout for stereo output when `capture_mode` is `Stereo`.
    pub stereo_layout: StereoLayout,
    /// Texels to shrink cubemap sampling by to hide face seams.
    pub seam_fix_texels: f32,
    pub rate_control_preset: RateControlPreset,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(4096, 2048),
            target_bitrate_mbps: 80,
            gop_length: 30,
            num_b_frames: 2,
            use_hevc: true,
            output_format: OutputFormat::Hardware,
            capture_mode: CaptureMode::Mono,
            gamma: GammaMode::Srgb,
            color_format: ColorFormat::Nv12,
            stereo_layout: StereoLayout::TopBottom,
            seam_fix_texels: 1.0,
            rate_control_preset: RateControlPreset::Default,
        }
    }
}

impl VideoSettings {
    pub fn is_stereo(&self) -> bool {
        self.capture_mode == CaptureMode::Stereo
    }
}

/// Audio side of a capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub num_channels: u16,
    pub capture_audio: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            num_channels: 2,
            capture_audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let res = Resolution::new(16, 8);
        assert_eq!(ColorFormat::Nv12.frame_bytes(res), 128 + 64);
        assert_eq!(ColorFormat::P010.frame_bytes(res), (128 + 64) * 2);
        assert_eq!(ColorFormat::Bgra8.frame_bytes(res), 128 * 4);
    }

    #[test]
    fn test_defaults() {
        let video = VideoSettings::default();
        assert_eq!(video.resolution, Resolution::new(4096, 2048));
        assert!(video.use_hevc);
        assert!(!video.is_stereo());

        let audio = AudioSettings::default();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.num_channels, 2);
        assert!(audio.capture_audio);
    }
}
