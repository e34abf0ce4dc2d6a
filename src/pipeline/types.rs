//! Core types for the capture pipeline

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::settings::{ColorFormat, VideoSettings};

/// Width × height of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const ZERO: Resolution = Resolution { width: 0, height: 0 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_positive(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// 4:2:0 subsampling requires both dimensions divisible by two.
    pub fn has_even_dims(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which eye a frame belongs to. `Left` doubles as the mono eye.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub fn index(&self) -> u32 {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

/// Opaque handle to a GPU-resident texture owned by the host renderer.
///
/// The pipeline never dereferences it; it only forwards the handle to a
/// hardware encoder session for zero-copy submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle(pub u64);

/// One rendered eye-view at one capture instant.
///
/// Created by the renderer collaborator, owned exclusively by its queue slot
/// until the worker dequeues it. The worker mutates it in place (stripping
/// `linear_pixels` once consumed) and hands it to the muxer, which reads
/// metadata only.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Presentation timestamp relative to capture start (seconds).
    pub timestamp_seconds: f64,
    pub eye: Eye,
    pub stereo: bool,
    pub resolution: Resolution,

    /// Linear HDR pixels read back from the GPU, interleaved RGBA with four
    /// `f32` components per pixel (decoded from the RGBA16F render target).
    pub linear_pixels: Vec<f32>,

    /// Optional planar payload pre-converted on the GPU (NV12/P010).
    pub planar_video: Option<Vec<u8>>,

    /// Compressed elementary-stream payload once hardware-encoded.
    pub encoded_video: Option<Bytes>,

    /// Location of the intermediate file once persisted as an image.
    pub disk_file_path: Option<PathBuf>,

    /// GPU texture prepared for zero-copy submission (BGRA8).
    pub texture: Option<TextureHandle>,

    /// Resolution of the zero-copy texture. May differ from the float
    /// equirect target in stereo mode.
    pub texture_resolution: Resolution,

    /// Color format used when producing `planar_video`/`encoded_video`.
    pub color_format: ColorFormat,
}

impl Frame {
    pub fn new(timestamp_seconds: f64, eye: Eye, resolution: Resolution) -> Self {
        Self {
            timestamp_seconds,
            eye,
            stereo: false,
            resolution,
            linear_pixels: Vec::new(),
            planar_video: None,
            encoded_video: None,
            disk_file_path: None,
            texture: None,
            texture_resolution: Resolution::ZERO,
            color_format: ColorFormat::Nv12,
        }
    }

    /// Drops every input pixel payload, keeping only metadata.
    pub fn clear_payloads(&mut self) {
        self.linear_pixels = Vec::new();
        self.planar_video = None;
    }
}

/// One block of captured PCM audio.
#[derive(Debug, Clone, Default)]
pub struct AudioPacket {
    /// Presentation timestamp anchored to the start of the capture session.
    pub timestamp_seconds: f64,
    pub num_channels: u16,
    pub sample_rate: u32,
    /// Interleaved little-endian 16-bit samples.
    pub pcm_data: Vec<u8>,
}

impl AudioPacket {
    /// Payload length converted into seconds; zero for degenerate packets.
    pub fn duration_seconds(&self) -> f64 {
        let bytes_per_frame = self.num_channels as usize * 2;
        if bytes_per_frame == 0 || self.sample_rate == 0 || self.pcm_data.is_empty() {
            return 0.0;
        }

        let frame_count = self.pcm_data.len() / bytes_per_frame;
        frame_count as f64 / self.sample_rate as f64
    }

    /// PTS of the instant just past the last sample.
    pub fn end_seconds(&self) -> f64 {
        self.timestamp_seconds + self.duration_seconds()
    }
}

/// Point-in-time snapshot of the capture session.
///
/// Mutated exclusively by the manager under its status lock; observers get
/// copies. There is no identity beyond "latest snapshot".
#[derive(Debug, Clone)]
pub struct CaptureStatus {
    pub capturing: bool,
    pub pending_frames: usize,
    pub dropped_frames: u64,
    pub capture_time_seconds: f64,
    /// Last video presentation timestamp relative to capture start (seconds).
    pub last_video_pts: f64,
    /// Last audio presentation timestamp relative to capture start (seconds).
    pub last_audio_pts: f64,
    /// Frame queue fill ratio (0-1).
    pub ring_fill: f32,
    /// True when the hardware encoder path is active.
    pub hardware_active: bool,
    /// True when capture fell back to a safer configuration after preflight.
    pub fallback_active: bool,
    /// True when the session requested zero-copy hardware submission.
    pub zero_copy_requested: bool,
    /// True when zero-copy submission is active.
    pub zero_copy_active: bool,
    /// Diagnostic string describing the zero-copy decision.
    pub zero_copy_diagnostic: String,
    /// Accumulated warning text surfaced to the host.
    pub warnings: String,
    /// Effective video settings after preflight/fallback adjustments.
    pub effective_video: VideoSettings,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self {
            capturing: false,
            pending_frames: 0,
            dropped_frames: 0,
            capture_time_seconds: 0.0,
            last_video_pts: 0.0,
            last_audio_pts: 0.0,
            ring_fill: 0.0,
            hardware_active: false,
            fallback_active: false,
            zero_copy_requested: false,
            zero_copy_active: false,
            zero_copy_diagnostic: String::new(),
            warnings: String::new(),
            effective_video: VideoSettings::default(),
        }
    }
}
