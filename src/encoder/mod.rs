//! Video encoder: zero-copy hardware path and CPU conversion path
//!
//! Both paths append to one intermediate file on disk that the muxer
//! consumes after the session:
//!
//! - zero-copy: GPU BGRA8 textures go straight to a host-supplied hardware
//!   session, which returns compressed bitstream packets (`video.h264` /
//!   `video.hevc`);
//! - CPU: linear pixels (or a GPU-preconverted planar payload) are converted
//!   to the configured raw format and appended back to back
//!   (`video_nv12.raw` / `video_p010.raw` / `video_bgra.raw`).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use log::{info, warn};

use crate::convert;
use crate::pipeline::types::{Frame, Resolution, TextureHandle};
use crate::settings::{ColorFormat, VideoSettings};

/// Host-provided hardware encoder session (e.g. an NVENC wrapper).
///
/// The pipeline never talks to encoder hardware directly; it hands opaque
/// texture handles to this seam and gets compressed packets back. Sessions
/// are not assumed reentrant - the encoder serializes all calls.
pub trait HardwareSession: Send {
    /// Apply the session settings (codec, bitrate, GOP, rate control).
    /// Failing here downgrades the encoder to the CPU path.
    fn configure(&mut self, settings: &VideoSettings) -> Result<()>;

    /// Submit one GPU-resident BGRA8 texture, returning the compressed
    /// bitstream produced for it.
    fn encode(
        &mut self,
        texture: TextureHandle,
        resolution: Resolution,
        timestamp_seconds: f64,
    ) -> Result<Bytes>;

    /// Signal end-of-stream so the session can flush delayed frames.
    fn end_stream(&mut self) -> Result<()>;
}

/// Writes encoder-ready video to disk, tracking count/resolution metadata
/// for the muxer. Metadata only advances after a successful whole-payload
/// append, so failed frames never corrupt what gets reported.
pub struct VideoEncoder {
    initialized: bool,
    settings: VideoSettings,
    raw_video_path: PathBuf,
    raw_file: Option<File>,
    hardware: Option<Box<dyn HardwareSession>>,
    zero_copy: bool,
    encoded_frames: u64,
    encoded_resolution: Resolution,
    last_video_pts: f64,
}

impl VideoEncoder {
    pub fn new() -> Self {
        Self {
            initialized: false,
            settings: VideoSettings::default(),
            raw_video_path: PathBuf::new(),
            raw_file: None,
            hardware: None,
            zero_copy: false,
            encoded_frames: 0,
            encoded_resolution: Resolution::ZERO,
            last_video_pts: 0.0,
        }
    }

    /// Set up for a new session. `hardware` is the host's encoder session;
    /// passing `None` keeps a previously supplied session, which is
    /// reconfigured for the new settings. A session that fails to configure
    /// is discarded with a warning and the CPU path takes over.
    pub fn initialize(
        &mut self,
        settings: VideoSettings,
        output_dir: &Path,
        hardware: Option<Box<dyn HardwareSession>>,
    ) -> Result<()> {
        self.initialized = false;
        self.raw_file = None;
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        if settings.color_format == ColorFormat::P010 && !settings.use_hevc {
            warn!("P010 output selected without HEVC - hardware path will fall back to CPU encoding");
        }

        if let Some(session) = hardware {
            self.hardware = Some(session);
        }
        if let Some(session) = self.hardware.as_mut() {
            if let Err(err) = session.configure(&settings) {
                warn!("hardware session rejected configuration ({err}) - reverting to CPU path");
                self.hardware = None;
            }
        }

        self.zero_copy = self.hardware.is_some() && settings.color_format == ColorFormat::Bgra8;
        if self.hardware.is_some() && !self.zero_copy {
            info!(
                "zero-copy disabled for color format {:?}; CPU path will be used",
                settings.color_format
            );
        }

        let file_name = if self.zero_copy {
            if settings.use_hevc { "video.hevc" } else { "video.h264" }
        } else {
            match settings.color_format {
                ColorFormat::Nv12 => "video_nv12.raw",
                ColorFormat::P010 => "video_p010.raw",
                ColorFormat::Bgra8 => "video_bgra.raw",
            }
        };
        self.raw_video_path = output_dir.join(file_name);
        if self.raw_video_path.exists() {
            let _ = std::fs::remove_file(&self.raw_video_path);
        }

        self.settings = settings;
        self.encoded_frames = 0;
        self.encoded_resolution = self.settings.resolution;
        self.last_video_pts = 0.0;
        self.initialized = true;
        Ok(())
    }

    /// Encode one mono (or pre-composited) frame.
    ///
    /// On success the frame's input payloads are cleared, its
    /// `encoded_video` holds the appended bytes and the metadata counters
    /// advance. On failure nothing is written and nothing advances.
    pub fn encode_frame(&mut self, frame: &mut Frame) -> Result<()> {
        if !self.initialized {
            bail!("encoder not initialized");
        }

        if self.zero_copy && frame.texture.is_some() {
            return self.encode_zero_copy(frame);
        }
        if self.zero_copy {
            bail!("zero-copy frame missing GPU texture");
        }

        let payload = self.frame_payload(frame)?;
        self.write_packet(&payload)?;

        frame.encoded_video = Some(Bytes::from(payload));
        frame.clear_payloads();
        frame.stereo = false;
        frame.color_format = self.settings.color_format;
        self.record_success(frame.resolution, frame.timestamp_seconds);
        Ok(())
    }

    /// Encode a left/right pair into one combined frame (the left one).
    ///
    /// The right frame only contributes pixels; its payloads are cleared
    /// either way once the pair has been consumed.
    pub fn encode_stereo_pair(&mut self, left: &mut Frame, right: &mut Frame) -> Result<()> {
        if !self.initialized {
            bail!("encoder not initialized");
        }

        if self.zero_copy && left.texture.is_some() {
            // The GPU already composited both eyes into the left texture.
            self.encode_zero_copy(left)?;
            right.clear_payloads();
            return Ok(());
        }

        if left.resolution != right.resolution {
            bail!(
                "stereo frames have mismatched resolution ({} vs {})",
                left.resolution,
                right.resolution
            );
        }

        let left_payload = self.frame_payload(left)?;
        let right_payload = self.frame_payload(right)?;
        let combined = convert::composite_payloads(
            &left_payload,
            &right_payload,
            left.resolution,
            self.settings.color_format,
            self.settings.stereo_layout,
        )?;
        self.write_packet(&combined)?;

        left.encoded_video = Some(Bytes::from(combined));
        left.clear_payloads();
        right.clear_payloads();
        left.stereo = true;
        left.resolution = convert::combined_resolution(left.resolution, self.settings.stereo_layout);
        left.color_format = self.settings.color_format;
        left.timestamp_seconds = left.timestamp_seconds.min(right.timestamp_seconds);
        self.record_success(left.resolution, left.timestamp_seconds);
        Ok(())
    }

    /// Signal end-of-stream to the hardware and close the output file.
    pub fn flush(&mut self) {
        if let Some(session) = self.hardware.as_mut() {
            if let Err(err) = session.end_stream() {
                warn!("hardware session end-of-stream failed: {err}");
            }
        }
        if let Some(file) = self.raw_file.take() {
            let _ = file.sync_all();
        }
    }

    /// Drop the session state entirely (file handle included).
    pub fn shutdown(&mut self) {
        self.raw_file = None;
        self.hardware = None;
        self.zero_copy = false;
        self.initialized = false;
        self.encoded_frames = 0;
        self.encoded_resolution = Resolution::ZERO;
        self.last_video_pts = 0.0;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether a configured hardware session is attached.
    pub fn has_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    /// Hardware path active and producing a compressed stream.
    pub fn supports_zero_copy(&self) -> bool {
        self.initialized && self.zero_copy
    }

    pub fn raw_video_path(&self) -> &Path {
        &self.raw_video_path
    }

    pub fn encoded_frame_count(&self) -> u64 {
        self.encoded_frames
    }

    pub fn encoded_resolution(&self) -> Resolution {
        self.encoded_resolution
    }

    pub fn last_video_pts(&self) -> f64 {
        self.last_video_pts
    }

    pub fn uses_hevc(&self) -> bool {
        self.settings.use_hevc
    }

    fn encode_zero_copy(&mut self, frame: &mut Frame) -> Result<()> {
        let texture = frame.texture.ok_or_else(|| anyhow!("missing GPU texture"))?;
        let resolution = frame.texture_resolution;
        if !resolution.is_positive() {
            bail!("zero-copy submission with invalid resolution {resolution}");
        }

        let session = self
            .hardware
            .as_mut()
            .ok_or_else(|| anyhow!("no hardware session"))?;
        let payload = session.encode(texture, resolution, frame.timestamp_seconds)?;
        if payload.is_empty() {
            bail!("hardware session returned an empty bitstream");
        }
        self.write_packet(&payload)?;

        frame.encoded_video = Some(payload);
        frame.clear_payloads();
        frame.stereo = self.settings.is_stereo();
        frame.resolution = resolution;
        frame.color_format = self.settings.color_format;
        self.record_success(resolution, frame.timestamp_seconds);
        Ok(())
    }

    /// Raw payload for one eye in the configured color format.
    ///
    /// A GPU-preconverted planar payload of exactly the expected size is
    /// used as-is; anything else falls back to converting the linear
    /// pixels.
    fn frame_payload(&self, frame: &Frame) -> Result<Vec<u8>> {
        let expected = self.settings.color_format.frame_bytes(frame.resolution);
        match self.settings.color_format {
            ColorFormat::Nv12 => {
                if let Some(planar) = frame.planar_video.as_ref().filter(|p| p.len() == expected) {
                    return Ok(planar.clone());
                }
                Ok(convert::linear_to_nv12(
                    &frame.linear_pixels,
                    frame.resolution,
                    self.settings.gamma,
                )?
                .collapse())
            }
            ColorFormat::P010 => {
                if let Some(planar) = frame.planar_video.as_ref().filter(|p| p.len() == expected) {
                    return Ok(planar.clone());
                }
                Ok(convert::linear_to_p010(
                    &frame.linear_pixels,
                    frame.resolution,
                    self.settings.gamma,
                )?
                .collapse())
            }
            ColorFormat::Bgra8 => convert::linear_to_bgra(
                &frame.linear_pixels,
                frame.resolution,
                self.settings.gamma,
            ),
        }
    }

    /// Append one whole payload to the intermediate file.
    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }

        if self.raw_file.is_none() {
            let file = File::create(&self.raw_video_path).with_context(|| {
                format!("failed to open video output {}", self.raw_video_path.display())
            })?;
            self.raw_file = Some(file);
        }

        self.raw_file
            .as_mut()
            .unwrap()
            .write_all(payload)
            .context("failed to append video payload")
    }

    fn record_success(&mut self, resolution: Resolution, timestamp_seconds: f64) {
        self.encoded_frames += 1;
        self.encoded_resolution = resolution;
        self.last_video_pts = timestamp_seconds;
    }
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Eye;
    use crate::settings::{CaptureMode, StereoLayout};

    fn gray_frame(resolution: Resolution, eye: Eye, ts: f64) -> Frame {
        let mut frame = Frame::new(ts, eye, resolution);
        frame.linear_pixels = vec![0.5; resolution.pixel_count() * 4];
        frame
    }

    struct FakeSession {
        configured: bool,
        fail_configure: bool,
        encoded: Vec<(TextureHandle, Resolution)>,
        ended: bool,
    }

    impl FakeSession {
        fn new(fail_configure: bool) -> Self {
            Self {
                configured: false,
                fail_configure,
                encoded: Vec::new(),
                ended: false,
            }
        }
    }

    impl HardwareSession for FakeSession {
        fn configure(&mut self, _settings: &VideoSettings) -> Result<()> {
            if self.fail_configure {
                bail!("unsupported");
            }
            self.configured = true;
            Ok(())
        }

        fn encode(
            &mut self,
            texture: TextureHandle,
            resolution: Resolution,
            _timestamp_seconds: f64,
        ) -> Result<Bytes> {
            self.encoded.push((texture, resolution));
            Ok(Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA]))
        }

        fn end_stream(&mut self) -> Result<()> {
            self.ended = true;
            Ok(())
        }
    }

    fn cpu_settings(resolution: Resolution) -> VideoSettings {
        VideoSettings {
            resolution,
            color_format: ColorFormat::Nv12,
            ..VideoSettings::default()
        }
    }

    #[test]
    fn test_cpu_mono_encode_appends_raw() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resolution::new(8, 4);
        let mut encoder = VideoEncoder::new();
        encoder.initialize(cpu_settings(res), dir.path(), None).unwrap();
        assert!(!encoder.supports_zero_copy());

        let mut frame = gray_frame(res, Eye::Left, 0.1);
        encoder.encode_frame(&mut frame).unwrap();
        let mut frame2 = gray_frame(res, Eye::Left, 0.2);
        encoder.encode_frame(&mut frame2).unwrap();
        encoder.flush();

        let bytes = std::fs::read(encoder.raw_video_path()).unwrap();
        assert_eq!(bytes.len(), ColorFormat::Nv12.frame_bytes(res) * 2);
        assert_eq!(encoder.encoded_frame_count(), 2);
        assert_eq!(encoder.encoded_resolution(), res);
        assert_eq!(encoder.last_video_pts(), 0.2);
        assert!(frame.linear_pixels.is_empty());
        assert!(frame.encoded_video.is_some());
    }

    #[test]
    fn test_planar_payload_reused() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resolution::new(4, 2);
        let mut encoder = VideoEncoder::new();
        encoder.initialize(cpu_settings(res), dir.path(), None).unwrap();

        let mut frame = Frame::new(0.0, Eye::Left, res);
        frame.planar_video = Some(vec![0x7F; ColorFormat::Nv12.frame_bytes(res)]);
        encoder.encode_frame(&mut frame).unwrap();
        encoder.flush();

        let bytes = std::fs::read(encoder.raw_video_path()).unwrap();
        assert!(bytes.iter().all(|&b| b == 0x7F));
    }

    #[test]
    fn test_cpu_stereo_pair_combines() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resolution::new(8, 4);
        let settings = VideoSettings {
            capture_mode: CaptureMode::Stereo,
            stereo_layout: StereoLayout::TopBottom,
            ..cpu_settings(res)
        };
        let mut encoder = VideoEncoder::new();
        encoder.initialize(settings, dir.path(), None).unwrap();

        let mut left = gray_frame(res, Eye::Left, 0.3);
        let mut right = gray_frame(res, Eye::Right, 0.25);
        encoder.encode_stereo_pair(&mut left, &mut right).unwrap();
        encoder.flush();

        assert!(left.stereo);
        assert_eq!(left.resolution, Resolution::new(8, 8));
        // Combined timestamp is the earlier of the pair.
        assert_eq!(left.timestamp_seconds, 0.25);
        assert!(right.linear_pixels.is_empty());

        let bytes = std::fs::read(encoder.raw_video_path()).unwrap();
        assert_eq!(bytes.len(), ColorFormat::Nv12.frame_bytes(res) * 2);
    }

    #[test]
    fn test_stereo_resolution_mismatch_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resolution::new(8, 4);
        let mut encoder = VideoEncoder::new();
        encoder.initialize(cpu_settings(res), dir.path(), None).unwrap();

        let mut left = gray_frame(res, Eye::Left, 0.0);
        let mut right = gray_frame(Resolution::new(4, 4), Eye::Right, 0.0);
        assert!(encoder.encode_stereo_pair(&mut left, &mut right).is_err());
        assert_eq!(encoder.encoded_frame_count(), 0);
        assert!(!encoder.raw_video_path().exists());
    }

    #[test]
    fn test_zero_copy_requires_bgra() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = VideoEncoder::new();
        // NV12 + hardware session: session kept, zero-copy off.
        encoder
            .initialize(
                cpu_settings(Resolution::new(8, 4)),
                dir.path(),
                Some(Box::new(FakeSession::new(false))),
            )
            .unwrap();
        assert!(encoder.has_hardware());
        assert!(!encoder.supports_zero_copy());
    }

    #[test]
    fn test_zero_copy_encode() {
        let dir = tempfile::tempdir().unwrap();
        let res = Resolution::new(8, 4);
        let settings = VideoSettings {
            color_format: ColorFormat::Bgra8,
            ..cpu_settings(res)
        };
        let mut encoder = VideoEncoder::new();
        encoder
            .initialize(settings, dir.path(), Some(Box::new(FakeSession::new(false))))
            .unwrap();
        assert!(encoder.supports_zero_copy());
        assert!(encoder.raw_video_path().ends_with("video.hevc"));

        let mut frame = Frame::new(0.5, Eye::Left, res);
        frame.texture = Some(TextureHandle(42));
        frame.texture_resolution = res;
        encoder.encode_frame(&mut frame).unwrap();
        encoder.flush();

        assert_eq!(encoder.encoded_frame_count(), 1);
        assert_eq!(frame.encoded_video.as_ref().unwrap().len(), 6);
        let bytes = std::fs::read(encoder.raw_video_path()).unwrap();
        assert_eq!(bytes.len(), 6);

        // A zero-copy frame without its texture is rejected.
        let mut bad = Frame::new(0.6, Eye::Left, res);
        assert!(encoder.encode_frame(&mut bad).is_err());
        assert_eq!(encoder.encoded_frame_count(), 1);
    }

    #[test]
    fn test_failed_configure_falls_back_to_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let settings = VideoSettings {
            color_format: ColorFormat::Bgra8,
            ..cpu_settings(Resolution::new(4, 2))
        };
        let mut encoder = VideoEncoder::new();
        encoder
            .initialize(settings, dir.path(), Some(Box::new(FakeSession::new(true))))
            .unwrap();
        assert!(!encoder.has_hardware());
        assert!(!encoder.supports_zero_copy());
        assert!(encoder.raw_video_path().ends_with("video_bgra.raw"));
    }
}
