//! Container finalization through an external ffmpeg invocation
//!
//! The muxer never touches pixel data. During the session it collects frame
//! timestamps (for frame-rate inference) and audio duration; at stop time it
//! assembles a declarative ffmpeg command line from the recorded audio file
//! plus either the PNG sequence or the raw/compressed elementary stream, and
//! runs it. Exit code zero is the only success signal; intermediates are
//! deleted only after a confirmed-successful run.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};
use log::{info, warn};
use once_cell::sync::Lazy;

use crate::pipeline::types::{AudioPacket, Frame, Resolution};
use crate::settings::{AudioSettings, CaptureMode, GammaMode, StereoLayout, VideoSettings};

/// ffmpeg resolved from `PATH` once per process.
static FFMPEG_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| which::which("ffmpeg").ok());

const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Metadata describing the encoder's intermediate stream.
#[derive(Debug, Clone)]
pub struct RawVideoSource {
    pub path: PathBuf,
    pub resolution: Resolution,
    pub frame_count: u64,
    pub hevc: bool,
    pub stereo: bool,
    /// True when the file is already a compressed elementary stream
    /// (zero-copy hardware output) rather than back-to-back raw frames.
    pub compressed: bool,
}

/// Combines the session's audio and video intermediates into one container.
pub struct Muxer {
    initialized: bool,
    output_path: PathBuf,
    frames_dir: PathBuf,
    video: VideoSettings,
    audio: AudioSettings,
    frame_timestamps: Vec<f64>,
    frame_count: u64,
    audio_path: Option<PathBuf>,
    audio_duration_seconds: f64,
    video_source: Option<RawVideoSource>,
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            output_path: PathBuf::new(),
            frames_dir: PathBuf::new(),
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            frame_timestamps: Vec::new(),
            frame_count: 0,
            audio_path: None,
            audio_duration_seconds: 0.0,
            video_source: None,
        }
    }

    pub fn initialize(&mut self, output_dir: &Path) {
        self.output_path = output_dir.join("capture.mp4");
        self.frames_dir = output_dir.join("frames");
        self.frame_timestamps.clear();
        self.frame_count = 0;
        self.audio_path = None;
        self.audio_duration_seconds = 0.0;
        self.video_source = None;
        self.initialized = true;
        info!("muxer initialized, output {}", self.output_path.display());
    }

    /// Snapshot the session settings and pick the container.
    ///
    /// MKV carries HEVC and stereo metadata more reliably, so those sessions
    /// switch away from MP4.
    pub fn configure(&mut self, video: VideoSettings, audio: AudioSettings) {
        let prefer_mkv = video.use_hevc || video.capture_mode == CaptureMode::Stereo;
        let container = if prefer_mkv { "capture.mkv" } else { "capture.mp4" };
        if let Some(dir) = self.output_path.parent() {
            self.output_path = dir.join(container);
        }
        self.video = video;
        self.audio = audio;
        self.frame_timestamps.clear();
        self.frame_count = 0;
        self.audio_duration_seconds = 0.0;
        self.video_source = None;
    }

    pub fn is_ffmpeg_available(&self) -> bool {
        FFMPEG_PATH.is_some()
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn frames_directory(&self) -> &Path {
        &self.frames_dir
    }

    /// printf-style pattern the PNG path writes to and ffmpeg reads from.
    pub fn frame_file_pattern(&self) -> PathBuf {
        self.frames_dir.join("frame_%06d.png")
    }

    /// Register a finished frame: either an on-disk PNG or an encoded
    /// payload. The payload is dropped after counting to reclaim memory.
    pub fn add_video_frame(&mut self, frame: &mut Frame) {
        if !self.initialized {
            return;
        }

        if let Some(path) = frame.disk_file_path.as_ref() {
            if !path.exists() {
                warn!("PNG frame missing on disk: {}", path.display());
                return;
            }
            self.frame_timestamps.push(frame.timestamp_seconds);
            self.frame_count += 1;
        } else if frame.encoded_video.as_ref().is_some_and(|e| !e.is_empty()) {
            self.frame_timestamps.push(frame.timestamp_seconds);
            self.frame_count += 1;
            frame.encoded_video = None;
        }
    }

    /// Track the audio timeline; the actual samples live in the recorder.
    pub fn add_audio_samples(&mut self, packet: &AudioPacket) {
        if !self.initialized || packet.pcm_data.is_empty() {
            return;
        }
        self.audio_duration_seconds = self.audio_duration_seconds.max(packet.end_seconds());
    }

    pub fn set_audio_source(&mut self, path: PathBuf, duration_seconds: f64) {
        self.audio_path = Some(path);
        self.audio_duration_seconds = duration_seconds;
    }

    pub fn set_video_source(&mut self, source: RawVideoSource) {
        self.video_source = Some(source);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average frame rate across the captured timestamps, clamped to
    /// [1, 120] fps; 30 fps when there is not enough signal. Averaging over
    /// the whole session smooths frame-pacing jitter instead of trusting
    /// instantaneous deltas.
    pub fn compute_frame_rate(&self) -> f64 {
        if self.frame_timestamps.len() <= 1 {
            return DEFAULT_FRAME_RATE;
        }

        let first = self.frame_timestamps[0];
        let last = *self.frame_timestamps.last().unwrap();
        let duration = last - first;
        if duration <= 1e-6 {
            return DEFAULT_FRAME_RATE;
        }

        let frames = (self.frame_timestamps.len() - 1) as f64;
        (frames / duration).clamp(1.0, 120.0)
    }

    /// Run the finishing strategy for the configured output format.
    ///
    /// Returns `false` on any recoverable failure (nothing captured, missing
    /// intermediates, missing ffmpeg, non-zero exit); intermediate files are
    /// kept in that case for diagnosis.
    pub fn finalize_container(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        match self.video.output_format {
            crate::settings::OutputFormat::PngSequence => self.finalize_png_sequence(),
            crate::settings::OutputFormat::Hardware => self.finalize_stream(),
        }
    }

    fn finalize_png_sequence(&mut self) -> bool {
        if self.frame_count == 0 {
            warn!("no frames were captured - skipping ffmpeg invocation");
            return false;
        }

        let args = self.png_sequence_args();
        match self.invoke_ffmpeg(&args) {
            Ok(()) => {
                info!("muxing complete -> {}", self.output_path.display());
                let _ = std::fs::remove_dir_all(&self.frames_dir);
                true
            }
            Err(err) => {
                warn!("ffmpeg failed ({err}); command: {}", args.join(" "));
                false
            }
        }
    }

    fn finalize_stream(&mut self) -> bool {
        let Some(source) = self.video_source.clone() else {
            warn!("stream finalize requested without a video source");
            return false;
        };
        if !source.path.exists() {
            warn!("raw video file missing: {}", source.path.display());
            return false;
        }
        if !source.resolution.is_positive() {
            warn!("invalid stream resolution {}", source.resolution);
            return false;
        }
        if self.frame_count == 0 {
            warn!("no frames were captured - skipping ffmpeg invocation");
            return false;
        }

        let args = self.stream_args(&source);
        match self.invoke_ffmpeg(&args) {
            Ok(()) => {
                info!("muxing complete -> {}", self.output_path.display());
                let _ = std::fs::remove_file(&source.path);
                true
            }
            Err(err) => {
                warn!("ffmpeg failed ({err}); command: {}", args.join(" "));
                false
            }
        }
    }

    /// Command line for assembling the PNG sequence (always a re-encode).
    fn png_sequence_args(&self) -> Vec<String> {
        let frame_rate = self.compute_frame_rate();
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-framerate".into(),
            format!("{frame_rate:.6}"),
            "-i".into(),
            self.frame_file_pattern().to_string_lossy().into_owned(),
        ];
        self.push_audio_input_args(&mut args);

        if self.video.use_hevc {
            args.extend([
                "-c:v".into(),
                "libx265".into(),
                "-x265-params".into(),
                format!("bitrate={}", self.video.target_bitrate_mbps * 1000),
            ]);
        } else {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-b:v".into(),
                format!("{}k", self.video.target_bitrate_mbps * 1000),
            ]);
        }
        args.extend(["-g".into(), self.video.gop_length.to_string()]);
        args.extend(["-bf".into(), self.video.num_b_frames.to_string()]);
        args.extend(["-pix_fmt".into(), "yuv420p".into()]);

        self.push_metadata_args(&mut args, self.video.is_stereo());
        args.push(self.output_path.to_string_lossy().into_owned());
        args
    }

    /// Command line for remuxing the elementary stream: stream-copy when the
    /// encoder already compressed it, hardware re-encode when it is raw.
    fn stream_args(&self, source: &RawVideoSource) -> Vec<String> {
        let frame_rate = self.compute_frame_rate();
        let mut args: Vec<String> = vec!["-y".into()];

        if source.compressed {
            let demuxer = if source.hevc { "hevc" } else { "h264" };
            args.extend([
                "-f".into(),
                demuxer.into(),
                "-i".into(),
                source.path.to_string_lossy().into_owned(),
            ]);
            self.push_audio_input_args(&mut args);
            args.extend(["-c:v".into(), "copy".into()]);
            args.extend(["-r".into(), format!("{frame_rate:.6}")]);
        } else {
            args.extend([
                "-f".into(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                self.video.color_format.ffmpeg_pix_fmt().into(),
                "-s".into(),
                source.resolution.to_string(),
                "-r".into(),
                format!("{frame_rate:.6}"),
                "-i".into(),
                source.path.to_string_lossy().into_owned(),
            ]);
            self.push_audio_input_args(&mut args);

            let codec = if source.hevc { "hevc_nvenc" } else { "h264_nvenc" };
            args.extend(["-c:v".into(), codec.into()]);
            args.extend([
                "-b:v".into(),
                format!("{}k", self.video.target_bitrate_mbps * 1000),
            ]);
            args.extend(["-g".into(), self.video.gop_length.to_string()]);
            args.extend(["-bf".into(), self.video.num_b_frames.to_string()]);
        }

        self.push_metadata_args(&mut args, source.stereo);
        args.push(self.output_path.to_string_lossy().into_owned());
        args
    }

    fn push_audio_input_args(&self, args: &mut Vec<String>) {
        if let Some(audio) = self.audio_path.as_ref().filter(|p| p.exists()) {
            args.extend([
                "-i".into(),
                audio.to_string_lossy().into_owned(),
                "-c:a".into(),
                "aac".into(),
                "-ar".into(),
                self.audio.sample_rate.to_string(),
                "-ac".into(),
                self.audio.num_channels.to_string(),
            ]);
        }
    }

    /// Stereo/projection/color metadata shared by both finishing strategies.
    fn push_metadata_args(&self, args: &mut Vec<String>, stereo: bool) {
        if stereo {
            let (tag, mode) = match self.video.stereo_layout {
                StereoLayout::SideBySide => ("stereo=left-right", "stereomode=left_right"),
                StereoLayout::TopBottom => ("stereo=top-bottom", "stereomode=top_bottom"),
            };
            args.extend([
                "-metadata:s:v:0".into(),
                tag.into(),
                "-metadata:s:v:0".into(),
                mode.into(),
            ]);
        } else {
            args.extend(["-metadata:s:v:0".into(), "stereo=mono".into()]);
        }

        args.extend([
            "-metadata:s:v:0".into(),
            "projection=equirectangular".into(),
        ]);

        match self.video.gamma {
            GammaMode::Linear => args.extend([
                "-color_primaries".into(),
                "bt2020".into(),
                "-colorspace".into(),
                "bt2020nc".into(),
                "-color_trc".into(),
                "smpte2084".into(),
            ]),
            GammaMode::Srgb => args.extend([
                "-color_primaries".into(),
                "bt709".into(),
                "-colorspace".into(),
                "bt709".into(),
                "-color_trc".into(),
                "bt709".into(),
            ]),
        }
        args.extend(["-color_range".into(), "tv".into()]);

        if self.output_path.extension().is_some_and(|ext| ext == "mp4") {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
    }

    fn invoke_ffmpeg(&self, args: &[String]) -> Result<()> {
        let Some(ffmpeg) = FFMPEG_PATH.as_ref() else {
            bail!("ffmpeg executable not found on PATH");
        };

        info!("invoking {} {}", ffmpeg.display(), args.join(" "));
        let status = Command::new(ffmpeg)
            .args(args)
            .status()
            .map_err(|e| anyhow!("failed to launch ffmpeg: {e}"))?;

        if !status.success() {
            bail!("ffmpeg exited with {status}");
        }
        Ok(())
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}
