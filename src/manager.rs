//! Capture manager
//!
//! Owns the renderer collaborator, audio recorder, frame queue, video
//! encoder and muxer, and coordinates their three clocks: the host tick
//! that requests frames, the render completion callback that enqueues them,
//! and the background worker that drains the queue into the PNG or encoder
//! path. Audio arrives on its own callback thread and is merged once per
//! tick.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use crate::capture::audio::AudioRecorder;
use crate::capture::renderer::SceneRenderer;
use crate::convert;
use crate::encoder::{HardwareSession, VideoEncoder};
use crate::mux::{Muxer, RawVideoSource};
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::state::CaptureState;
use crate::pipeline::types::{AudioPacket, CaptureStatus, Eye, Frame, Resolution};
use crate::settings::{AudioSettings, ColorFormat, OutputFormat, VideoSettings};
use crate::utils::{WorkerSignal, disk};

/// Observer notified after every status mutation. Implementations must be
/// cheap and non-blocking; notifications are best-effort.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, status: &CaptureStatus);
}

/// Per-session configuration snapshot handed to the worker.
#[derive(Clone)]
struct SessionConfig {
    video: VideoSettings,
    frames_dir: PathBuf,
    /// Frozen at start so the tick path never contends on the encoder lock.
    zero_copy: bool,
}

/// State shared between the manager, the render-side enqueue callback and
/// the worker thread.
struct PipelineShared {
    queue: FrameQueue,
    status: Mutex<CaptureStatus>,
    encoder: Mutex<VideoEncoder>,
    muxer: Mutex<Muxer>,
    signal: WorkerSignal,
    observer: Mutex<Option<Arc<dyn StatusSink>>>,
    frame_counter: AtomicU64,
}

/// Orchestrates a capture session: `Uninitialized → Idle → Capturing → Idle
/// (→ ShutDown)`.
///
/// The host drives it through `initialize`, `tick` (once per rendered
/// frame), `start_capture`/`stop_capture` and `shutdown`; nothing registers
/// itself globally.
pub struct CaptureManager {
    state: CaptureState,
    video_settings: VideoSettings,
    audio_settings: AudioSettings,
    effective_video: VideoSettings,
    output_dir: PathBuf,
    renderer: Option<Box<dyn SceneRenderer>>,
    audio: Option<AudioRecorder>,
    shared: Arc<PipelineShared>,
    worker: Option<thread::JoinHandle<()>>,
    session: Option<SessionConfig>,
    sync_pending_left: Option<Frame>,
    capture_start: Option<Instant>,
    warnings: String,
    fallen_back: bool,
}

impl CaptureManager {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Uninitialized,
            video_settings: VideoSettings::default(),
            audio_settings: AudioSettings::default(),
            effective_video: VideoSettings::default(),
            output_dir: PathBuf::new(),
            renderer: None,
            audio: None,
            shared: Arc::new(PipelineShared {
                queue: FrameQueue::default(),
                status: Mutex::new(CaptureStatus::default()),
                encoder: Mutex::new(VideoEncoder::new()),
                muxer: Mutex::new(Muxer::new()),
                signal: WorkerSignal::new(),
                observer: Mutex::new(None),
                frame_counter: AtomicU64::new(0),
            }),
            worker: None,
            session: None,
            sync_pending_left: None,
            capture_start: None,
            warnings: String::new(),
            fallen_back: false,
        }
    }

    /// Wire up the subsystems in dependency order (renderer, audio, encoder,
    /// muxer) against a timestamped session directory under `output_root`.
    ///
    /// `hardware` is the host's encoder session for the zero-copy path, if
    /// it has one. Idempotent while initialized.
    pub fn initialize(
        &mut self,
        renderer: Box<dyn SceneRenderer>,
        hardware: Option<Box<dyn HardwareSession>>,
        video: VideoSettings,
        audio: AudioSettings,
        output_root: &Path,
        observer: Option<Arc<dyn StatusSink>>,
    ) -> Result<()> {
        if self.state.is_initialized() {
            return Ok(());
        }
        if !self.state.can_transition_to(&CaptureState::Idle) {
            bail!("capture manager has been shut down");
        }

        let session_name = format!("capture_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let output_dir = output_root.join(session_name);
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        self.renderer = Some(renderer);
        self.audio = Some(AudioRecorder::new(audio.clone(), &output_dir));

        self.shared
            .encoder
            .lock()
            .unwrap()
            .initialize(video.clone(), &output_dir, hardware)?;
        {
            let mut muxer = self.shared.muxer.lock().unwrap();
            muxer.initialize(&output_dir);
            muxer.configure(video.clone(), audio.clone());
        }
        *self.shared.observer.lock().unwrap() = observer;

        self.video_settings = video.clone();
        self.effective_video = video;
        self.audio_settings = audio;
        self.output_dir = output_dir;
        self.state = CaptureState::Idle;
        self.reset_status();
        info!("capture manager initialized, output {}", self.output_dir.display());
        Ok(())
    }

    /// Begin a capture session. No-op while one is already running.
    pub fn start_capture(&mut self) {
        if !self.state.is_initialized() {
            warn!("start_capture called before initialize");
            return;
        }
        if self.state.is_capturing() {
            return;
        }

        self.warnings.clear();
        self.fallen_back = false;
        self.run_preflight_checks();

        // Rebuild the encoder and muxer against the effective settings; a
        // preflight fallback may have changed the output format.
        let encoder_init = self.shared.encoder.lock().unwrap().initialize(
            self.effective_video.clone(),
            &self.output_dir,
            None,
        );
        if let Err(err) = encoder_init {
            self.push_warning(&format!("encoder re-initialization failed: {err}"));
        }
        self.shared
            .muxer
            .lock()
            .unwrap()
            .configure(self.effective_video.clone(), self.audio_settings.clone());

        self.shared.queue.reset();
        self.shared.signal.reset();
        self.shared.frame_counter.store(0, Ordering::Relaxed);
        self.sync_pending_left = None;

        let started_at = Instant::now();
        self.capture_start = Some(started_at);

        let frames_dir = self
            .shared
            .muxer
            .lock()
            .unwrap()
            .frames_directory()
            .to_path_buf();
        let zero_copy = self.shared.encoder.lock().unwrap().supports_zero_copy();
        let session = SessionConfig {
            video: self.effective_video.clone(),
            frames_dir,
            zero_copy,
        };
        self.session = Some(session.clone());

        self.reset_status();
        self.spawn_worker(session);

        if let Some(audio) = self.audio.as_mut() {
            audio.set_capture_start(started_at);
            audio.start_recording();
        }

        self.state = CaptureState::Capturing { started_at };
        {
            let mut status = self.shared.status.lock().unwrap();
            status.capturing = true;
            status.capture_time_seconds = 0.0;
        }
        notify_status(&self.shared);
        info!("capture started ({})", self.effective_video.resolution);
    }

    /// End the session: drain audio, join the worker (which drains the
    /// queue first), flush the encoder and finalize the container.
    ///
    /// This is the one deliberately blocking teardown in the pipeline.
    pub fn stop_capture(&mut self) {
        if !self.state.is_capturing() {
            return;
        }

        if let Some(audio) = self.audio.as_mut() {
            audio.stop_recording();
            let packets = audio.consume_packets();
            merge_audio_packets(&self.shared, &packets);
            audio.finalize_wave_file();

            let wave_path = audio.wave_file_path().to_path_buf();
            if wave_path.exists() {
                self.shared
                    .muxer
                    .lock()
                    .unwrap()
                    .set_audio_source(wave_path, audio.recording_duration_seconds());
            }
        }

        // Graceful drain: the worker empties the queue once more before it
        // exits, so captured-but-unprocessed frames are never lost.
        self.shared.signal.request_stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(session) = self.session.as_ref() {
            process_queued_frames(&self.shared, session, &mut self.sync_pending_left);
        }
        if self.sync_pending_left.take().is_some() {
            warn!("unmatched stereo left frame dropped at stop");
        }

        {
            let mut encoder = self.shared.encoder.lock().unwrap();
            encoder.flush();
            if self
                .session
                .as_ref()
                .is_some_and(|s| s.video.output_format == OutputFormat::Hardware)
            {
                let source = RawVideoSource {
                    path: encoder.raw_video_path().to_path_buf(),
                    resolution: encoder.encoded_resolution(),
                    frame_count: encoder.encoded_frame_count(),
                    hevc: encoder.uses_hevc(),
                    stereo: self.effective_video.is_stereo(),
                    compressed: encoder.supports_zero_copy(),
                };
                self.shared.muxer.lock().unwrap().set_video_source(source);
            }
        }

        if !self.shared.muxer.lock().unwrap().finalize_container() {
            self.push_warning("container finalization failed - intermediate files kept");
        }

        self.session = None;
        self.capture_start = None;
        self.state = CaptureState::Idle;
        {
            let mut status = self.shared.status.lock().unwrap();
            status.capturing = false;
        }
        notify_status(&self.shared);
        info!("capture stopped");
    }

    /// Per-tick driver, called by the host once per rendered frame.
    pub fn tick(&mut self, _delta_seconds: f64) {
        if !self.state.is_capturing() {
            return;
        }

        let elapsed = self
            .capture_start
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        {
            let mut status = self.shared.status.lock().unwrap();
            status.capture_time_seconds = elapsed;
        }

        // Merge audio captured since the previous tick; this only copies
        // already-delivered packets and never blocks on the audio hardware.
        if let Some(audio) = self.audio.as_ref() {
            let packets = audio.consume_packets();
            merge_audio_packets(&self.shared, &packets);
        }

        let (video, zero_copy) = match self.session.as_ref() {
            Some(session) => (session.video.clone(), session.zero_copy),
            None => (self.effective_video.clone(), false),
        };
        if let Some(renderer) = self.renderer.as_mut() {
            let shared = Arc::clone(&self.shared);
            renderer.capture_frame(&video, elapsed, zero_copy, &mut |frame| {
                // A full queue drops the incoming frame; the counter is the
                // only backpressure signal and the producer never stalls.
                if shared.queue.enqueue(frame) {
                    shared.signal.notify_work();
                }
            });
        }

        // Without a worker thread the queue is drained synchronously here.
        if self.worker.is_none() {
            if let Some(session) = self.session.as_ref() {
                process_queued_frames(&self.shared, session, &mut self.sync_pending_left);
            }
        }

        notify_status(&self.shared);
    }

    /// Tear everything down in reverse dependency order. The manager is
    /// unusable afterwards.
    pub fn shutdown(&mut self) {
        if self.state == CaptureState::ShutDown {
            return;
        }
        if self.state.is_capturing() {
            self.stop_capture();
        }

        if let Some(mut audio) = self.audio.take() {
            audio.shutdown();
        }
        self.shared.encoder.lock().unwrap().shutdown();
        self.renderer = None;
        self.session = None;
        self.state = CaptureState::ShutDown;
        info!("capture manager shut down");
    }

    /// Pull-based copy of the latest status snapshot.
    pub fn get_status(&self) -> CaptureStatus {
        self.shared.status.lock().unwrap().clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.state.is_capturing()
    }

    pub fn ring_buffer_capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn ring_buffer_occupancy(&self) -> usize {
        self.shared.queue.len()
    }

    /// Session output directory (WAV, intermediates, final container).
    pub fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    /// Access to the audio recorder so hosts with their own mix can push
    /// buffers directly.
    pub fn audio_recorder(&self) -> Option<&AudioRecorder> {
        self.audio.as_ref()
    }

    /// Non-fatal environment checks run at capture start. Each failure
    /// records a warning; an unavailable hardware encoder additionally
    /// rewrites the effective output format to the PNG fallback.
    fn run_preflight_checks(&mut self) {
        let mut effective = self.video_settings.clone();

        if effective.output_format == OutputFormat::Hardware {
            let hardware_ready = {
                let encoder = self.shared.encoder.lock().unwrap();
                encoder.is_initialized() && encoder.has_hardware()
            };
            if !hardware_ready {
                self.push_warning("hardware encoder unavailable - reverting to PNG sequence");
                effective.output_format = OutputFormat::PngSequence;
                self.fallen_back = true;
            }
        }

        if !self.shared.muxer.lock().unwrap().is_ffmpeg_available() {
            self.push_warning("ffmpeg executable missing - automatic muxing will be skipped");
        }

        match disk::available_space(&self.output_dir) {
            Some(free) if free < disk::MIN_FREE_BYTES => {
                let free_gib = free as f64 / (1024.0 * 1024.0 * 1024.0);
                self.push_warning(&format!("low disk space ({free_gib:.2} GiB remaining)"));
            }
            None => {
                self.push_warning("unable to query disk free space; proceeding with caution");
            }
            _ => {}
        }

        self.effective_video = effective;
    }

    /// Start the background worker. Thread-spawn failure degrades to
    /// synchronous per-tick draining, transparently to callers.
    fn spawn_worker(&mut self, session: SessionConfig) {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("panorec-frame-worker".into())
            .spawn(move || {
                let mut pending_left: Option<Frame> = None;
                loop {
                    shared.signal.wait();
                    process_queued_frames(&shared, &session, &mut pending_left);
                    if shared.signal.stop_requested() {
                        // One final drain so a frame enqueued between the
                        // last pass and the stop request is not lost.
                        process_queued_frames(&shared, &session, &mut pending_left);
                        break;
                    }
                }
                if pending_left.is_some() {
                    warn!("unmatched stereo left frame dropped at worker exit");
                }
            });

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => {
                warn!("failed to spawn frame worker ({err}) - falling back to synchronous processing");
                self.worker = None;
            }
        }
    }

    fn push_warning(&mut self, message: &str) {
        warn!("{message}");
        if !self.warnings.is_empty() {
            self.warnings.push('\n');
        }
        self.warnings.push_str(message);
        self.shared.status.lock().unwrap().warnings = self.warnings.clone();
    }

    /// Rebuild the status snapshot from scratch for the current settings.
    fn reset_status(&self) {
        let encoder = self.shared.encoder.lock().unwrap();
        let zero_copy_requested = self.video_settings.output_format == OutputFormat::Hardware
            && self.video_settings.color_format == ColorFormat::Bgra8;
        let zero_copy_active = encoder.supports_zero_copy();
        let diagnostic = if zero_copy_active {
            "zero-copy hardware submission active".to_string()
        } else if zero_copy_requested {
            "zero-copy unavailable - CPU conversion in use".to_string()
        } else {
            String::new()
        };

        let mut status = self.shared.status.lock().unwrap();
        *status = CaptureStatus {
            hardware_active: self.effective_video.output_format == OutputFormat::Hardware
                && encoder.has_hardware(),
            fallback_active: self.fallen_back,
            zero_copy_requested,
            zero_copy_active,
            zero_copy_diagnostic: diagnostic,
            warnings: self.warnings.clone(),
            effective_video: self.effective_video.clone(),
            pending_frames: self.shared.queue.len(),
            dropped_frames: self.shared.queue.dropped(),
            ring_fill: self.shared.queue.fill_ratio(),
            ..CaptureStatus::default()
        };
    }
}

impl Default for CaptureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        // Make sure the worker is not left waiting on a dead signal.
        self.shared.signal.request_stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Drain the frame queue to exhaustion, routing each frame through the PNG
/// or encoder path. Shared by the worker thread and the synchronous
/// fallback.
fn process_queued_frames(
    shared: &PipelineShared,
    session: &SessionConfig,
    pending_left: &mut Option<Frame>,
) {
    while let Some(frame) = shared.queue.dequeue() {
        let result = match session.video.output_format {
            OutputFormat::PngSequence => handle_png_frame(shared, session, pending_left, frame),
            OutputFormat::Hardware => handle_encoder_frame(shared, session, pending_left, frame),
        };
        if let Err(err) = result {
            warn!("frame processing failed: {err}");
        }
        update_status_after_video(shared, None);
    }
}

/// PNG-sequence path: stereo frames are paired and composited before one
/// 16-bit PNG per capture instant is written.
fn handle_png_frame(
    shared: &PipelineShared,
    session: &SessionConfig,
    pending_left: &mut Option<Frame>,
    frame: Frame,
) -> Result<()> {
    if session.video.is_stereo() {
        match frame.eye {
            Eye::Left => {
                if pending_left.replace(frame).is_some() {
                    warn!("left eye frame arrived with a pair still pending - dropping the stale frame");
                }
                return Ok(());
            }
            Eye::Right => {
                let Some(mut left) = pending_left.take() else {
                    warn!("right eye frame without a pending left - dropping");
                    return Ok(());
                };
                if left.resolution != frame.resolution
                    || left.linear_pixels.is_empty()
                    || frame.linear_pixels.is_empty()
                {
                    warn!("stereo frame mismatch - skipping pair");
                    return Ok(());
                }

                let (combined, combined_res) = convert::composite_linear(
                    &left.linear_pixels,
                    &frame.linear_pixels,
                    left.resolution,
                    session.video.stereo_layout,
                )?;
                left.linear_pixels = combined;
                left.resolution = combined_res;
                left.stereo = true;
                return save_png_frame(shared, session, left);
            }
        }
    }

    save_png_frame(shared, session, frame)
}

fn save_png_frame(shared: &PipelineShared, session: &SessionConfig, mut frame: Frame) -> Result<()> {
    let index = shared.frame_counter.fetch_add(1, Ordering::Relaxed);
    let path = session.frames_dir.join(format!("frame_{index:06}.png"));
    write_png16(&path, &frame.linear_pixels, frame.resolution)?;

    frame.disk_file_path = Some(path);
    frame.clear_payloads();
    shared.muxer.lock().unwrap().add_video_frame(&mut frame);
    update_status_after_video(shared, Some(&frame));
    Ok(())
}

/// Encoder path: zero-copy submits the (already composited) left texture
/// once per pair; the CPU path pairs and composites the converted payloads.
fn handle_encoder_frame(
    shared: &PipelineShared,
    session: &SessionConfig,
    pending_left: &mut Option<Frame>,
    mut frame: Frame,
) -> Result<()> {
    let mut encoder = shared.encoder.lock().unwrap();

    if encoder.supports_zero_copy() {
        if session.video.is_stereo() && frame.eye == Eye::Right {
            // The GPU composited both eyes into the left submission.
            return Ok(());
        }
        encoder.encode_frame(&mut frame)?;
        drop(encoder);
        shared.muxer.lock().unwrap().add_video_frame(&mut frame);
        update_status_after_video(shared, Some(&frame));
        return Ok(());
    }

    if session.video.is_stereo() {
        match frame.eye {
            Eye::Left => {
                drop(encoder);
                if pending_left.replace(frame).is_some() {
                    warn!("left eye frame arrived with a pair still pending - dropping the stale frame");
                }
                Ok(())
            }
            Eye::Right => {
                let Some(mut left) = pending_left.take() else {
                    warn!("right eye frame without a pending left - dropping");
                    return Ok(());
                };
                encoder.encode_stereo_pair(&mut left, &mut frame)?;
                drop(encoder);
                shared.muxer.lock().unwrap().add_video_frame(&mut left);
                update_status_after_video(shared, Some(&left));
                Ok(())
            }
        }
    } else {
        encoder.encode_frame(&mut frame)?;
        drop(encoder);
        shared.muxer.lock().unwrap().add_video_frame(&mut frame);
        update_status_after_video(shared, Some(&frame));
        Ok(())
    }
}

/// Write linear RGBA floats as a 16-bit RGBA PNG.
fn write_png16(path: &Path, pixels: &[f32], resolution: Resolution) -> Result<()> {
    if pixels.is_empty() || !resolution.is_positive() {
        bail!("empty frame for PNG output");
    }
    let expected = resolution.pixel_count() * 4;
    if pixels.len() != expected {
        bail!(
            "PNG save aborted: {} components, expected {expected} for {resolution}",
            pixels.len()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let raw: Vec<u16> = pixels
        .iter()
        .map(|&c| (c * 65535.0).clamp(0.0, 65535.0) as u16)
        .collect();
    let image =
        image::ImageBuffer::<image::Rgba<u16>, Vec<u16>>::from_raw(resolution.width, resolution.height, raw)
            .context("failed to assemble PNG buffer")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

fn merge_audio_packets(shared: &PipelineShared, packets: &[AudioPacket]) {
    for packet in packets {
        if packet.pcm_data.is_empty() {
            continue;
        }
        shared.muxer.lock().unwrap().add_audio_samples(packet);

        {
            let mut status = shared.status.lock().unwrap();
            status.last_audio_pts = status.last_audio_pts.max(packet.end_seconds());
        }
        notify_status(shared);
    }
}

fn update_status_after_video(shared: &PipelineShared, frame: Option<&Frame>) {
    {
        let mut status = shared.status.lock().unwrap();
        status.pending_frames = shared.queue.len();
        status.dropped_frames = shared.queue.dropped();
        status.ring_fill = shared.queue.fill_ratio();
        if let Some(frame) = frame {
            status.last_video_pts = frame.timestamp_seconds;
        }
    }
    notify_status(shared);
}

/// Hand a copy of the latest snapshot to the observer, outside any lock.
fn notify_status(shared: &PipelineShared) {
    let observer = shared.observer.lock().unwrap().clone();
    let Some(observer) = observer else {
        return;
    };
    let snapshot = shared.status.lock().unwrap().clone();
    observer.on_status(&snapshot);
}
