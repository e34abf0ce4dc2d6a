//! Audio recording for the capture session
//!
//! Consumes interleaved float buffers from a live source, drift-corrects
//! their timestamps against the session clock, accumulates PCM16 and
//! finalizes a WAV file on stop. The default live source is the cpal input
//! device (captured on a dedicated thread, since cpal streams must stay on
//! the thread that built them); hosts that mix their own audio can push
//! buffers directly through [`AudioRecorder::handle_audio_buffer`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{error, info, warn};

use crate::pipeline::types::AudioPacket;
use crate::settings::AudioSettings;
use crate::utils::WorkerSignal;

/// Exponential smoothing factor for the clock-drift estimate.
const DRIFT_SMOOTHING: f64 = 0.05;
/// Drift correction is clamped to ±250 ms so one bad measurement cannot
/// yank the audio timeline around.
const DRIFT_CLAMP_SECONDS: f64 = 0.25;

/// Audio recorder: `Idle → Recording → Idle` via start/stop.
pub struct AudioRecorder {
    settings: AudioSettings,
    wave_path: PathBuf,
    shared: Arc<AudioShared>,
    stream_stop: Option<WorkerSignal>,
    stream_thread: Option<thread::JoinHandle<()>>,
}

struct AudioShared {
    recording: AtomicBool,
    data: Mutex<AudioData>,
}

#[derive(Default)]
struct AudioData {
    pending: Vec<AudioPacket>,
    accumulated: Vec<u8>,
    total_frames: u64,
    captured_sample_rate: u32,
    captured_channels: u16,
    last_packet_pts: f64,
    duration_seconds: f64,
    smoothed_drift: f64,
    base_offset_seconds: f64,
    capture_start: Option<Instant>,
}

impl AudioShared {
    /// Timestamp, quantize and store one interleaved float buffer.
    ///
    /// Runs on the audio callback thread; everything here is O(buffer) and
    /// the lock is only held for the bookkeeping appends.
    fn handle_buffer(&self, samples: &[f32], num_channels: u16, sample_rate: u32) {
        if !self.recording.load(Ordering::Acquire)
            || samples.is_empty()
            || num_channels == 0
            || sample_rate == 0
        {
            return;
        }

        let frames = samples.len() / num_channels as usize;
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
            pcm.extend_from_slice(&quantized.to_le_bytes());
        }

        let mut data = self.data.lock().unwrap();

        let frame_offset = data.total_frames as f64 / sample_rate as f64;
        let mut pts = data.base_offset_seconds + frame_offset;
        let packet_duration = frames as f64 / sample_rate as f64;

        // Sample counting alone lets the audio PTS free-run against the
        // real capture clock; measure the drift and fold a smoothed,
        // clamped correction back into the reported timestamp.
        if let Some(start) = data.capture_start {
            let real_clock = start.elapsed().as_secs_f64();
            let drift = real_clock - (pts + packet_duration);
            data.smoothed_drift = (data.smoothed_drift
                + DRIFT_SMOOTHING * (drift - data.smoothed_drift))
                .clamp(-DRIFT_CLAMP_SECONDS, DRIFT_CLAMP_SECONDS);
            pts = (pts + data.smoothed_drift).max(0.0);
        }

        let packet = AudioPacket {
            timestamp_seconds: pts,
            num_channels,
            sample_rate,
            pcm_data: pcm,
        };

        data.last_packet_pts = packet.end_seconds();
        data.duration_seconds = data.duration_seconds.max(data.last_packet_pts);
        data.accumulated.extend_from_slice(&packet.pcm_data);
        data.pending.push(packet);
        data.total_frames += frames as u64;
        data.captured_sample_rate = sample_rate;
        data.captured_channels = num_channels;
    }
}

impl AudioRecorder {
    pub fn new(settings: AudioSettings, output_dir: &Path) -> Self {
        Self {
            settings,
            wave_path: output_dir.join("audio.wav"),
            shared: Arc::new(AudioShared {
                recording: AtomicBool::new(false),
                data: Mutex::new(AudioData::default()),
            }),
            stream_stop: None,
            stream_thread: None,
        }
    }

    /// Anchor packet timestamps to the capture session clock.
    pub fn set_capture_start(&self, start: Instant) {
        self.shared.data.lock().unwrap().capture_start = Some(start);
    }

    /// Begin recording. Degrades to a logged warning (recorder stays armed
    /// but silent) when no input device or stream is available.
    pub fn start_recording(&mut self) {
        if self.is_recording() {
            return;
        }

        if !self.settings.capture_audio {
            info!("audio capture disabled - skipping start");
            return;
        }

        self.reset_capture_data();
        {
            let mut data = self.shared.data.lock().unwrap();
            data.base_offset_seconds = data
                .capture_start
                .map(|start| start.elapsed().as_secs_f64().max(0.0))
                .unwrap_or(0.0);
        }
        self.shared.recording.store(true, Ordering::Release);

        match self.attach_input_stream() {
            Ok(()) => info!(
                "audio recording started ({} Hz requested, {} channels)",
                self.settings.sample_rate, self.settings.num_channels
            ),
            Err(err) => {
                warn!("audio input unavailable ({err}); session continues without live audio");
            }
        }
    }

    /// Stop recording and detach the live source. Blocks until the stream
    /// thread has exited.
    pub fn stop_recording(&mut self) {
        if !self.is_recording() {
            return;
        }

        info!("stopping audio recording");
        self.shared.recording.store(false, Ordering::Release);
        {
            let mut data = self.shared.data.lock().unwrap();
            data.duration_seconds = data.last_packet_pts;
        }

        if let Some(stop) = self.stream_stop.take() {
            stop.request_stop();
        }
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }

    /// Push entry point for hosts that deliver their own mixed audio.
    pub fn handle_audio_buffer(&self, samples: &[f32], num_channels: u16, sample_rate: u32) {
        self.shared.handle_buffer(samples, num_channels, sample_rate);
    }

    /// Drain every pending packet. Nothing is ever delivered twice.
    pub fn consume_packets(&self) -> Vec<AudioPacket> {
        let mut data = self.shared.data.lock().unwrap();
        std::mem::take(&mut data.pending)
    }

    /// Write the accumulated PCM as a standard 16-bit WAV, then clear the
    /// accumulation buffers. A write failure is a warning, not fatal.
    pub fn finalize_wave_file(&self) {
        let (pcm, num_channels, sample_rate) = {
            let data = self.shared.data.lock().unwrap();
            if data.accumulated.is_empty() {
                return;
            }
            let channels = if data.captured_channels > 0 {
                data.captured_channels
            } else {
                self.settings.num_channels
            };
            let rate = if data.captured_sample_rate > 0 {
                data.captured_sample_rate
            } else {
                self.settings.sample_rate
            };
            (data.accumulated.clone(), channels, rate)
        };

        let wave = wave_file_bytes(&pcm, num_channels, sample_rate);
        if let Err(err) = std::fs::write(&self.wave_path, wave) {
            warn!("failed to write WAV file {}: {err}", self.wave_path.display());
        }

        let mut data = self.shared.data.lock().unwrap();
        data.accumulated = Vec::new();
        data.pending.clear();
    }

    pub fn wave_file_path(&self) -> &Path {
        &self.wave_path
    }

    pub fn recording_duration_seconds(&self) -> f64 {
        self.shared.data.lock().unwrap().duration_seconds
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// Stop, flush the WAV and drop all captured state.
    pub fn shutdown(&mut self) {
        self.stop_recording();
        self.finalize_wave_file();
        self.reset_capture_data();
    }

    fn reset_capture_data(&self) {
        let mut data = self.shared.data.lock().unwrap();
        let capture_start = data.capture_start;
        *data = AudioData {
            captured_sample_rate: self.settings.sample_rate,
            captured_channels: self.settings.num_channels,
            capture_start,
            ..AudioData::default()
        };
    }

    /// Attach the default cpal input device on a dedicated thread.
    fn attach_input_stream(&mut self) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("no default input device"))?;
        let config = device
            .default_input_config()
            .map_err(|e| anyhow!("failed to get default input config: {e}"))?;

        info!("audio input config: {config:?}");

        let shared = Arc::clone(&self.shared);
        let stop = WorkerSignal::new();
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("panorec-audio".into())
            .spawn(move || {
                let sample_format = config.sample_format();
                let channels = config.channels();
                let sample_rate = config.sample_rate();
                let stream_config: cpal::StreamConfig = config.into();

                let stream = match sample_format {
                    SampleFormat::I8 => {
                        build_stream::<i8>(&device, &stream_config, shared, channels, sample_rate)
                    }
                    SampleFormat::I16 => {
                        build_stream::<i16>(&device, &stream_config, shared, channels, sample_rate)
                    }
                    SampleFormat::I32 => {
                        build_stream::<i32>(&device, &stream_config, shared, channels, sample_rate)
                    }
                    SampleFormat::F32 => {
                        build_stream::<f32>(&device, &stream_config, shared, channels, sample_rate)
                    }
                    other => Err(anyhow!("unsupported sample format {other:?}")),
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("failed to build audio input stream: {err}");
                        return;
                    }
                };

                if let Err(err) = stream.play() {
                    error!("failed to start audio input stream: {err}");
                    return;
                }

                // Park until the recorder stops; the stream lives (and dies)
                // on this thread.
                while !thread_stop.stop_requested() {
                    thread_stop.wait();
                }

                let _ = stream.pause();
                info!("audio input stream stopped");
            })
            .map_err(|e| anyhow!("failed to spawn audio thread: {e}"))?;

        self.stream_stop = Some(stop);
        self.stream_thread = Some(handle);
        Ok(())
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.shared.recording.store(false, Ordering::Release);
        if let Some(stop) = self.stream_stop.take() {
            stop.request_stop();
        }
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<AudioShared>,
    num_channels: u16,
    sample_rate: cpal::SampleRate,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let err_fn = |err| error!("audio stream error: {err}");
    let stream = device.build_input_stream(
        config,
        move |input: &[T], _: &cpal::InputCallbackInfo| {
            let floats: Vec<f32> = input.iter().map(|&s| f32::from_sample(s)).collect();
            shared.handle_buffer(&floats, num_channels, sample_rate);
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Assemble a complete RIFF/WAVE PCM16 file: 44-byte header plus data.
fn wave_file_bytes(pcm: &[u8], num_channels: u16, sample_rate: u32) -> Vec<u8> {
    const BITS_PER_SAMPLE: u16 = 16;
    let bytes_per_sample = BITS_PER_SAMPLE as u32 / 8;
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample;
    let block_align = num_channels * bytes_per_sample as u16;
    let data_size = pcm.len() as u32;

    let mut wave = Vec::with_capacity(44 + pcm.len());
    wave.extend_from_slice(b"RIFF");
    wave.extend_from_slice(&(36 + data_size).to_le_bytes());
    wave.extend_from_slice(b"WAVE");
    wave.extend_from_slice(b"fmt ");
    wave.extend_from_slice(&16u32.to_le_bytes()); // PCM descriptor size
    wave.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wave.extend_from_slice(&num_channels.to_le_bytes());
    wave.extend_from_slice(&sample_rate.to_le_bytes());
    wave.extend_from_slice(&byte_rate.to_le_bytes());
    wave.extend_from_slice(&block_align.to_le_bytes());
    wave.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wave.extend_from_slice(b"data");
    wave.extend_from_slice(&data_size.to_le_bytes());
    wave.extend_from_slice(pcm);
    wave
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_recorder(dir: &Path) -> AudioRecorder {
        // capture_audio=true but no stream attach: tests push buffers directly.
        let recorder = AudioRecorder::new(AudioSettings::default(), dir);
        recorder.set_capture_start(Instant::now());
        recorder.reset_capture_data();
        recorder.shared.recording.store(true, Ordering::Release);
        recorder
    }

    #[test]
    fn test_quantization_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = silent_recorder(dir.path());

        // 0.5 seconds of full-scale stereo.
        let samples = vec![1.0f32; 48_000];
        recorder.handle_audio_buffer(&samples, 2, 48_000);

        let packets = recorder.consume_packets();
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.num_channels, 2);
        assert_eq!(packet.pcm_data.len(), 48_000 * 2);
        assert!((packet.duration_seconds() - 0.5).abs() < 1e-9);

        // Full-scale float maps to i16::MAX; out-of-range input clamps.
        let first = i16::from_le_bytes([packet.pcm_data[0], packet.pcm_data[1]]);
        assert_eq!(first, 32767);
        assert!(recorder.recording_duration_seconds() >= 0.5);
    }

    #[test]
    fn test_consume_drains_once() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = silent_recorder(dir.path());

        recorder.handle_audio_buffer(&[0.0; 960], 2, 48_000);
        recorder.handle_audio_buffer(&[0.0; 960], 2, 48_000);
        assert_eq!(recorder.consume_packets().len(), 2);
        assert!(recorder.consume_packets().is_empty());
    }

    #[test]
    fn test_packet_timestamps_advance() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = silent_recorder(dir.path());

        recorder.handle_audio_buffer(&[0.0; 9600], 2, 48_000); // 100 ms
        recorder.handle_audio_buffer(&[0.0; 9600], 2, 48_000);
        let packets = recorder.consume_packets();
        assert_eq!(packets.len(), 2);
        // Second packet starts one buffer after the first, give or take the
        // clamped drift correction.
        let delta = packets[1].timestamp_seconds - packets[0].timestamp_seconds;
        assert!(delta > 0.0 && delta < 0.1 + 2.0 * DRIFT_CLAMP_SECONDS);
    }

    #[test]
    fn test_ignores_buffers_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = AudioRecorder::new(AudioSettings::default(), dir.path());
        recorder.handle_audio_buffer(&[0.5; 960], 2, 48_000);
        assert!(recorder.consume_packets().is_empty());
        assert_eq!(recorder.recording_duration_seconds(), 0.0);
    }

    #[test]
    fn test_wave_file_layout() {
        // One second of silence at 48kHz stereo.
        let pcm = vec![0u8; 48_000 * 2 * 2];
        let wave = wave_file_bytes(&pcm, 2, 48_000);

        assert_eq!(wave.len(), 44 + 192_000);
        assert_eq!(&wave[..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(wave[4..8].try_into().unwrap()), 36 + 192_000);
        assert_eq!(&wave[8..12], b"WAVE");
        assert_eq!(&wave[12..16], b"fmt ");
        assert_eq!(u16::from_le_bytes(wave[22..24].try_into().unwrap()), 2); // channels
        assert_eq!(u32::from_le_bytes(wave[24..28].try_into().unwrap()), 48_000);
        assert_eq!(u32::from_le_bytes(wave[28..32].try_into().unwrap()), 192_000); // byte rate
        assert_eq!(u16::from_le_bytes(wave[32..34].try_into().unwrap()), 4); // block align
        assert_eq!(u16::from_le_bytes(wave[34..36].try_into().unwrap()), 16); // bit depth
        assert_eq!(&wave[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wave[40..44].try_into().unwrap()), 192_000);
    }

    #[test]
    fn test_finalize_writes_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = silent_recorder(dir.path());

        // One second of silence at the default 48kHz stereo.
        let silence = vec![0.0f32; 96_000];
        recorder.handle_audio_buffer(&silence, 2, 48_000);
        recorder.finalize_wave_file();

        let written = std::fs::read(recorder.wave_file_path()).unwrap();
        assert_eq!(written.len(), 44 + 192_000);

        // Accumulation cleared: finalizing again rewrites nothing.
        std::fs::remove_file(recorder.wave_file_path()).unwrap();
        recorder.finalize_wave_file();
        assert!(!recorder.wave_file_path().exists());
    }
}
