use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use tracing::{error, info, warn};

use crate::device;
use crate::resample::LinearResampler;
use crate::SAMPLE_RATE;

/// Size of the capture ring buffer in samples (~250 ms at 48 kHz).
const CAPTURE_BUFFER_SIZE: usize = 12_000;

/// Microphone session lifecycle as seen by the TX scheduler.
pub trait MicSession {
    /// Start the session if it is not already running.
    fn ensure_started(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Produces no frames; used when no input device is available. Reports
/// itself running so the TX state machine still exercises the control
/// path.
#[derive(Debug, Default)]
pub struct NullMic;

impl MicSession for NullMic {
    fn ensure_started(&mut self) {}
    fn stop(&mut self) {}
    fn is_running(&self) -> bool {
        true
    }
}

/// Live capture settings the worker re-reads on every frame, so gain and
/// frame-size changes apply without restarting the stream.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Pipeline frame size in bytes (s16le at 8 kHz).
    pub frame_bytes: usize,
    /// Microphone gain, 0..=300 percent.
    pub gain_percent: u32,
    pub noise_gate_enabled: bool,
    /// Gate strength, 0..=100.
    pub noise_gate_level: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_bytes: crate::PCM_FRAME_BYTES,
            gain_percent: 100,
            noise_gate_enabled: false,
            noise_gate_level: 45,
        }
    }
}

struct ActiveCapture {
    // Held to keep the cpal stream alive; dropped on stop.
    _stream: cpal::Stream,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Microphone adapter: captures at the device rate, folds to mono,
/// resamples to the 8 kHz pipeline, applies gain and the noise gate and
/// emits complete s16le frames through the sink.
pub struct CaptureSession {
    device_name: Option<String>,
    settings: Arc<Mutex<CaptureSettings>>,
    sink: Arc<Mutex<dyn FnMut(Vec<u8>) + Send>>,
    active: Option<ActiveCapture>,
}

impl CaptureSession {
    pub fn new(
        device_name: Option<String>,
        settings: Arc<Mutex<CaptureSettings>>,
        sink: impl FnMut(Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            device_name,
            settings,
            sink: Arc::new(Mutex::new(sink)),
            active: None,
        }
    }

    fn start(&mut self) -> Result<()> {
        let device = device::get_input_device(self.device_name.as_deref())?;
        let config = device.default_input_config()?;
        let channels = config.channels() as usize;
        let in_rate = config.sample_rate().0;
        let sample_format = config.sample_format();

        let stream_config = StreamConfig {
            channels: config.channels(),
            sample_rate: config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let rb = HeapRb::<f32>::new(CAPTURE_BUFFER_SIZE);
        let (mut producer, mut consumer) = rb.split();

        info!(
            device = device.name().unwrap_or_default(),
            sample_rate = in_rate,
            channels,
            "starting microphone capture"
        );

        let stream = match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks(channels.max(1)) {
                        let _ = producer.try_push(chunk[0]);
                    }
                },
                move |err| error!("microphone capture error: {err}"),
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks(channels.max(1)) {
                        let _ = producer.try_push(chunk[0] as f32 / i16::MAX as f32);
                    }
                },
                move |err| error!("microphone capture error: {err}"),
                None,
            )?,
            format => anyhow::bail!("unsupported capture sample format: {format:?}"),
        };
        stream.play()?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let settings = Arc::clone(&self.settings);
        let sink = Arc::clone(&self.sink);

        let worker = std::thread::spawn(move || {
            let mut resampler = LinearResampler::new(in_rate, SAMPLE_RATE);
            let mut resampled: Vec<f32> = Vec::new();
            let mut pending: Vec<i16> = Vec::new();
            let mut gate_hold = 0u32;

            while !worker_stop.load(Ordering::Relaxed) {
                let mut chunk = [0f32; 512];
                let n = consumer.pop_slice(&mut chunk);
                if n == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }

                let settings = settings.lock().expect("capture settings lock").clone();
                let gain = settings.gain_percent as f32 / 100.0;

                resampled.clear();
                for &sample in &chunk[..n] {
                    resampler.push(sample, &mut resampled);
                }
                for &sample in &resampled {
                    let amplified = (sample * gain).clamp(-1.0, 1.0);
                    pending.push((amplified * i16::MAX as f32) as i16);
                }

                let frame_samples = (settings.frame_bytes / 2).max(1);
                while pending.len() >= frame_samples {
                    let samples: Vec<i16> = pending.drain(..frame_samples).collect();
                    let frame =
                        apply_noise_gate(samples, &settings, &mut gate_hold);
                    (*sink.lock().expect("capture sink lock"))(frame);
                }
            }
        });

        self.active = Some(ActiveCapture {
            _stream: stream,
            stop,
            worker: Some(worker),
        });
        Ok(())
    }
}

impl MicSession for CaptureSession {
    fn ensure_started(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Err(e) = self.start() {
            warn!("failed to start microphone capture: {e:#}");
        }
    }

    fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop.store(true, Ordering::Relaxed);
            if let Some(worker) = active.worker.take() {
                let _ = worker.join();
            }
            info!("microphone capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        MicSession::stop(self);
    }
}

/// Frames quieter than the level-mapped threshold are muted, with a
/// short hangover so word tails are not clipped.
fn apply_noise_gate(
    samples: Vec<i16>,
    settings: &CaptureSettings,
    gate_hold: &mut u32,
) -> Vec<u8> {
    const HANGOVER_FRAMES: u32 = 8;

    let as_bytes = |samples: &[i16]| -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    };

    if !settings.noise_gate_enabled {
        return as_bytes(&samples);
    }

    let frame = as_bytes(&samples);
    let level = crate::pcm::level(&frame);
    // Level 0 never gates, level 100 gates anything below -20 dBFS.
    let threshold = settings.noise_gate_level.min(100) as f32 / 100.0 * 0.1;

    if level >= threshold {
        *gate_hold = HANGOVER_FRAMES;
        return frame;
    }
    if *gate_hold > 0 {
        *gate_hold -= 1;
        return frame;
    }
    vec![0; frame.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(level: u8) -> CaptureSettings {
        CaptureSettings {
            noise_gate_enabled: true,
            noise_gate_level: level,
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn gate_passes_loud_frames_and_mutes_quiet_ones() {
        let mut hold = 0;
        let loud = vec![8000i16; 160];
        let quiet = vec![10i16; 160];

        let out = apply_noise_gate(loud, &settings(50), &mut hold);
        assert!(out.iter().any(|&b| b != 0));

        // Drain the hangover, then quiet frames must be muted.
        for _ in 0..16 {
            apply_noise_gate(quiet.clone(), &settings(50), &mut hold);
        }
        let muted = apply_noise_gate(quiet, &settings(50), &mut hold);
        assert!(muted.iter().all(|&b| b == 0));
    }

    #[test]
    fn gate_disabled_passes_everything() {
        let mut hold = 0;
        let quiet = vec![1i16; 160];
        let out = apply_noise_gate(quiet, &CaptureSettings::default(), &mut hold);
        assert!(out.iter().any(|&b| b != 0));
    }

    #[test]
    fn gate_level_zero_never_mutes() {
        let mut hold = 0;
        for _ in 0..16 {
            apply_noise_gate(vec![0i16; 160], &settings(0), &mut hold);
        }
        let out = apply_noise_gate(vec![1i16; 160], &settings(0), &mut hold);
        assert!(out.iter().any(|&b| b != 0));
    }
}
