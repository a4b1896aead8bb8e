use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{error, info};

use crate::device;
use crate::resample::LinearResampler;
use crate::SAMPLE_RATE;

/// Playback ring capacity in device-rate samples (~500 ms at 48 kHz).
const PLAYBACK_BUFFER_SIZE: usize = 24_000;

/// Where the playout engine renders PCM frames.
pub trait AudioSink {
    /// Queue one s16le 8 kHz pipeline frame for playback.
    fn play_frame(&mut self, pcm: &[u8]);

    /// Milliseconds of audio already queued on the device side.
    fn queued_ms(&self) -> u64;

    /// Output gain, 0..=400 percent. Sinks without a volume stage may
    /// ignore this.
    fn set_gain_percent(&mut self, _percent: u32) {}
}

/// Discards every frame; used when no output device is available.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play_frame(&mut self, _pcm: &[u8]) {}

    fn queued_ms(&self) -> u64 {
        0
    }
}

/// Speaker adapter: applies the output gain, resamples pipeline frames
/// to the device rate and feeds them to the cpal output callback through
/// a lock-free ring.
pub struct Playback {
    producer: HeapProd<f32>,
    // Held to keep the cpal stream alive.
    _stream: cpal::Stream,
    device_rate: u32,
    gain_percent: u32,
    resampler: LinearResampler,
}

impl Playback {
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = device::get_output_device(device_name)?;
        let config = device.default_output_config()?;
        let channels = config.channels() as usize;
        let device_rate = config.sample_rate().0;

        let stream_config = StreamConfig {
            channels: config.channels(),
            sample_rate: config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let rb = HeapRb::<f32>::new(PLAYBACK_BUFFER_SIZE);
        let (producer, mut consumer) = rb.split();

        info!(
            device = device.name().unwrap_or_default(),
            sample_rate = device_rate,
            channels,
            "starting audio playback"
        );

        let stream = match config.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels.max(1)) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                move |err| error!("audio playback error: {err}"),
                None,
            )?,
            SampleFormat::I16 => device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels.max(1)) {
                        let sample = consumer.try_pop().unwrap_or(0.0);
                        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        frame.fill(value);
                    }
                },
                move |err| error!("audio playback error: {err}"),
                None,
            )?,
            format => anyhow::bail!("unsupported playback sample format: {format:?}"),
        };
        stream.play()?;

        Ok(Self {
            producer,
            _stream: stream,
            device_rate,
            gain_percent: 100,
            resampler: LinearResampler::new(SAMPLE_RATE, device_rate),
        })
    }

    /// Speaker gain, 0..=400 percent.
    pub fn set_gain_percent(&mut self, percent: u32) {
        self.gain_percent = percent.min(400);
    }
}

impl AudioSink for Playback {
    fn set_gain_percent(&mut self, percent: u32) {
        Playback::set_gain_percent(self, percent);
    }

    fn play_frame(&mut self, pcm: &[u8]) {
        let gain = self.gain_percent as f32 / 100.0;
        let mut out: Vec<f32> = Vec::with_capacity(pcm.len());
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
            self.resampler
                .push((sample * gain).clamp(-1.0, 1.0), &mut out);
        }
        self.producer.push_slice(&out);
    }

    fn queued_ms(&self) -> u64 {
        let queued = self.producer.occupied_len() as u64;
        queued * 1000 / self.device_rate.max(1) as u64
    }
}
