//! pttlink audio layer — jitter buffering, the codec engine and the
//! microphone/speaker device adapters.
//!
//! The pipeline runs 8 kHz mono s16le PCM in 20/40 ms frames. Device
//! streams run at whatever rate the hardware offers; the adapters
//! resample at the boundary so the core only ever sees pipeline frames.

pub mod capture;
pub mod codec;
pub mod device;
pub mod jitter;
pub mod pcm;
pub mod playback;
mod resample;

pub use capture::{CaptureSession, CaptureSettings, MicSession, NullMic};
pub use codec::{CodecEngine, CodecStatus, CodecType};
pub use jitter::JitterBuffer;
pub use playback::{AudioSink, NullSink, Playback};

/// Pipeline sample rate.
pub const SAMPLE_RATE: u32 = 8_000;
/// Bytes per 20 ms pipeline PCM frame (160 s16le samples).
pub const PCM_FRAME_BYTES: usize = 320;
/// Pipeline frame duration for PCM and Opus paths.
pub const FRAME_MS: u64 = 20;
