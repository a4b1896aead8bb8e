//! The codec engine: one object per direction (TX encode, RX decode)
//! holding the selected codec, its bitrate mode and the force-PCM flag.
//!
//! Backends that fail to initialize drop the engine into PCM
//! passthrough with a descriptive error string, so audio keeps flowing
//! (uncompressed) rather than going silent.

mod codec2;
mod opus;

use std::path::PathBuf;
use std::sync::Mutex;

use pttlink_protocol::packet::CodecTransportId;
use tracing::warn;

use crate::{FRAME_MS, PCM_FRAME_BYTES};

pub use codec2::Codec2Codec;
pub use opus::OpusCodec;

/// Which compressed codec the engine targets when not forced to PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    Codec2,
    Opus,
}

/// Backend availability, mirrored into the application state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecStatus {
    pub codec2_loaded: bool,
    pub codec2_error: String,
    pub opus_loaded: bool,
    pub opus_error: String,
}

enum Backend {
    Pcm,
    Codec2(Codec2Codec),
    Opus(OpusCodec),
}

struct Inner {
    codec_type: CodecType,
    mode: u32,
    force_pcm: bool,
    codec2_path: Option<PathBuf>,
    backend: Backend,
    status: CodecStatus,
}

/// Settings queries may interleave with en/decode calls driven by
/// unrelated events, so the whole engine sits behind one lock.
pub struct CodecEngine {
    inner: Mutex<Inner>,
}

impl Default for CodecEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                codec_type: CodecType::Codec2,
                mode: 1600,
                force_pcm: true,
                codec2_path: None,
                backend: Backend::Pcm,
                status: CodecStatus::default(),
            }),
        }
    }

    pub fn set_codec_type(&self, codec_type: CodecType) {
        let mut inner = self.inner.lock().expect("codec lock");
        if inner.codec_type == codec_type {
            return;
        }
        inner.codec_type = codec_type;
        inner.rebuild();
    }

    pub fn codec_type(&self) -> CodecType {
        self.inner.lock().expect("codec lock").codec_type
    }

    pub fn set_mode(&self, mode: u32) {
        let mut inner = self.inner.lock().expect("codec lock");
        if inner.mode == mode {
            return;
        }
        inner.mode = mode;
        inner.rebuild();
    }

    pub fn mode(&self) -> u32 {
        self.inner.lock().expect("codec lock").mode
    }

    pub fn set_force_pcm(&self, force: bool) {
        let mut inner = self.inner.lock().expect("codec lock");
        if inner.force_pcm == force {
            return;
        }
        inner.force_pcm = force;
        inner.rebuild();
    }

    pub fn force_pcm(&self) -> bool {
        self.inner.lock().expect("codec lock").force_pcm
    }

    pub fn set_codec2_library_path(&self, path: &str) {
        let mut inner = self.inner.lock().expect("codec lock");
        let new_path = if path.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(path.trim()))
        };
        if inner.codec2_path == new_path {
            return;
        }
        inner.codec2_path = new_path;
        inner.rebuild();
    }

    pub fn status(&self) -> CodecStatus {
        self.inner.lock().expect("codec lock").status.clone()
    }

    /// Whether the engine is effectively in PCM passthrough (forced or
    /// fallen back).
    pub fn pcm_passthrough(&self) -> bool {
        matches!(self.inner.lock().expect("codec lock").backend, Backend::Pcm)
    }

    /// Encoded frame size in bytes.
    pub fn frame_bytes(&self) -> usize {
        match &self.inner.lock().expect("codec lock").backend {
            Backend::Pcm => PCM_FRAME_BYTES,
            Backend::Codec2(c) => c.frame_bytes(),
            Backend::Opus(o) => o.frame_bytes(),
        }
    }

    /// PCM frame size in bytes at the 8 kHz pipeline rate.
    pub fn pcm_frame_bytes(&self) -> usize {
        match &self.inner.lock().expect("codec lock").backend {
            Backend::Codec2(c) => c.pcm_frame_bytes(),
            _ => PCM_FRAME_BYTES,
        }
    }

    /// Frame duration in milliseconds.
    pub fn frame_ms(&self) -> u64 {
        match &self.inner.lock().expect("codec lock").backend {
            Backend::Codec2(c) => c.frame_ms(),
            _ => FRAME_MS,
        }
    }

    /// The codec id announced in CODEC_CONFIG packets.
    pub fn active_transport_id(&self) -> CodecTransportId {
        match &self.inner.lock().expect("codec lock").backend {
            Backend::Pcm => CodecTransportId::Pcm,
            Backend::Codec2(_) => CodecTransportId::Codec2,
            Backend::Opus(_) => CodecTransportId::Opus,
        }
    }

    /// Encode one PCM frame. Returns an empty frame on failure.
    pub fn encode(&self, pcm: &[u8]) -> Vec<u8> {
        let mut inner = self.inner.lock().expect("codec lock");
        match &mut inner.backend {
            Backend::Pcm => pcm.to_vec(),
            Backend::Codec2(c) => c.encode(pcm).unwrap_or_else(|e| {
                warn!("codec2 encode failed: {e:#}");
                Vec::new()
            }),
            Backend::Opus(o) => o.encode(pcm).unwrap_or_else(|e| {
                warn!("opus encode failed: {e:#}");
                Vec::new()
            }),
        }
    }

    /// Decode one encoded frame. Returns an empty frame on failure; the
    /// playout engine substitutes silence.
    pub fn decode(&self, frame: &[u8]) -> Vec<u8> {
        let mut inner = self.inner.lock().expect("codec lock");
        match &mut inner.backend {
            Backend::Pcm => frame.to_vec(),
            Backend::Codec2(c) => c.decode(frame).unwrap_or_else(|e| {
                warn!("codec2 decode failed: {e:#}");
                Vec::new()
            }),
            Backend::Opus(o) => o.decode(frame).unwrap_or_else(|e| {
                warn!("opus decode failed: {e:#}");
                Vec::new()
            }),
        }
    }
}

impl Inner {
    fn rebuild(&mut self) {
        self.backend = Backend::Pcm;

        if self.force_pcm {
            return;
        }

        match self.codec_type {
            CodecType::Opus => match OpusCodec::new(self.mode) {
                Ok(opus) => {
                    self.backend = Backend::Opus(opus);
                    self.status.opus_loaded = true;
                    self.status.opus_error.clear();
                }
                Err(e) => {
                    warn!("opus init failed, falling back to PCM: {e:#}");
                    self.status.opus_loaded = false;
                    self.status.opus_error = format!("{e:#}");
                }
            },
            CodecType::Codec2 => {
                let Some(path) = self.codec2_path.clone() else {
                    self.status.codec2_loaded = false;
                    self.status.codec2_error = "no codec2 library configured".into();
                    return;
                };
                match Codec2Codec::load(&path, self.mode) {
                    Ok(codec2) => {
                        self.backend = Backend::Codec2(codec2);
                        self.status.codec2_loaded = true;
                        self.status.codec2_error.clear();
                    }
                    Err(e) => {
                        warn!("codec2 init failed, falling back to PCM: {e:#}");
                        self.status.codec2_loaded = false;
                        self.status.codec2_error = format!("{e:#}");
                    }
                }
            }
        }
    }
}
