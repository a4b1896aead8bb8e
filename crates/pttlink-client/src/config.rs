use std::path::Path;

use anyhow::{Context, Result};
use pttlink_crypto::CipherMode;
use serde::{Deserialize, Serialize};

use crate::state::CodecSelection;

/// The startup configuration bundle (TOML) which doubles as the
/// persisted settings map (JSON). Values are re-clamped when applied to
/// the application state, so a hand-edited file cannot smuggle
/// out-of-range settings in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub channel_id: u32,
    pub server_address: String,
    pub server_port: u16,
    /// Channel password: plain text or its sha256 hex form.
    pub password: String,

    /// Persisted sender id; 0 or an out-of-range value is regenerated.
    pub sender_id: u32,

    /// "pcm", "codec2" or "opus".
    pub codec: String,
    pub bitrate: u32,
    pub force_pcm: bool,
    pub fec_enabled: bool,
    pub qos_enabled: bool,
    pub keep_mic_always_on: bool,

    pub mic_gain_percent: u32,
    pub speaker_gain_percent: u32,
    pub noise_suppression_enabled: bool,
    pub noise_suppression_level: u8,

    pub codec2_library_path: String,
    /// "gcm" or "legacy".
    pub crypto_mode: String,

    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            channel_id: 0,
            server_address: String::new(),
            server_port: 0,
            password: String::new(),
            sender_id: 0,
            codec: "pcm".into(),
            bitrate: 1600,
            force_pcm: true,
            fec_enabled: true,
            qos_enabled: false,
            keep_mic_always_on: false,
            mic_gain_percent: 100,
            speaker_gain_percent: 100,
            noise_suppression_enabled: false,
            noise_suppression_level: 45,
            codec2_library_path: String::new(),
            crypto_mode: "gcm".into(),
            input_device: None,
            output_device: None,
        }
    }
}

impl AppConfig {
    pub fn load_toml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).context("failed to parse config file")
    }

    /// Load persisted settings (JSON mirror of the application state).
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse settings file")
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;
        Ok(())
    }

    pub fn codec_selection(&self) -> CodecSelection {
        match self.codec.to_ascii_lowercase().as_str() {
            "codec2" => CodecSelection::Codec2,
            "opus" => CodecSelection::Opus,
            _ => CodecSelection::Pcm,
        }
    }

    pub fn cipher_mode(&self) -> CipherMode {
        match self.crypto_mode.to_ascii_lowercase().as_str() {
            "legacy" => CipherMode::LegacyXor,
            _ => CipherMode::AesGcm,
        }
    }
}
