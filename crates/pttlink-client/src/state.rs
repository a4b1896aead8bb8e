use pttlink_crypto::CipherMode;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Codec choices exposed to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSelection {
    Pcm,
    Codec2,
    Opus,
}

/// Allowed codec2 bitrates.
pub const CODEC2_BITRATES: [u32; 5] = [450, 700, 1600, 2400, 3200];
/// Allowed Opus bitrates.
pub const OPUS_BITRATES: [u32; 8] =
    [6000, 8000, 12000, 16000, 20000, 64000, 96000, 128000];

/// Typed change notifications mirroring the live state. Observers (the
/// status printer, a future UI) consume these from a channel; nothing
/// holds callbacks into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    LinkStatus(String),
    ServerOnline(bool),
    TalkerId(u32),
    PttPressed(bool),
    TxLevel(f32),
    RxLevel(f32),
    CodecSelection(CodecSelection),
    CodecBitrate(u32),
    ForcePcm(bool),
    FecEnabled(bool),
    QosEnabled(bool),
    TalkDenied(u32),
    ChannelError(String),
    Codec2Library { loaded: bool, error: String },
    OpusBackend { loaded: bool, error: String },
    ChannelConfigured { channel_id: u32 },
    ServerActivity,
    AudioFrame(Vec<u8>),
}

/// Normalized settings plus live status. Every setter clamps its input
/// to the allowed set and emits a [`Signal`] only on an actual change.
pub struct AppState {
    signals: UnboundedSender<Signal>,

    link_status: String,
    server_online: bool,
    talker_id: u32,
    ptt_pressed: bool,
    tx_level: f32,
    rx_level: f32,
    sender_id: u32,

    crypto_mode: CipherMode,
    codec_selection: CodecSelection,
    codec_bitrate: u32,
    codec2_bitrate: u32,
    opus_bitrate: u32,
    force_pcm: bool,
    fec_enabled: bool,
    qos_enabled: bool,
    mic_gain_percent: u32,
    speaker_gain_percent: u32,
    noise_suppression_enabled: bool,
    noise_suppression_level: u8,
    keep_mic_always_on: bool,
    codec2_library_path: String,
    codec2_library_loaded: bool,
    codec2_library_error: String,
    opus_loaded: bool,
    opus_error: String,
}

fn nearest_option(value: u32, options: &[u32]) -> u32 {
    *options
        .iter()
        .min_by_key(|&&opt| value.abs_diff(opt))
        .expect("option set is nonempty")
}

fn normalize_bitrate(bitrate: u32, selection: CodecSelection) -> u32 {
    match selection {
        CodecSelection::Opus => nearest_option(bitrate.max(6000), &OPUS_BITRATES),
        _ => nearest_option(bitrate, &CODEC2_BITRATES),
    }
}

impl AppState {
    pub fn new(signals: UnboundedSender<Signal>) -> Self {
        Self {
            signals,
            link_status: "Disconnected".into(),
            server_online: false,
            talker_id: 0,
            ptt_pressed: false,
            tx_level: 0.0,
            rx_level: 0.0,
            sender_id: 0,
            crypto_mode: CipherMode::AesGcm,
            codec_selection: CodecSelection::Pcm,
            codec_bitrate: 1600,
            codec2_bitrate: 1600,
            opus_bitrate: 16000,
            force_pcm: true,
            fec_enabled: true,
            qos_enabled: false,
            mic_gain_percent: 100,
            speaker_gain_percent: 100,
            noise_suppression_enabled: false,
            noise_suppression_level: 45,
            keep_mic_always_on: false,
            codec2_library_path: String::new(),
            codec2_library_loaded: false,
            codec2_library_error: String::new(),
            opus_loaded: false,
            opus_error: String::new(),
        }
    }

    fn emit(&self, signal: Signal) {
        let _ = self.signals.send(signal);
    }

    pub fn link_status(&self) -> &str {
        &self.link_status
    }

    pub fn set_link_status(&mut self, status: impl Into<String>) {
        let status = status.into();
        if self.link_status == status {
            return;
        }
        debug!(status = %status, "link status");
        self.link_status = status.clone();
        self.emit(Signal::LinkStatus(status));
    }

    pub fn server_online(&self) -> bool {
        self.server_online
    }

    pub fn set_server_online(&mut self, online: bool) {
        if self.server_online == online {
            return;
        }
        self.server_online = online;
        self.emit(Signal::ServerOnline(online));
    }

    pub fn talker_id(&self) -> u32 {
        self.talker_id
    }

    pub fn set_talker_id(&mut self, talker_id: u32) {
        if self.talker_id == talker_id {
            return;
        }
        self.talker_id = talker_id;
        self.emit(Signal::TalkerId(talker_id));
    }

    pub fn ptt_pressed(&self) -> bool {
        self.ptt_pressed
    }

    pub fn set_ptt_pressed(&mut self, pressed: bool) -> bool {
        if self.ptt_pressed == pressed {
            return false;
        }
        self.ptt_pressed = pressed;
        self.emit(Signal::PttPressed(pressed));
        true
    }

    pub fn set_tx_level(&mut self, level: f32) {
        if (self.tx_level - level).abs() < f32::EPSILON {
            return;
        }
        self.tx_level = level;
        self.emit(Signal::TxLevel(level));
    }

    pub fn set_rx_level(&mut self, level: f32) {
        if (self.rx_level - level).abs() < f32::EPSILON {
            return;
        }
        self.rx_level = level;
        self.emit(Signal::RxLevel(level));
    }

    pub fn sender_id(&self) -> u32 {
        self.sender_id
    }

    pub fn set_sender_id(&mut self, sender_id: u32) {
        self.sender_id = sender_id;
    }

    pub fn crypto_mode(&self) -> CipherMode {
        self.crypto_mode
    }

    pub fn set_crypto_mode(&mut self, mode: CipherMode) -> bool {
        if self.crypto_mode == mode {
            return false;
        }
        self.crypto_mode = mode;
        true
    }

    pub fn codec_selection(&self) -> CodecSelection {
        self.codec_selection
    }

    /// Select a codec. Selecting PCM forces PCM; leaving PCM restores the
    /// per-codec remembered bitrate.
    pub fn set_codec_selection(&mut self, selection: CodecSelection) -> bool {
        let new_force_pcm = selection == CodecSelection::Pcm;
        let remembered = match selection {
            CodecSelection::Opus => self.opus_bitrate,
            _ => self.codec2_bitrate,
        };
        let new_bitrate = normalize_bitrate(remembered, selection);

        let selection_changed = self.codec_selection != selection;
        let force_changed = self.force_pcm != new_force_pcm;
        let bitrate_changed = self.codec_bitrate != new_bitrate;
        if !selection_changed && !force_changed && !bitrate_changed {
            return false;
        }

        self.codec_selection = selection;
        self.force_pcm = new_force_pcm;
        self.codec_bitrate = new_bitrate;
        self.remember_bitrate(new_bitrate);

        if selection_changed {
            self.emit(Signal::CodecSelection(selection));
        }
        if force_changed {
            self.emit(Signal::ForcePcm(new_force_pcm));
        }
        if bitrate_changed {
            self.emit(Signal::CodecBitrate(new_bitrate));
        }
        true
    }

    pub fn codec_bitrate(&self) -> u32 {
        self.codec_bitrate
    }

    /// Snap the bitrate to the active codec's allowed set.
    pub fn set_codec_bitrate(&mut self, bitrate: u32) -> bool {
        let normalized = normalize_bitrate(bitrate, self.codec_selection);
        self.remember_bitrate(normalized);
        if self.codec_bitrate == normalized {
            return false;
        }
        self.codec_bitrate = normalized;
        self.emit(Signal::CodecBitrate(normalized));
        true
    }

    fn remember_bitrate(&mut self, bitrate: u32) {
        match self.codec_selection {
            CodecSelection::Opus => self.opus_bitrate = bitrate,
            _ => self.codec2_bitrate = bitrate,
        }
    }

    pub fn force_pcm(&self) -> bool {
        self.force_pcm
    }

    /// Forcing PCM moves the selection to PCM; releasing it restores a
    /// compressed codec.
    pub fn set_force_pcm(&mut self, force: bool) -> bool {
        let selection = if force {
            CodecSelection::Pcm
        } else if self.codec_selection == CodecSelection::Pcm {
            CodecSelection::Codec2
        } else {
            self.codec_selection
        };
        self.set_codec_selection(selection)
    }

    pub fn fec_enabled(&self) -> bool {
        self.fec_enabled
    }

    pub fn set_fec_enabled(&mut self, enabled: bool) -> bool {
        if self.fec_enabled == enabled {
            return false;
        }
        self.fec_enabled = enabled;
        self.emit(Signal::FecEnabled(enabled));
        true
    }

    pub fn qos_enabled(&self) -> bool {
        self.qos_enabled
    }

    pub fn set_qos_enabled(&mut self, enabled: bool) -> bool {
        if self.qos_enabled == enabled {
            return false;
        }
        self.qos_enabled = enabled;
        self.emit(Signal::QosEnabled(enabled));
        true
    }

    pub fn mic_gain_percent(&self) -> u32 {
        self.mic_gain_percent
    }

    pub fn set_mic_gain_percent(&mut self, percent: u32) -> bool {
        let normalized = percent.min(300);
        if self.mic_gain_percent == normalized {
            return false;
        }
        self.mic_gain_percent = normalized;
        true
    }

    pub fn speaker_gain_percent(&self) -> u32 {
        self.speaker_gain_percent
    }

    pub fn set_speaker_gain_percent(&mut self, percent: u32) -> bool {
        let normalized = percent.min(400);
        if self.speaker_gain_percent == normalized {
            return false;
        }
        self.speaker_gain_percent = normalized;
        true
    }

    pub fn noise_suppression_enabled(&self) -> bool {
        self.noise_suppression_enabled
    }

    pub fn set_noise_suppression_enabled(&mut self, enabled: bool) -> bool {
        if self.noise_suppression_enabled == enabled {
            return false;
        }
        self.noise_suppression_enabled = enabled;
        true
    }

    pub fn noise_suppression_level(&self) -> u8 {
        self.noise_suppression_level
    }

    pub fn set_noise_suppression_level(&mut self, level: u8) -> bool {
        let normalized = level.min(100);
        if self.noise_suppression_level == normalized {
            return false;
        }
        self.noise_suppression_level = normalized;
        true
    }

    pub fn keep_mic_always_on(&self) -> bool {
        self.keep_mic_always_on
    }

    pub fn set_keep_mic_always_on(&mut self, enabled: bool) -> bool {
        if self.keep_mic_always_on == enabled {
            return false;
        }
        self.keep_mic_always_on = enabled;
        true
    }

    pub fn codec2_library_path(&self) -> &str {
        &self.codec2_library_path
    }

    pub fn set_codec2_library_path(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.codec2_library_path == path {
            return false;
        }
        self.codec2_library_path = path;
        true
    }

    pub fn set_codec2_library_status(&mut self, loaded: bool, error: impl Into<String>) {
        let error = error.into();
        if self.codec2_library_loaded == loaded && self.codec2_library_error == error {
            return;
        }
        self.codec2_library_loaded = loaded;
        self.codec2_library_error = error.clone();
        self.emit(Signal::Codec2Library { loaded, error });
    }

    pub fn set_opus_status(&mut self, loaded: bool, error: impl Into<String>) {
        let error = error.into();
        if self.opus_loaded == loaded && self.opus_error == error {
            return;
        }
        self.opus_loaded = loaded;
        self.opus_error = error.clone();
        self.emit(Signal::OpusBackend { loaded, error });
    }

    pub fn emit_talk_denied(&self, talker_id: u32) {
        self.emit(Signal::TalkDenied(talker_id));
    }

    pub fn emit_channel_error(&self, message: impl Into<String>) {
        self.emit(Signal::ChannelError(message.into()));
    }

    pub fn emit_channel_configured(&self, channel_id: u32) {
        self.emit(Signal::ChannelConfigured { channel_id });
    }

    pub fn emit_server_activity(&self) {
        self.emit(Signal::ServerActivity);
    }

    pub fn emit_audio_frame(&self, pcm: Vec<u8>) {
        self.emit(Signal::AudioFrame(pcm));
    }
}
