use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use pttlink_audio::codec::CodecEngine;
use pttlink_audio::{pcm, AudioSink, JitterBuffer};
use pttlink_crypto::AeadCipher;
use pttlink_protocol::fec::FecDecoder;
use pttlink_protocol::messages::{self, CodecConfig};
use pttlink_protocol::{PacketType, Packetizer};
use tracing::{debug, info, trace};

use crate::transport::UdpTransport;

/// JOIN retry budget: one packet pair per second.
const JOIN_RETRY_ATTEMPTS: u32 = 5;
/// Consecutive concealment frames before the codec path goes silent.
const PLC_MAX_FRAMES: i32 = 3;

/// A validated channel target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub channel_id: u32,
    pub address: IpAddr,
    pub port: u16,
    pub password: String,
}

/// Validate and resolve the user-supplied channel settings. Hostnames
/// resolve preferring IPv4 (the socket binds v4-only).
pub async fn resolve_channel_config(
    channel_id: u32,
    address: &str,
    port: u16,
    password: &str,
) -> Result<ChannelConfig, String> {
    if channel_id == 0 {
        return Err("Invalid channel id".into());
    }
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err("Invalid server address".into());
    }
    if port == 0 {
        return Err("Invalid server port".into());
    }

    let address = match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((trimmed, port))
                .await
                .map_err(|_| "Failed to resolve server address".to_string())?
                .collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .map(|a| a.ip())
                .ok_or_else(|| "Failed to resolve server address".to_string())?
        }
    };

    Ok(ChannelConfig {
        channel_id,
        address,
        port,
        password: password.to_string(),
    })
}

/// Events the coordinator consumes after feeding the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// A valid datagram arrived from the (now) locked server endpoint.
    ServerActivity,
    /// The live target moved to the datagram's sender (relay/NAT).
    TargetChanged { address: IpAddr, port: u16 },
    TalkerChanged(u32),
    TalkReleaseDetected(u32),
    TalkReleasePlayoutCompleted(u32),
    TalkDenied(u32),
    HandshakeReceived(Vec<u8>),
    CodecConfigReceived { sender_id: u32, config: CodecConfig },
    /// A PCM frame was rendered to the sink.
    AudioFrame(Vec<u8>),
}

struct PlayoutState {
    primed: bool,
    frame_ms: u64,
    pcm_frame_bytes: usize,
    crossfade_samples: usize,
    silence: Vec<u8>,
    last_pcm: Vec<u8>,
    fade_from: Vec<u8>,
    fade_in_next: bool,
    fade_out_pending: bool,
    fade_out_frame: Vec<u8>,
    plc_remaining: i32,
    pcm_miss_count: u32,
    talk_ended: bool,
    release_talker_id: u32,
    silence_mode: bool,
}

impl PlayoutState {
    fn new() -> Self {
        Self {
            primed: false,
            frame_ms: 20,
            pcm_frame_bytes: pttlink_audio::PCM_FRAME_BYTES,
            crossfade_samples: 80,
            silence: pcm::silence(pttlink_audio::PCM_FRAME_BYTES),
            last_pcm: Vec::new(),
            fade_from: Vec::new(),
            fade_in_next: false,
            fade_out_pending: false,
            fade_out_frame: Vec::new(),
            plc_remaining: 0,
            pcm_miss_count: 0,
            talk_ended: false,
            release_talker_id: 0,
            silence_mode: false,
        }
    }

    /// Full reset for a new talker or stream restart.
    fn reset_stream(&mut self) {
        self.primed = false;
        self.last_pcm.clear();
        self.fade_from.clear();
        self.fade_out_pending = false;
        self.fade_out_frame.clear();
        self.silence_mode = false;
        self.plc_remaining = 0;
        self.pcm_miss_count = 0;
        self.talk_ended = false;
        self.release_talker_id = 0;
    }
}

/// Joins a channel, tracks the authoritative server endpoint and drives
/// the receive side: control dispatch, decrypt, FEC repair, jitter fill
/// and the playout state machine.
pub struct ChannelEngine {
    packetizer: Arc<Mutex<Packetizer>>,
    cipher: Arc<Mutex<AeadCipher>>,
    codec: Arc<CodecEngine>,
    transport: Arc<UdpTransport>,
    sink: Box<dyn AudioSink>,

    config: Option<ChannelConfig>,
    server_locked: bool,
    join_retries_left: u32,
    join_retry_active: bool,

    jitter: JitterBuffer,
    fec_enabled: bool,
    fec_decoder: FecDecoder,

    playout_timer_active: bool,
    playout: PlayoutState,
}

impl ChannelEngine {
    pub fn new(
        packetizer: Arc<Mutex<Packetizer>>,
        cipher: Arc<Mutex<AeadCipher>>,
        codec: Arc<CodecEngine>,
        transport: Arc<UdpTransport>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let mut engine = Self {
            packetizer,
            cipher,
            codec,
            transport,
            sink,
            config: None,
            server_locked: false,
            join_retries_left: 0,
            join_retry_active: false,
            jitter: JitterBuffer::new(),
            fec_enabled: false,
            fec_decoder: FecDecoder::new(),
            playout_timer_active: false,
            playout: PlayoutState::new(),
        };
        engine.update_playout_params();
        engine
    }

    pub fn channel_id(&self) -> u32 {
        self.config.as_ref().map(|c| c.channel_id).unwrap_or(0)
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.config
            .as_ref()
            .map(|c| SocketAddr::new(c.address, c.port))
    }

    pub fn is_joined(&self) -> bool {
        self.config.is_some()
    }

    pub fn join_retry_active(&self) -> bool {
        self.join_retry_active
    }

    pub fn playout_timer_active(&self) -> bool {
        self.playout_timer_active
    }

    pub fn playout_frame_ms(&self) -> u64 {
        self.playout.frame_ms.max(1)
    }

    /// Forward the speaker gain to the playback sink.
    pub fn set_sink_gain(&mut self, percent: u32) {
        self.sink.set_gain_percent(percent);
    }

    /// Receive-side FEC assist; parity from peers repairs the jitter
    /// stream regardless of the local TX setting.
    pub fn set_fec_enabled(&mut self, enabled: bool) {
        if self.fec_enabled == enabled {
            return;
        }
        self.fec_enabled = enabled;
        self.fec_decoder.set_enabled(enabled);
        self.fec_decoder.reset();
        self.playout.reset_stream();
        self.playout.fade_in_next = true;
        self.update_playout_params();
        self.jitter.clear();
    }

    /// Join a channel: reset stream state, announce ourselves with a
    /// modern JOIN plus a legacy-framed one for old relays, and start
    /// the retry timer.
    pub fn join_channel(&mut self, config: ChannelConfig) {
        {
            let mut packetizer = self.packetizer.lock().expect("packetizer lock");
            packetizer.set_channel_id(config.channel_id);
            packetizer.set_use_legacy(false);
        }

        info!(
            channel_id = config.channel_id,
            address = %config.address,
            port = config.port,
            "joining channel"
        );

        self.config = Some(config);
        self.server_locked = false;
        self.join_retries_left = JOIN_RETRY_ATTEMPTS;
        self.join_retry_active = true;
        self.playout.reset_stream();
        self.fec_decoder.reset();
        self.jitter.clear();

        self.send_join();
    }

    pub fn leave_channel(&mut self) {
        if let Some(config) = &self.config {
            let target = SocketAddr::new(config.address, config.port);
            let packet = self
                .packetizer
                .lock()
                .expect("packetizer lock")
                .pack_plain(PacketType::Leave, &[]);
            self.transport.send(&packet, target);
            info!(channel_id = config.channel_id, "left channel");
        }

        self.config = None;
        self.server_locked = false;
        self.join_retry_active = false;
        self.join_retries_left = 0;
        self.playout.reset_stream();
        self.fec_decoder.reset();
        self.jitter.clear();
        self.playout_timer_active = false;
    }

    fn send_join(&mut self) {
        let Some(config) = &self.config else {
            return;
        };
        let target = SocketAddr::new(config.address, config.port);

        let mut packetizer = self.packetizer.lock().expect("packetizer lock");
        let join = packetizer.pack_plain(PacketType::Join, &[]);
        self.transport.send(&join, target);
        if !packetizer.use_legacy() {
            let legacy_join = packetizer.pack_plain_legacy(PacketType::Join, &[]);
            self.transport.send(&legacy_join, target);
        }
    }

    /// JOIN retry timer tick (1 s cadence while unanswered).
    pub fn join_retry_tick(&mut self) {
        if self.server_locked || self.join_retries_left == 0 {
            self.join_retry_active = false;
            return;
        }
        self.send_join();
        self.join_retries_left -= 1;
    }

    /// Feed one received datagram through parse, endpoint lock and
    /// dispatch. Returned notices are handled by the coordinator.
    pub fn handle_datagram(&mut self, datagram: &[u8], sender: SocketAddr) -> Vec<ChannelNotice> {
        let parsed = match self
            .packetizer
            .lock()
            .expect("packetizer lock")
            .unpack(datagram)
        {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(from = %sender, "dropping malformed datagram: {e}");
                return Vec::new();
            }
        };

        let Some(config) = &mut self.config else {
            return Vec::new();
        };
        if parsed.header.channel_id != config.channel_id {
            return Vec::new();
        }

        // Peer talks legacy framing: fall back for everything we send.
        if parsed.header.is_legacy_framing() {
            let mut packetizer = self.packetizer.lock().expect("packetizer lock");
            if !packetizer.use_legacy() {
                info!("peer uses legacy framing, switching TX framing");
                packetizer.set_use_legacy(true);
            }
        }

        let mut notices = Vec::new();

        if self.server_locked {
            if sender.ip() != config.address {
                return Vec::new();
            }
        } else {
            let mut moved = false;
            if sender.ip() != config.address {
                config.address = sender.ip();
                moved = true;
            }
            if sender.port() != 0 && sender.port() != config.port {
                config.port = sender.port();
                moved = true;
            }
            self.server_locked = true;
            if moved {
                debug!(address = %config.address, port = config.port, "server endpoint locked");
                notices.push(ChannelNotice::TargetChanged {
                    address: config.address,
                    port: config.port,
                });
            }
        }

        self.join_retry_active = false;
        self.join_retries_left = 0;
        notices.push(ChannelNotice::ServerActivity);

        let Ok(packet_type) = PacketType::from_byte(parsed.header.packet_type) else {
            return notices;
        };

        match packet_type {
            PacketType::TalkGrant | PacketType::TalkRelease | PacketType::TalkDeny => {
                let mut talker =
                    messages::talker_id(&parsed.payload, parsed.header.sender_id);
                if packet_type == PacketType::TalkRelease {
                    self.playout.release_talker_id = talker;
                    notices.push(ChannelNotice::TalkReleaseDetected(talker));
                    talker = 0;
                }
                if talker != 0 {
                    // New talker: re-prime playout so stale frames from
                    // the previous stream never repeat.
                    self.playout.reset_stream();
                    self.fec_decoder.reset();
                    self.jitter.clear();
                } else {
                    // Talk ended: drain buffered frames, then stop.
                    self.playout.talk_ended = true;
                }
                notices.push(ChannelNotice::TalkerChanged(talker));
                if packet_type == PacketType::TalkDeny {
                    notices.push(ChannelNotice::TalkDenied(talker));
                }
            }
            PacketType::KeyExchange => {
                notices.push(ChannelNotice::HandshakeReceived(parsed.payload));
            }
            PacketType::CodecConfig => {
                if let Ok(config) = CodecConfig::from_bytes(&parsed.payload) {
                    notices.push(ChannelNotice::CodecConfigReceived {
                        sender_id: parsed.header.sender_id,
                        config,
                    });
                }
            }
            PacketType::Audio | PacketType::Fec => {
                self.handle_media_packet(packet_type, &parsed);
            }
            _ => {}
        }

        notices
    }

    fn handle_media_packet(
        &mut self,
        packet_type: PacketType,
        parsed: &pttlink_protocol::ParsedPacket,
    ) {
        let plaintext = {
            let cipher = self.cipher.lock().expect("cipher lock");
            match cipher.decrypt(&parsed.payload, &parsed.tag, parsed.sec.nonce, &[]) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    trace!(seq = parsed.header.seq, "dropping undecryptable media packet");
                    return;
                }
            }
        };

        if packet_type == PacketType::Fec {
            if !self.fec_enabled {
                return;
            }
            let Ok(payload) = messages::FecPayload::from_bytes(&plaintext) else {
                return;
            };
            let frames = self.fec_decoder.push_parity(
                payload.block_start,
                payload.block_size,
                payload.parity_index,
                &payload.parity,
            );
            let recovered = !frames.is_empty();
            for frame in frames {
                self.jitter.push_frame(frame.seq, frame.frame);
            }
            if recovered {
                self.playout_timer_active = true;
            }
            return;
        }

        self.playout.talk_ended = false;
        self.playout.release_talker_id = 0;

        let expected_frame = self.codec.frame_bytes();
        let (audio_seq, frame) =
            messages::split_audio_payload(&plaintext, expected_frame, parsed.header.seq);
        self.jitter.push_frame(audio_seq, frame.to_vec());

        if self.fec_enabled {
            for recovered in self.fec_decoder.push_data(audio_seq, frame) {
                self.jitter.push_frame(recovered.seq, recovered.frame);
            }
        }

        self.playout_timer_active = true;
    }

    /// Recompute frame geometry and the jitter depth after a codec or
    /// FEC change. Any geometry change fades the current stream out and
    /// re-primes.
    pub fn update_playout_params(&mut self) {
        let frame_ms = self.codec.frame_ms().max(1);
        let pcm_bytes = self.codec.pcm_frame_bytes().max(2);

        let changed =
            frame_ms != self.playout.frame_ms || pcm_bytes != self.playout.pcm_frame_bytes;
        self.playout.frame_ms = frame_ms;
        self.playout.pcm_frame_bytes = pcm_bytes;
        self.playout.silence = pcm::silence(pcm_bytes);
        let samples = pcm_bytes / 2;
        self.playout.crossfade_samples = 10.max(samples / 2);

        let mut target_buffer_ms: u64 = if cfg!(target_os = "android") { 160 } else { 80 };
        if self.codec.force_pcm() && !self.fec_enabled {
            target_buffer_ms = if cfg!(target_os = "android") { 260 } else { 200 };
        }
        let mut frames = (target_buffer_ms / frame_ms) as usize;
        if frames < 2 {
            frames = 2;
        }
        if self.fec_enabled {
            frames = frames.max(self.fec_decoder.block_size() + 2);
        }
        self.jitter.set_min_buffered_frames(frames);

        if changed {
            self.playout.primed = false;
            if !self.playout.last_pcm.is_empty() {
                self.playout.fade_out_pending = true;
                self.playout.fade_out_frame = self.playout.last_pcm.clone();
            } else {
                self.playout.fade_out_pending = false;
                self.playout.fade_out_frame.clear();
            }
            self.playout.last_pcm.clear();
            self.playout.fade_from.clear();
            self.playout.fade_in_next = true;
            self.playout.silence_mode = false;
            self.playout.plc_remaining = 0;
            self.playout.pcm_miss_count = 0;
            self.playout.talk_ended = false;
            self.playout.release_talker_id = 0;
            self.fec_decoder.reset();
            self.jitter.clear();
        }
    }

    fn render(&mut self, frame: Vec<u8>, notices: &mut Vec<ChannelNotice>) {
        self.sink.play_frame(&frame);
        notices.push(ChannelNotice::AudioFrame(frame));
    }

    /// One playout timer tick: exactly one PCM frame leaves (decoded,
    /// concealed or silence) once primed.
    pub fn playout_tick(&mut self) -> Vec<ChannelNotice> {
        let mut notices = Vec::new();

        if !self.playout.primed {
            if self.jitter.len() < self.jitter.min_buffered_frames() {
                return notices;
            }
            self.playout.primed = true;
        }

        if self.playout.fade_out_pending {
            let faded = pcm::crossfade(
                &self.playout.fade_out_frame,
                &self.playout.silence,
                self.playout.crossfade_samples,
            );
            self.render(faded, &mut notices);
            self.playout.fade_out_pending = false;
            self.playout.fade_out_frame.clear();
            self.playout.silence_mode = true;
            self.playout.plc_remaining = 0;
            self.playout.pcm_miss_count = 0;
            return notices;
        }

        let target_frames = self.jitter.min_buffered_frames();
        let size = self.jitter.len();
        let pcm_mode = self.codec.force_pcm();

        if self.playout.talk_ended && size == 0 {
            let released = self.playout.release_talker_id;
            if !self.playout.silence_mode && !self.playout.last_pcm.is_empty() {
                let faded = pcm::crossfade(
                    &self.playout.last_pcm,
                    &self.playout.silence,
                    self.playout.crossfade_samples,
                );
                self.render(faded, &mut notices);
            } else {
                let silence = self.playout.silence.clone();
                self.render(silence, &mut notices);
            }
            self.playout.silence_mode = true;
            self.playout.plc_remaining = 0;
            self.playout.pcm_miss_count = 0;
            self.playout.last_pcm.clear();
            self.playout.fade_from.clear();
            self.playout.talk_ended = false;
            self.playout.release_talker_id = 0;
            if released != 0 {
                notices.push(ChannelNotice::TalkReleasePlayoutCompleted(released));
            }
            return notices;
        }

        // Keep latency bounded: shed down to target without pitch change,
        // remembering a fade-from sample to hide the seam.
        let drop_margin = if self.fec_enabled || pcm_mode {
            self.fec_decoder.block_size() / 2 + 2
        } else {
            2
        };
        if size > target_frames + drop_margin {
            let mut last_dropped = Vec::new();
            while self.jitter.len() > target_frames + drop_margin {
                match self.jitter.pop_frame(false) {
                    Some(dropped) => last_dropped = dropped,
                    None => break,
                }
            }
            if !last_dropped.is_empty() {
                if !self.playout.last_pcm.is_empty() {
                    self.playout.fade_from = self.playout.last_pcm.clone();
                } else {
                    let dropped_pcm = self.codec.decode(&last_dropped);
                    if !dropped_pcm.is_empty() {
                        self.playout.fade_from = dropped_pcm;
                    }
                }
            }
        }

        let Some(encoded) = self.jitter.pop_frame(false) else {
            self.conceal_missing_frame(pcm_mode, &mut notices);
            return notices;
        };

        self.playout.pcm_miss_count = 0;
        if self.playout.silence_mode {
            self.playout.fade_in_next = true;
            self.playout.silence_mode = false;
        }
        self.playout.plc_remaining = 0;

        let mut frame = self.codec.decode(&encoded);
        if frame.is_empty() {
            frame = self.playout.silence.clone();
        }

        if !self.playout.fade_from.is_empty() {
            frame = pcm::blend_boundary(
                &self.playout.fade_from,
                &frame,
                self.playout.crossfade_samples,
            );
            self.playout.fade_from.clear();
        }
        if self.playout.fade_in_next {
            frame = pcm::crossfade(
                &self.playout.silence,
                &frame,
                self.playout.crossfade_samples,
            );
            self.playout.fade_in_next = false;
        }

        self.playout.last_pcm = frame.clone();
        self.render(frame, &mut notices);
        notices
    }

    /// The jitter buffer came up empty mid-stream: conceal, fade to
    /// silence, then stay silent.
    fn conceal_missing_frame(&mut self, pcm_mode: bool, notices: &mut Vec<ChannelNotice>) {
        if pcm_mode {
            if self.sink.queued_ms() > self.playout.frame_ms * 2 {
                // Output side still has buffered audio; no synthetic
                // frames yet.
                return;
            }
            self.playout.pcm_miss_count += 1;
            if self.playout.pcm_miss_count <= 1 && !self.playout.last_pcm.is_empty() {
                let plc = pcm::hold_decay_from_tail(&self.playout.last_pcm);
                self.render(plc, notices);
                return;
            }
            if !self.playout.silence_mode && !self.playout.last_pcm.is_empty() {
                let faded = pcm::crossfade(
                    &self.playout.last_pcm,
                    &self.playout.silence,
                    self.playout.crossfade_samples,
                );
                self.render(faded, notices);
                self.playout.silence_mode = true;
                self.playout.plc_remaining = 0;
                return;
            }
            self.playout.silence_mode = true;
            self.playout.plc_remaining = 0;
            let silence = self.playout.silence.clone();
            self.render(silence, notices);
            return;
        }

        if !self.playout.silence_mode {
            self.playout.silence_mode = true;
        }

        if !self.playout.last_pcm.is_empty() {
            if self.playout.plc_remaining == 0 {
                self.playout.plc_remaining = PLC_MAX_FRAMES;
            }
            if self.playout.plc_remaining > 0 {
                let gain = self.playout.plc_remaining as f32 / PLC_MAX_FRAMES.max(1) as f32;
                let plc = pcm::scale(&self.playout.last_pcm, gain);
                self.render(plc, notices);
                self.playout.plc_remaining -= 1;
                if self.playout.plc_remaining == 0 {
                    self.playout.plc_remaining = -1;
                }
                return;
            }
        }
        self.playout.plc_remaining = 0;

        let silence = self.playout.silence.clone();
        self.render(silence, notices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pttlink_audio::PCM_FRAME_BYTES;
    use pttlink_protocol::packet;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Collects rendered frames; no device.
    struct FakeSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        queued_ms: Arc<AtomicU64>,
    }

    impl AudioSink for FakeSink {
        fn play_frame(&mut self, pcm: &[u8]) {
            self.frames.lock().unwrap().push(pcm.to_vec());
        }
        fn queued_ms(&self) -> u64 {
            self.queued_ms.load(Ordering::Relaxed)
        }
    }

    struct Rig {
        engine: ChannelEngine,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        peer: Packetizer,
        peer_cipher: AeadCipher,
        server: SocketAddr,
    }

    fn shared_key() -> [u8; 32] {
        [0x42; 32]
    }

    fn rig() -> Rig {
        let transport = Arc::new(UdpTransport::bind(0).unwrap());

        let mut packetizer = Packetizer::new();
        packetizer.set_sender_id(42);
        packetizer.set_key_id(1);
        let packetizer = Arc::new(Mutex::new(packetizer));

        let mut cipher = AeadCipher::new();
        cipher.set_key(&shared_key(), &1u64.to_be_bytes());
        let cipher = Arc::new(Mutex::new(cipher));

        let codec = Arc::new(CodecEngine::new());

        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(FakeSink {
            frames: Arc::clone(&frames),
            queued_ms: Arc::new(AtomicU64::new(0)),
        });

        let mut engine = ChannelEngine::new(packetizer, cipher, codec, transport, sink);
        engine.set_fec_enabled(true);

        let server: SocketAddr = "192.0.2.10:4810".parse().unwrap();
        engine.join_channel(ChannelConfig {
            channel_id: 7,
            address: server.ip(),
            port: server.port(),
            password: "s3cret".into(),
        });

        let mut peer = Packetizer::new();
        peer.set_channel_id(7);
        peer.set_sender_id(99);
        peer.set_key_id(1);

        let mut peer_cipher = AeadCipher::new();
        peer_cipher.set_key(&shared_key(), &1000u64.to_be_bytes());

        Rig {
            engine,
            frames,
            peer,
            peer_cipher,
            server,
        }
    }

    fn pcm_frame(value: i16) -> Vec<u8> {
        (0..PCM_FRAME_BYTES / 2)
            .flat_map(|_| value.to_le_bytes())
            .collect()
    }

    fn audio_packet(rig: &mut Rig, audio_seq: u16, frame: &[u8]) -> Vec<u8> {
        let payload = messages::audio_payload(audio_seq, frame);
        let nonce = rig.peer_cipher.next_nonce();
        let (ct, tag) = rig.peer_cipher.encrypt(&payload, nonce, &[]).unwrap();
        rig.peer.pack(PacketType::Audio, &ct, &tag, nonce)
    }

    fn fec_packet(rig: &mut Rig, parity: &messages::FecPayload) -> Vec<u8> {
        let payload = parity.to_bytes();
        let nonce = rig.peer_cipher.next_nonce();
        let (ct, tag) = rig.peer_cipher.encrypt(&payload, nonce, &[]).unwrap();
        rig.peer.pack(PacketType::Fec, &ct, &tag, nonce)
    }

    fn prime_and_drain(rig: &mut Rig, ticks: usize) -> Vec<Vec<u8>> {
        for _ in 0..ticks {
            rig.engine.playout_tick();
        }
        std::mem::take(&mut *rig.frames.lock().unwrap())
    }

    #[test]
    fn first_datagram_locks_endpoint_and_reports_activity() {
        let mut rig = rig();
        let relay: SocketAddr = "198.51.100.7:9999".parse().unwrap();
        let packet = rig.peer.pack_plain(PacketType::Keepalive, &[]);

        let notices = rig.engine.handle_datagram(&packet, relay);
        assert!(notices.contains(&ChannelNotice::ServerActivity));
        assert!(notices.contains(&ChannelNotice::TargetChanged {
            address: relay.ip(),
            port: relay.port()
        }));
        assert_eq!(rig.engine.target(), Some(relay));
        assert!(!rig.engine.join_retry_active());

        // Once locked, datagrams from other endpoints are dropped.
        let stranger: SocketAddr = "203.0.113.5:1000".parse().unwrap();
        let packet = rig.peer.pack_plain(PacketType::Keepalive, &[]);
        assert!(rig.engine.handle_datagram(&packet, stranger).is_empty());
    }

    #[test]
    fn wrong_channel_id_is_dropped() {
        let mut rig = rig();
        rig.peer.set_channel_id(8);
        let packet = rig.peer.pack_plain(PacketType::Keepalive, &[]);
        assert!(rig.engine.handle_datagram(&packet, rig.server).is_empty());
    }

    #[test]
    fn legacy_peer_flips_tx_framing() {
        let mut rig = rig();
        rig.peer.set_use_legacy(true);
        let packet = rig.peer.pack_plain(PacketType::Join, &[]);
        rig.engine.handle_datagram(&packet, rig.server);
        assert!(rig.engine.packetizer.lock().unwrap().use_legacy());
    }

    #[test]
    fn encrypted_audio_reaches_playout() {
        let mut rig = rig();
        let min = rig.engine.jitter.min_buffered_frames();
        for seq in 0..min as u16 + 2 {
            let packet = audio_packet(&mut rig, seq, &pcm_frame(1000));
            rig.engine.handle_datagram(&packet, rig.server);
        }
        assert!(rig.engine.playout_timer_active());

        let rendered = prime_and_drain(&mut rig, 2);
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].len(), PCM_FRAME_BYTES);
        // Fade-in from silence, then the steady frame.
        assert_eq!(&rendered[1], &pcm_frame(1000));
    }

    #[test]
    fn tampered_audio_is_dropped_silently() {
        let mut rig = rig();
        let mut packet = audio_packet(&mut rig, 0, &pcm_frame(1000));
        let len = packet.len();
        packet[len - 1] ^= 0xFF;
        rig.engine.handle_datagram(&packet, rig.server);
        assert_eq!(rig.engine.jitter.len(), 0);
    }

    #[test]
    fn fec_parity_repairs_a_lost_frame() {
        let mut rig = rig();

        // Peer-side parity for two full blocks (frames 0..12).
        let mut encoder = pttlink_protocol::fec::FecEncoder::new();
        encoder.set_enabled(true);
        let frames: Vec<Vec<u8>> = (0..12i16).map(pcm_frame).collect();
        let mut parities = Vec::new();
        for (seq, frame) in frames.iter().enumerate() {
            parities.extend(encoder.add_frame(seq as u16, frame));
        }

        for (seq, frame) in frames.iter().enumerate() {
            if seq == 2 {
                continue; // lost in transit
            }
            let packet = audio_packet(&mut rig, seq as u16, frame);
            rig.engine.handle_datagram(&packet, rig.server);
        }
        assert_eq!(rig.engine.jitter.len(), 11);

        let parity = parities[0].clone();
        let packet = fec_packet(&mut rig, &parity);
        rig.engine.handle_datagram(&packet, rig.server);

        // Frame 2 was recovered into the jitter buffer; playout renders
        // the whole run with no concealment.
        assert_eq!(rig.engine.jitter.len(), 12);
        let rendered = prime_and_drain(&mut rig, 6);
        assert_eq!(rendered.len(), 6);
        assert_eq!(&rendered[2][..], &pcm_frame(2)[..]);
    }

    #[test]
    fn talk_grant_resets_stream_for_new_talker() {
        let mut rig = rig();
        for seq in 0..8u16 {
            let packet = audio_packet(&mut rig, seq, &pcm_frame(500));
            rig.engine.handle_datagram(&packet, rig.server);
        }
        prime_and_drain(&mut rig, 2);

        let grant = rig
            .peer
            .pack_plain(PacketType::TalkGrant, &messages::talker_id_bytes(1234));
        let notices = rig.engine.handle_datagram(&grant, rig.server);
        assert!(notices.contains(&ChannelNotice::TalkerChanged(1234)));
        assert_eq!(rig.engine.jitter.len(), 0);
        assert!(!rig.engine.playout.primed);
        assert!(rig.engine.playout.last_pcm.is_empty());
    }

    #[test]
    fn talk_release_drains_then_completes() {
        let mut rig = rig();
        let min = rig.engine.jitter.min_buffered_frames() as u16;
        for seq in 0..min {
            let packet = audio_packet(&mut rig, seq, &pcm_frame(700));
            rig.engine.handle_datagram(&packet, rig.server);
        }

        let release = rig
            .peer
            .pack_plain(PacketType::TalkRelease, &messages::talker_id_bytes(99));
        let notices = rig.engine.handle_datagram(&release, rig.server);
        assert!(notices.contains(&ChannelNotice::TalkReleaseDetected(99)));
        assert!(notices.contains(&ChannelNotice::TalkerChanged(0)));
        // Buffered audio is not flushed.
        assert_eq!(rig.engine.jitter.len(), min as usize);

        let mut completed = Vec::new();
        for _ in 0..min + 2 {
            completed.extend(rig.engine.playout_tick());
        }
        assert!(completed.contains(&ChannelNotice::TalkReleasePlayoutCompleted(99)));
    }

    #[test]
    fn talk_deny_reports_current_talker() {
        let mut rig = rig();
        let deny = rig
            .peer
            .pack_plain(PacketType::TalkDeny, &messages::talker_id_bytes(55));
        let notices = rig.engine.handle_datagram(&deny, rig.server);
        assert!(notices.contains(&ChannelNotice::TalkDenied(55)));
        assert!(notices.contains(&ChannelNotice::TalkerChanged(55)));
    }

    #[test]
    fn codec_config_notice_carries_parsed_payload() {
        let mut rig = rig();
        let payload = CodecConfig {
            force_pcm: true,
            codec_id: 0,
            mode: 1600,
        };
        let packet = rig
            .peer
            .pack_plain(PacketType::CodecConfig, &payload.to_bytes());
        let notices = rig.engine.handle_datagram(&packet, rig.server);
        assert!(notices.contains(&ChannelNotice::CodecConfigReceived {
            sender_id: 99,
            config: payload
        }));
    }

    #[test]
    fn playout_conceals_then_fades_to_silence() {
        let mut rig = rig();
        // PCM mode concealment: first miss decays the tail, second
        // crossfades to silence, later misses render silence.
        let min = rig.engine.jitter.min_buffered_frames() as u16;
        for seq in 0..min {
            let packet = audio_packet(&mut rig, seq, &pcm_frame(900));
            rig.engine.handle_datagram(&packet, rig.server);
        }
        let rendered = prime_and_drain(&mut rig, min as usize + 3);
        assert_eq!(rendered.len(), min as usize + 3);
        let tail = &rendered[rendered.len() - 1];
        assert!(tail.iter().all(|&b| b == 0), "steady state is silence");
    }

    #[test]
    fn drop_to_target_bounds_latency() {
        let mut rig = rig();
        let min = rig.engine.jitter.min_buffered_frames();
        let margin = rig.engine.fec_decoder.block_size() / 2 + 2;
        for seq in 0..(min + margin + 10) as u16 {
            let packet = audio_packet(&mut rig, seq, &pcm_frame(300));
            rig.engine.handle_datagram(&packet, rig.server);
        }
        rig.engine.playout_tick();
        // One frame rendered, the excess shed down to target + margin.
        assert_eq!(rig.engine.jitter.len(), min + margin - 1);
    }

    #[test]
    fn leave_sends_leave_packet_and_clears_state() {
        let mut rig = rig();
        let packet = rig.peer.pack_plain(PacketType::Keepalive, &[]);
        rig.engine.handle_datagram(&packet, rig.server);

        rig.engine.leave_channel();
        assert!(!rig.engine.is_joined());
        assert!(!rig.engine.playout_timer_active());
        assert_eq!(rig.engine.jitter.len(), 0);
    }

    #[test]
    fn join_retry_stops_after_budget() {
        let mut rig = rig();
        for _ in 0..JOIN_RETRY_ATTEMPTS {
            rig.engine.join_retry_tick();
            assert!(rig.engine.join_retry_active());
        }
        rig.engine.join_retry_tick();
        assert!(!rig.engine.join_retry_active());
    }

    #[test]
    fn plain_packet_parse_roundtrip_sanity() {
        // Guard against framing regressions between peer and engine.
        let mut rig = rig();
        let packet = rig.peer.pack_plain(PacketType::Join, &[]);
        let parsed = packet::parse_packet(&packet).unwrap();
        assert_eq!(parsed.header.channel_id, 7);
        assert_eq!(parsed.header.sender_id, 99);
    }
}
