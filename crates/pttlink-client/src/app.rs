use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pttlink_audio::capture::CaptureSettings;
use pttlink_audio::codec::{CodecEngine, CodecType};
use pttlink_audio::{pcm, AudioSink, MicSession};
use pttlink_crypto::{AeadCipher, KeyExchange, KeyExchangeEvent};
use pttlink_protocol::messages::CodecConfig;
use pttlink_protocol::packet::CodecTransportId;
use pttlink_protocol::{PacketType, Packetizer};
use rand::Rng;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, Instant as TokioInstant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

use crate::channel::{self, ChannelEngine, ChannelNotice};
use crate::config::AppConfig;
use crate::ptt::{PttNotice, PttScheduler};
use crate::state::{AppState, CodecSelection, Signal};
use crate::transport::UdpTransport;

/// Keepalive cadence toward the current target.
const KEEPALIVE_INTERVAL_MS: u64 = 5_000;
/// JOIN retry cadence while the server has not answered.
const JOIN_RETRY_INTERVAL_MS: u64 = 1_000;
/// CODEC_CONFIG rebroadcast cadence while transmitting.
const CODEC_CONFIG_INTERVAL_MS: u64 = 1_000;
/// Silence window after which the server counts as unresponsive.
const SERVER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(8);
/// Minimum spacing between identical handshake packets.
const HANDSHAKE_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Events delivered to the coordinator loop from adapters and the
/// command surface.
#[derive(Debug)]
pub enum Event {
    /// One PCM frame from the microphone session.
    MicFrame(Vec<u8>),
    /// Key-exchange output, delivered on the next loop turn.
    KeyExchange(KeyExchangeEvent),
    Command(Command),
}

/// User-facing commands (stdin surface, standing in for a UI).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ptt(bool),
    Join {
        channel_id: u32,
        address: String,
        port: u16,
        password: String,
    },
    JoinConfigured,
    Leave,
    SetCodec(CodecSelection),
    SetBitrate(u32),
    SetForcePcm(bool),
    SetFec(bool),
    SetQos(bool),
    SetMicGain(u32),
    SetSpeakerGain(u32),
    SetNoiseSuppression { enabled: bool, level: Option<u8> },
    SetKeepMicAlwaysOn(bool),
    SetCodec2LibraryPath(String),
    ListDevices,
    Status,
    Quit,
}

impl Command {
    /// Parse one command line. Returns `None` for blanks and unknown
    /// input (the caller prints usage).
    pub fn parse(line: &str) -> Option<Command> {
        let mut words = line.split_whitespace();
        let verb = words.next()?;
        let rest: Vec<&str> = words.collect();

        let on_off = |word: Option<&&str>| match word.copied() {
            Some("on") => Some(true),
            Some("off") => Some(false),
            _ => None,
        };

        match verb {
            "ptt" => on_off(rest.first()).map(Command::Ptt),
            "join" => {
                if rest.is_empty() {
                    return Some(Command::JoinConfigured);
                }
                let channel_id = rest.first()?.parse().ok()?;
                let address = rest.get(1)?.to_string();
                let port = rest.get(2)?.parse().ok()?;
                let password = rest.get(3).copied().unwrap_or("").to_string();
                Some(Command::Join {
                    channel_id,
                    address,
                    port,
                    password,
                })
            }
            "leave" => Some(Command::Leave),
            "codec" => match rest.first().copied() {
                Some("pcm") => Some(Command::SetCodec(CodecSelection::Pcm)),
                Some("codec2") => Some(Command::SetCodec(CodecSelection::Codec2)),
                Some("opus") => Some(Command::SetCodec(CodecSelection::Opus)),
                _ => None,
            },
            "bitrate" => rest.first()?.parse().ok().map(Command::SetBitrate),
            "forcepcm" => on_off(rest.first()).map(Command::SetForcePcm),
            "fec" => on_off(rest.first()).map(Command::SetFec),
            "qos" => on_off(rest.first()).map(Command::SetQos),
            "mic" => rest.first()?.parse().ok().map(Command::SetMicGain),
            "speaker" => rest.first()?.parse().ok().map(Command::SetSpeakerGain),
            "ns" => {
                let enabled = on_off(rest.first())?;
                let level = rest.get(1).and_then(|w| w.parse().ok());
                Some(Command::SetNoiseSuppression { enabled, level })
            }
            "keepmic" => on_off(rest.first()).map(Command::SetKeepMicAlwaysOn),
            "codec2lib" => rest
                .first()
                .map(|path| Command::SetCodec2LibraryPath(path.to_string())),
            "devices" => Some(Command::ListDevices),
            "status" => Some(Command::Status),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

fn periodic(ms: u64) -> Interval {
    let period = Duration::from_millis(ms.max(1));
    let mut interval = interval_at(TokioInstant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

type DeadlineTimer = (Instant, Pin<Box<Sleep>>);

struct Timers {
    keepalive: Interval,
    playout: Option<(Interval, u64)>,
    tx: Option<(Interval, u64)>,
    join_retry: Option<Interval>,
    codec_config: Option<Interval>,
    server_timeout: Option<DeadlineTimer>,
    input_idle: Option<DeadlineTimer>,
    tx_start: Option<DeadlineTimer>,
}

fn sync_deadline(current: Option<DeadlineTimer>, want: Option<Instant>) -> Option<DeadlineTimer> {
    match want {
        None => None,
        Some(deadline) => match current {
            Some((existing, sleep)) if existing == deadline => Some((existing, sleep)),
            _ => Some((
                deadline,
                Box::pin(tokio::time::sleep_until(TokioInstant::from_std(deadline))),
            )),
        },
    }
}

async fn maybe_tick(interval: Option<&mut (Interval, u64)>) {
    match interval {
        Some((interval, _)) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn maybe_interval(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn maybe_deadline(timer: Option<&mut DeadlineTimer>) {
    match timer {
        Some((_, sleep)) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Datagram(usize, SocketAddr),
    Event(Event),
    Keepalive,
    Playout,
    TxTick,
    JoinRetry,
    CodecConfigRefresh,
    ServerTimeout,
    InputIdle,
    TxStartDelay,
    Nothing,
}

/// The application coordinator: owns every component, runs the single
/// event loop and mediates between settings, the TX scheduler and the
/// channel engine.
pub struct App {
    config: AppConfig,
    settings_path: Option<PathBuf>,

    state: AppState,
    transport: Arc<UdpTransport>,
    packetizer: Arc<Mutex<Packetizer>>,
    cipher: Arc<Mutex<AeadCipher>>,
    tx_codec: Arc<CodecEngine>,
    rx_codec: Arc<CodecEngine>,
    key_exchange: KeyExchange,
    channel: ChannelEngine,
    ptt: PttScheduler,
    capture_settings: Arc<Mutex<CaptureSettings>>,

    events_tx: UnboundedSender<Event>,
    events_rx: UnboundedReceiver<Event>,
    timers: Timers,

    current_target: Option<SocketAddr>,
    server_timeout_deadline: Option<Instant>,
    tx_active: bool,

    last_sent_codec_config: Option<(SocketAddr, u16, u8)>,
    last_rx_codec_config: Option<(u32, u16, u8)>,
    last_handshake_payload: Vec<u8>,
    last_handshake_time: Option<Instant>,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        settings_path: Option<PathBuf>,
        signals: UnboundedSender<Signal>,
        events_tx: UnboundedSender<Event>,
        events_rx: UnboundedReceiver<Event>,
        mic: Box<dyn MicSession>,
        sink: Box<dyn AudioSink>,
        capture_settings: Arc<Mutex<CaptureSettings>>,
    ) -> Result<Self> {
        let mut state = AppState::new(signals);

        // Ephemeral local port; the relay tracks sender endpoints.
        let transport = match UdpTransport::bind(0) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                state.set_link_status(format!("Bind failed: {e}"));
                return Err(e).context("UDP bind failed");
            }
        };

        let cipher = Arc::new(Mutex::new(AeadCipher::new()));
        let packetizer = Arc::new(Mutex::new(Packetizer::new()));

        // The sender id is a nonzero 31-bit value; regenerate anything
        // out of range.
        let mut sender_id = config.sender_id;
        if sender_id == 0 || sender_id > 0x7FFF_FFFF {
            sender_id = rand::thread_rng().gen_range(1..0x7FFF_FFFFu32);
        }
        state.set_sender_id(sender_id);
        {
            let mut packetizer = packetizer.lock().expect("packetizer lock");
            packetizer.set_sender_id(sender_id);
            packetizer.set_key_id(cipher.lock().expect("cipher lock").key_id());
        }

        let tx_codec = Arc::new(CodecEngine::new());
        let rx_codec = Arc::new(CodecEngine::new());

        let channel = ChannelEngine::new(
            Arc::clone(&packetizer),
            Arc::clone(&cipher),
            Arc::clone(&rx_codec),
            Arc::clone(&transport),
            sink,
        );

        let ptt = PttScheduler::new(
            mic,
            Arc::clone(&tx_codec),
            Arc::clone(&cipher),
            Arc::clone(&packetizer),
            Arc::clone(&transport),
        );

        let timers = Timers {
            keepalive: periodic(KEEPALIVE_INTERVAL_MS),
            playout: None,
            tx: None,
            join_retry: None,
            codec_config: None,
            server_timeout: None,
            input_idle: None,
            tx_start: None,
        };

        let mut app = Self {
            config,
            settings_path,
            state,
            transport,
            packetizer,
            cipher,
            tx_codec,
            rx_codec,
            key_exchange: KeyExchange::new(),
            channel,
            ptt,
            capture_settings,
            events_tx,
            events_rx,
            timers,
            current_target: None,
            server_timeout_deadline: None,
            tx_active: false,
            last_sent_codec_config: None,
            last_rx_codec_config: None,
            last_handshake_payload: Vec::new(),
            last_handshake_time: None,
        };
        app.apply_initial_config();
        Ok(app)
    }

    pub fn events_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    fn apply_initial_config(&mut self) {
        let config = self.config.clone();

        self.state.set_codec_selection(config.codec_selection());
        self.state.set_codec_bitrate(config.bitrate);
        if config.force_pcm {
            self.state.set_force_pcm(true);
        }
        self.state.set_fec_enabled(config.fec_enabled);
        self.state.set_qos_enabled(config.qos_enabled);
        self.state.set_mic_gain_percent(config.mic_gain_percent);
        self.state
            .set_speaker_gain_percent(config.speaker_gain_percent);
        self.state
            .set_noise_suppression_enabled(config.noise_suppression_enabled);
        self.state
            .set_noise_suppression_level(config.noise_suppression_level);
        self.state.set_keep_mic_always_on(config.keep_mic_always_on);
        self.state
            .set_codec2_library_path(config.codec2_library_path.clone());
        self.state.set_crypto_mode(config.cipher_mode());

        self.tx_codec
            .set_codec2_library_path(&config.codec2_library_path);
        self.rx_codec
            .set_codec2_library_path(&config.codec2_library_path);
        self.apply_codec_settings();

        self.key_exchange.set_preferred_mode(self.state.crypto_mode());
        self.transport.set_qos_enabled(self.state.qos_enabled());

        // RX FEC assist stays on regardless of the TX setting: parity
        // from peers should always repair the stream.
        self.channel.set_fec_enabled(true);
        self.ptt.set_fec_enabled(self.state.fec_enabled());
        self.ptt
            .set_always_keep_input_session(self.state.keep_mic_always_on());

        self.channel.set_sink_gain(self.state.speaker_gain_percent());
        self.sync_capture_settings();
    }

    /// Push codec selection/mode into both engines and dependent state.
    fn apply_codec_settings(&mut self) {
        let selection = self.state.codec_selection();
        let bitrate = self.state.codec_bitrate();
        let force_pcm = self.state.force_pcm();

        let codec_type = match selection {
            CodecSelection::Opus => CodecType::Opus,
            _ => CodecType::Codec2,
        };
        self.tx_codec.set_codec_type(codec_type);
        self.tx_codec.set_mode(bitrate);
        self.tx_codec.set_force_pcm(force_pcm);
        self.rx_codec.set_codec_type(codec_type);
        self.rx_codec.set_mode(bitrate);
        self.rx_codec.set_force_pcm(force_pcm);

        let status = self.tx_codec.status();
        self.state
            .set_codec2_library_status(status.codec2_loaded, status.codec2_error);
        self.state.set_opus_status(status.opus_loaded, status.opus_error);

        self.channel.update_playout_params();
        self.sync_capture_settings();
    }

    fn sync_capture_settings(&mut self) {
        let mut settings = self.capture_settings.lock().expect("capture settings lock");
        settings.frame_bytes = self.tx_codec.pcm_frame_bytes();
        settings.gain_percent = self.state.mic_gain_percent();
        settings.noise_gate_enabled = self.state.noise_suppression_enabled();
        settings.noise_gate_level = self.state.noise_suppression_level();
    }

    /// Validate, resolve and join a channel; drives the key exchange and
    /// the server-response timer.
    pub async fn join_channel(
        &mut self,
        channel_id: u32,
        address: &str,
        port: u16,
        password: &str,
    ) -> bool {
        let config =
            match channel::resolve_channel_config(channel_id, address, port, password).await {
                Ok(config) => config,
                Err(message) => {
                    warn!(channel_id, address, "channel join rejected: {message}");
                    self.state.emit_channel_error(&message);
                    self.state.set_link_status(message);
                    self.drop_link_state();
                    return false;
                }
            };

        let target = SocketAddr::new(config.address, config.port);
        self.channel.join_channel(config);

        self.state.set_link_status("Connecting...");
        self.tx_active = false;
        self.state.set_server_online(false);
        self.state.set_talker_id(0);
        if self.state.set_ptt_pressed(false) {
            let notices = self.ptt.set_ptt_pressed(false);
            self.handle_ptt_notices(notices);
        }
        self.last_rx_codec_config = None;
        self.last_sent_codec_config = None;
        let notices = self.ptt.set_talk_allowed(false);
        self.handle_ptt_notices(notices);
        self.ptt.set_rx_hold_active(false);

        self.current_target = Some(target);
        self.ptt.set_target(Some(target));

        self.key_exchange.set_preferred_mode(self.state.crypto_mode());
        self.cipher.lock().expect("cipher lock").clear_key();
        self.key_exchange.set_channel_id(channel_id);
        self.key_exchange.set_password(password);
        for event in self.key_exchange.start_handshake() {
            let _ = self.events_tx.send(Event::KeyExchange(event));
        }

        self.server_timeout_deadline = Some(Instant::now() + SERVER_RESPONSE_TIMEOUT);
        self.send_codec_config(true);
        self.state.emit_channel_configured(channel_id);

        self.config.channel_id = channel_id;
        self.config.server_address = address.to_string();
        self.config.server_port = port;
        self.config.password = password.to_string();
        true
    }

    fn leave_channel(&mut self) {
        self.channel.leave_channel();
        self.current_target = None;
        self.ptt.set_target(None);
        self.server_timeout_deadline = None;
        self.state.set_link_status("Disconnected");
        self.drop_link_state();
    }

    /// Shared teardown when the link is lost or refused.
    fn drop_link_state(&mut self) {
        self.tx_active = false;
        self.state.set_server_online(false);
        self.state.set_talker_id(0);
        let notices = self.ptt.set_talk_allowed(false);
        self.handle_ptt_notices(notices);
        self.ptt.set_rx_hold_active(false);
    }

    /// Announce the TX codec, de-duplicated against the last sent
    /// `(target, mode, codec id)` tuple unless forced.
    fn send_codec_config(&mut self, force: bool) {
        let Some(target) = self.current_target else {
            return;
        };

        let codec_id = self.tx_codec.active_transport_id();
        let pcm_only = codec_id == CodecTransportId::Pcm;
        let mode = self.state.codec_bitrate() as u16;
        let key = (target, mode, codec_id as u8);
        if !force && self.last_sent_codec_config == Some(key) {
            return;
        }

        let payload = CodecConfig {
            force_pcm: pcm_only,
            codec_id: codec_id as u8,
            mode,
        }
        .to_bytes();
        let packet = self
            .packetizer
            .lock()
            .expect("packetizer lock")
            .pack_plain(PacketType::CodecConfig, &payload);
        self.transport.send(&packet, target);
        debug!(mode, codec_id = codec_id as u8, pcm_only, "codec config sent");

        self.last_sent_codec_config = Some(key);
    }

    /// Send a key-exchange handshake, rate-limited to one identical
    /// payload per second.
    fn send_handshake(&mut self, payload: &[u8]) {
        let Some(target) = self.current_target else {
            return;
        };
        if payload == self.last_handshake_payload.as_slice() {
            if let Some(last) = self.last_handshake_time {
                if last.elapsed() < HANDSHAKE_MIN_INTERVAL {
                    return;
                }
            }
        }

        let packet = self
            .packetizer
            .lock()
            .expect("packetizer lock")
            .pack_plain(PacketType::KeyExchange, payload);
        self.transport.send(&packet, target);
        self.last_handshake_payload = payload.to_vec();
        self.last_handshake_time = Some(Instant::now());
    }

    /// A CODEC_CONFIG from the current talker reconfigures the RX
    /// decoder only; local TX settings stay untouched.
    fn on_rx_codec_config(&mut self, sender_id: u32, config: CodecConfig) {
        let normalized_id = if config.force_pcm
            || config.codec_id == CodecTransportId::Pcm as u8
        {
            CodecTransportId::Pcm as u8
        } else if config.codec_id == CodecTransportId::Opus as u8 {
            CodecTransportId::Opus as u8
        } else {
            CodecTransportId::Codec2 as u8
        };

        let key = (sender_id, config.mode, normalized_id);
        if self.last_rx_codec_config == Some(key) {
            return;
        }

        info!(
            sender_id,
            mode = config.mode,
            codec_id = normalized_id,
            "applying peer codec config to RX"
        );
        if normalized_id == CodecTransportId::Opus as u8 {
            self.rx_codec.set_codec_type(CodecType::Opus);
        } else {
            self.rx_codec.set_codec_type(CodecType::Codec2);
        }
        self.rx_codec.set_mode(config.mode as u32);
        self.rx_codec
            .set_force_pcm(normalized_id == CodecTransportId::Pcm as u8);
        self.channel.update_playout_params();

        self.last_rx_codec_config = Some(key);
    }

    fn handle_ptt_notices(&mut self, notices: Vec<PttNotice>) {
        for notice in notices {
            match notice {
                PttNotice::TxStarted => {
                    self.tx_active = true;
                    self.state.set_link_status("TX");
                    self.send_codec_config(true);
                }
                PttNotice::TxStopped => {
                    self.tx_active = false;
                    if self.state.server_online() {
                        self.state.set_link_status("Ready");
                    } else if self.channel.is_joined() {
                        self.state.set_link_status("No response");
                    }
                }
            }
        }
    }

    fn handle_channel_notices(&mut self, notices: Vec<ChannelNotice>) {
        for notice in notices {
            match notice {
                ChannelNotice::ServerActivity => {
                    self.server_timeout_deadline = None;
                    self.state.emit_server_activity();
                    self.state.set_server_online(true);
                    if self.tx_active {
                        self.state.set_link_status("TX");
                    } else {
                        self.state.set_link_status("Ready");
                    }
                }
                ChannelNotice::TargetChanged { address, port } => {
                    let target = SocketAddr::new(address, port);
                    self.current_target = Some(target);
                    self.ptt.set_target(Some(target));
                    self.send_codec_config(false);
                }
                ChannelNotice::TalkerChanged(talker_id) => {
                    self.state.set_talker_id(talker_id);
                    let own_id = self.state.sender_id();
                    let notices = self.ptt.set_talk_allowed(talker_id == own_id);
                    self.handle_ptt_notices(notices);
                    if talker_id != 0 && talker_id != own_id {
                        self.ptt.set_rx_hold_active(true);
                    }
                }
                ChannelNotice::TalkReleaseDetected(talker_id) => {
                    debug!(talker_id, "talk release detected");
                }
                ChannelNotice::TalkReleasePlayoutCompleted(talker_id) => {
                    if talker_id != 0 && talker_id != self.state.sender_id() {
                        self.ptt.set_rx_hold_active(false);
                    }
                }
                ChannelNotice::TalkDenied(talker_id) => {
                    self.state.emit_talk_denied(talker_id);
                    self.state.set_link_status(format!("Busy: {talker_id}"));
                }
                ChannelNotice::HandshakeReceived(payload) => {
                    for event in self.key_exchange.process_handshake_packet(&payload) {
                        let _ = self.events_tx.send(Event::KeyExchange(event));
                    }
                }
                ChannelNotice::CodecConfigReceived { sender_id, config } => {
                    self.on_rx_codec_config(sender_id, config);
                }
                ChannelNotice::AudioFrame(frame) => {
                    self.state.set_rx_level(pcm::level(&frame));
                    self.state.emit_audio_frame(frame);
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::MicFrame(frame) => {
                self.state.set_tx_level(pcm::level(&frame));
                self.ptt.on_mic_frame(&frame);
            }
            Event::KeyExchange(KeyExchangeEvent::SessionKeyReady {
                key,
                nonce_base,
                mode,
            }) => {
                let mut cipher = self.cipher.lock().expect("cipher lock");
                cipher.set_key(&key, &nonce_base);
                cipher.set_mode(mode);
                debug!(?mode, "session key installed");
            }
            Event::KeyExchange(KeyExchangeEvent::HandshakePacket(payload)) => {
                self.send_handshake(&payload);
            }
            Event::Command(command) => return self.handle_command(command),
        }
        false
    }

    /// Returns `true` when the app should shut down. Join commands are
    /// intercepted by `run()` (they resolve asynchronously).
    fn handle_command(&mut self, command: Command) -> bool {
        debug!(?command, "command");
        match command {
            Command::Ptt(pressed) => {
                if self.state.set_ptt_pressed(pressed) {
                    let notices = self.ptt.set_ptt_pressed(pressed);
                    self.handle_ptt_notices(notices);
                }
            }
            Command::Leave => self.leave_channel(),
            Command::SetCodec(selection) => {
                if self.state.set_codec_selection(selection) {
                    self.apply_codec_settings();
                    self.send_codec_config(true);
                }
            }
            Command::SetBitrate(bitrate) => {
                if self.state.set_codec_bitrate(bitrate) {
                    self.apply_codec_settings();
                    self.send_codec_config(false);
                }
            }
            Command::SetForcePcm(force) => {
                if self.state.set_force_pcm(force) {
                    self.apply_codec_settings();
                    self.send_codec_config(false);
                }
            }
            Command::SetFec(enabled) => {
                if self.state.set_fec_enabled(enabled) {
                    self.ptt.set_fec_enabled(enabled);
                }
            }
            Command::SetQos(enabled) => {
                if self.state.set_qos_enabled(enabled) {
                    self.transport.set_qos_enabled(enabled);
                }
            }
            Command::SetMicGain(percent) => {
                if self.state.set_mic_gain_percent(percent) {
                    self.sync_capture_settings();
                }
            }
            Command::SetSpeakerGain(percent) => {
                if self.state.set_speaker_gain_percent(percent) {
                    self.channel.set_sink_gain(self.state.speaker_gain_percent());
                }
            }
            Command::SetNoiseSuppression { enabled, level } => {
                self.state.set_noise_suppression_enabled(enabled);
                if let Some(level) = level {
                    self.state.set_noise_suppression_level(level);
                }
                self.sync_capture_settings();
            }
            Command::SetKeepMicAlwaysOn(enabled) => {
                if self.state.set_keep_mic_always_on(enabled) {
                    self.ptt.set_always_keep_input_session(enabled);
                }
            }
            Command::SetCodec2LibraryPath(path) => {
                if self.state.set_codec2_library_path(path.clone()) {
                    self.tx_codec.set_codec2_library_path(&path);
                    self.rx_codec.set_codec2_library_path(&path);
                    self.config.codec2_library_path = path;
                    self.apply_codec_settings();
                }
            }
            Command::ListDevices => {
                match pttlink_audio::device::list_input_devices() {
                    Ok(devices) => {
                        for device in devices {
                            info!(name = %device.name, default = device.is_default, "input device");
                        }
                    }
                    Err(e) => warn!("failed to enumerate input devices: {e:#}"),
                }
                match pttlink_audio::device::list_output_devices() {
                    Ok(devices) => {
                        for device in devices {
                            info!(name = %device.name, default = device.is_default, "output device");
                        }
                    }
                    Err(e) => warn!("failed to enumerate output devices: {e:#}"),
                }
            }
            Command::Status => {
                info!(
                    link = self.state.link_status(),
                    online = self.state.server_online(),
                    talker = self.state.talker_id(),
                    channel = self.channel.channel_id(),
                    codec = ?self.state.codec_selection(),
                    bitrate = self.state.codec_bitrate(),
                    "status"
                );
            }
            Command::Quit => {
                self.channel.leave_channel();
                self.persist_settings();
                return true;
            }
            Command::Join { .. } | Command::JoinConfigured => {}
        }
        false
    }

    fn persist_settings(&mut self) {
        let Some(path) = self.settings_path.clone() else {
            return;
        };
        let snapshot = self.snapshot_config();
        match snapshot.save_json(&path) {
            Ok(_) => info!(path = %path.display(), "settings saved"),
            Err(e) => warn!("failed to save settings: {e:#}"),
        }
    }

    /// Mirror the live state back into a persistable settings map.
    fn snapshot_config(&self) -> AppConfig {
        let mut config = self.config.clone();
        config.sender_id = self.state.sender_id();
        config.codec = match self.state.codec_selection() {
            CodecSelection::Pcm => "pcm".into(),
            CodecSelection::Codec2 => "codec2".into(),
            CodecSelection::Opus => "opus".into(),
        };
        config.bitrate = self.state.codec_bitrate();
        config.force_pcm = self.state.force_pcm();
        config.fec_enabled = self.state.fec_enabled();
        config.qos_enabled = self.state.qos_enabled();
        config.keep_mic_always_on = self.state.keep_mic_always_on();
        config.mic_gain_percent = self.state.mic_gain_percent();
        config.speaker_gain_percent = self.state.speaker_gain_percent();
        config.noise_suppression_enabled = self.state.noise_suppression_enabled();
        config.noise_suppression_level = self.state.noise_suppression_level();
        config
    }

    fn sync_timers(&mut self) {
        if self.channel.playout_timer_active() {
            let ms = self.channel.playout_frame_ms();
            let stale = !matches!(&self.timers.playout, Some((_, current)) if *current == ms);
            if stale {
                self.timers.playout = Some((periodic(ms), ms));
            }
        } else {
            self.timers.playout = None;
        }

        if self.ptt.tx_timer_active() {
            let ms = self.ptt.tx_interval_ms();
            let stale = !matches!(&self.timers.tx, Some((_, current)) if *current == ms);
            if stale {
                self.timers.tx = Some((periodic(ms), ms));
            }
        } else {
            self.timers.tx = None;
        }

        if self.channel.join_retry_active() {
            if self.timers.join_retry.is_none() {
                self.timers.join_retry = Some(periodic(JOIN_RETRY_INTERVAL_MS));
            }
        } else {
            self.timers.join_retry = None;
        }

        if self.tx_active {
            if self.timers.codec_config.is_none() {
                self.timers.codec_config = Some(periodic(CODEC_CONFIG_INTERVAL_MS));
            }
        } else {
            self.timers.codec_config = None;
        }

        self.timers.server_timeout =
            sync_deadline(self.timers.server_timeout.take(), self.server_timeout_deadline);
        self.timers.input_idle =
            sync_deadline(self.timers.input_idle.take(), self.ptt.input_idle_deadline());
        self.timers.tx_start =
            sync_deadline(self.timers.tx_start.take(), self.ptt.tx_start_deadline());
    }

    /// Run the coordinator loop until a quit command arrives.
    pub async fn run(mut self) -> Result<()> {
        if self.config.channel_id != 0
            && !self.config.server_address.is_empty()
            && self.config.server_port != 0
        {
            let (channel_id, address, port, password) = (
                self.config.channel_id,
                self.config.server_address.clone(),
                self.config.server_port,
                self.config.password.clone(),
            );
            self.join_channel(channel_id, &address, port, &password).await;
        }

        let mut buf = vec![0u8; 2048];
        loop {
            self.sync_timers();

            let wake = tokio::select! {
                result = self.transport.recv_from(&mut buf) => match result {
                    Ok((len, from)) => Wake::Datagram(len, from),
                    Err(e) => {
                        warn!("UDP recv error: {e}");
                        Wake::Nothing
                    }
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::Nothing,
                },
                _ = self.timers.keepalive.tick() => Wake::Keepalive,
                _ = maybe_tick(self.timers.playout.as_mut()) => Wake::Playout,
                _ = maybe_tick(self.timers.tx.as_mut()) => Wake::TxTick,
                _ = maybe_interval(self.timers.join_retry.as_mut()) => Wake::JoinRetry,
                _ = maybe_interval(self.timers.codec_config.as_mut()) => Wake::CodecConfigRefresh,
                _ = maybe_deadline(self.timers.server_timeout.as_mut()) => Wake::ServerTimeout,
                _ = maybe_deadline(self.timers.input_idle.as_mut()) => Wake::InputIdle,
                _ = maybe_deadline(self.timers.tx_start.as_mut()) => Wake::TxStartDelay,
            };

            match wake {
                Wake::Datagram(len, from) => {
                    let notices = self.channel.handle_datagram(&buf[..len], from);
                    self.handle_channel_notices(notices);
                }
                Wake::Event(Event::Command(Command::Join {
                    channel_id,
                    address,
                    port,
                    password,
                })) => {
                    self.join_channel(channel_id, &address, port, &password).await;
                }
                Wake::Event(Event::Command(Command::JoinConfigured)) => {
                    let (channel_id, address, port, password) = (
                        self.config.channel_id,
                        self.config.server_address.clone(),
                        self.config.server_port,
                        self.config.password.clone(),
                    );
                    self.join_channel(channel_id, &address, port, &password).await;
                }
                Wake::Event(event) => {
                    if self.handle_event(event) {
                        return Ok(());
                    }
                }
                Wake::Keepalive => {
                    if let Some(target) = self.current_target {
                        let packet = self
                            .packetizer
                            .lock()
                            .expect("packetizer lock")
                            .pack_plain(PacketType::Keepalive, &[]);
                        self.transport.send(&packet, target);
                    }
                }
                Wake::Playout => {
                    let notices = self.channel.playout_tick();
                    self.handle_channel_notices(notices);
                }
                Wake::TxTick => {
                    let notices = self.ptt.tx_tick();
                    self.handle_ptt_notices(notices);
                }
                Wake::JoinRetry => self.channel.join_retry_tick(),
                Wake::CodecConfigRefresh => self.send_codec_config(true),
                Wake::ServerTimeout => {
                    self.server_timeout_deadline = None;
                    warn!("no response from server");
                    self.state.set_link_status("No response");
                    self.drop_link_state();
                }
                Wake::InputIdle => self.ptt.input_idle_elapsed(),
                Wake::TxStartDelay => {
                    let notices = self.ptt.tx_start_delay_elapsed();
                    self.handle_ptt_notices(notices);
                }
                Wake::Nothing => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_commands() {
        assert_eq!(Command::parse("ptt on"), Some(Command::Ptt(true)));
        assert_eq!(Command::parse("ptt off"), Some(Command::Ptt(false)));
        assert_eq!(Command::parse("leave"), Some(Command::Leave));
        assert_eq!(Command::parse("quit"), Some(Command::Quit));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("join"), Some(Command::JoinConfigured));
    }

    #[test]
    fn parses_join_with_arguments() {
        assert_eq!(
            Command::parse("join 7 relay.example.net 4810 s3cret"),
            Some(Command::Join {
                channel_id: 7,
                address: "relay.example.net".into(),
                port: 4810,
                password: "s3cret".into(),
            })
        );
        // Password is optional.
        assert_eq!(
            Command::parse("join 7 10.0.0.1 4810"),
            Some(Command::Join {
                channel_id: 7,
                address: "10.0.0.1".into(),
                port: 4810,
                password: String::new(),
            })
        );
        assert_eq!(Command::parse("join 7 host"), None);
    }

    #[test]
    fn parses_settings_commands() {
        assert_eq!(
            Command::parse("codec opus"),
            Some(Command::SetCodec(CodecSelection::Opus))
        );
        assert_eq!(Command::parse("bitrate 2400"), Some(Command::SetBitrate(2400)));
        assert_eq!(Command::parse("fec off"), Some(Command::SetFec(false)));
        assert_eq!(Command::parse("qos on"), Some(Command::SetQos(true)));
        assert_eq!(Command::parse("mic 150"), Some(Command::SetMicGain(150)));
        assert_eq!(
            Command::parse("ns on 70"),
            Some(Command::SetNoiseSuppression {
                enabled: true,
                level: Some(70)
            })
        );
    }

    #[test]
    fn rejects_unknown_input() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("dance"), None);
        assert_eq!(Command::parse("codec speex"), None);
        assert_eq!(Command::parse("ptt maybe"), None);
    }
}
