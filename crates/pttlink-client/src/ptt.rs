use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pttlink_audio::codec::CodecEngine;
use pttlink_audio::MicSession;
use pttlink_crypto::AeadCipher;
use pttlink_protocol::fec::FecEncoder;
use pttlink_protocol::messages;
use pttlink_protocol::{PacketType, Packetizer};
use tracing::{debug, trace, warn};

use crate::transport::UdpTransport;

/// Bounded TX queue: under backpressure the oldest frames drop first.
const TX_QUEUE_MAX_FRAMES: usize = 12;

/// Mic session stop delay once nothing needs it anymore.
const INPUT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// State changes the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttNotice {
    TxStarted,
    TxStopped,
}

/// Owns the microphone lifecycle and the transmit cadence.
///
/// While PTT is held and the channel has granted talk, encoded frames
/// leave at the codec frame interval as encrypted AUDIO packets with
/// FEC parity as a side product. Release drains the queue before the
/// PTT_OFF goes out. Timer needs are exposed as state (`tx_timer_active`
/// plus deadlines) that the coordinator maps onto its event loop.
pub struct PttScheduler {
    mic: Box<dyn MicSession>,
    codec: Arc<CodecEngine>,
    cipher: Arc<Mutex<AeadCipher>>,
    packetizer: Arc<Mutex<Packetizer>>,
    transport: Arc<UdpTransport>,

    target: Option<SocketAddr>,
    ptt_pressed: bool,
    talk_allowed: bool,
    pending_ptt_off: bool,
    always_keep_input: bool,
    rx_hold_active: bool,

    fec: FecEncoder,
    audio_seq: u16,
    tx_queue: VecDeque<Vec<u8>>,

    tx_timer_active: bool,
    tx_interval_ms: u64,
    start_guard_ms: u64,
    press_time: Option<Instant>,
    tx_start_deadline: Option<Instant>,
    input_idle_deadline: Option<Instant>,
}

impl PttScheduler {
    pub fn new(
        mic: Box<dyn MicSession>,
        codec: Arc<CodecEngine>,
        cipher: Arc<Mutex<AeadCipher>>,
        packetizer: Arc<Mutex<Packetizer>>,
        transport: Arc<UdpTransport>,
    ) -> Self {
        Self {
            mic,
            codec,
            cipher,
            packetizer,
            transport,
            target: None,
            ptt_pressed: false,
            talk_allowed: false,
            pending_ptt_off: false,
            always_keep_input: false,
            rx_hold_active: false,
            fec: FecEncoder::new(),
            audio_seq: 0,
            tx_queue: VecDeque::new(),
            tx_timer_active: false,
            tx_interval_ms: 20,
            start_guard_ms: 0,
            press_time: None,
            tx_start_deadline: None,
            input_idle_deadline: None,
        }
    }

    // ── timer state for the coordinator ──────────────────────────────

    pub fn tx_timer_active(&self) -> bool {
        self.tx_timer_active
    }

    pub fn tx_interval_ms(&self) -> u64 {
        self.tx_interval_ms.max(1)
    }

    pub fn tx_start_deadline(&self) -> Option<Instant> {
        self.tx_start_deadline
    }

    pub fn input_idle_deadline(&self) -> Option<Instant> {
        self.input_idle_deadline
    }

    // ── settings ─────────────────────────────────────────────────────

    pub fn set_target(&mut self, target: Option<SocketAddr>) {
        self.target = target;
    }

    pub fn set_fec_enabled(&mut self, enabled: bool) {
        if self.fec.enabled() == enabled {
            return;
        }
        self.fec.set_enabled(enabled);
        self.fec.reset();
        self.audio_seq = 0;
    }

    pub fn set_start_guard_ms(&mut self, guard_ms: u64) {
        self.start_guard_ms = guard_ms;
    }

    pub fn set_always_keep_input_session(&mut self, enabled: bool) {
        if self.always_keep_input == enabled {
            return;
        }
        self.always_keep_input = enabled;
        if enabled {
            self.input_idle_deadline = None;
            self.mic.ensure_started();
        } else {
            self.schedule_input_idle_stop();
        }
    }

    /// Keep the mic session warm while a remote talker is active, so a
    /// reply press does not pay the session start latency.
    pub fn set_rx_hold_active(&mut self, active: bool) {
        if self.rx_hold_active == active {
            return;
        }
        self.rx_hold_active = active;
        if active {
            self.input_idle_deadline = None;
            self.mic.ensure_started();
        } else {
            self.schedule_input_idle_stop();
        }
    }

    // ── PTT state machine ────────────────────────────────────────────

    pub fn ptt_pressed(&self) -> bool {
        self.ptt_pressed
    }

    pub fn set_ptt_pressed(&mut self, pressed: bool) -> Vec<PttNotice> {
        if self.ptt_pressed == pressed {
            return Vec::new();
        }
        self.ptt_pressed = pressed;

        if !pressed {
            self.tx_start_deadline = None;
            // Drain queued TX audio first; PTT_OFF goes out afterwards.
            self.pending_ptt_off = true;
            self.tx_timer_active = true;
            let notices = if self.tx_queue.is_empty() {
                self.tx_tick()
            } else {
                Vec::new()
            };
            self.schedule_input_idle_stop();
            return notices;
        }

        self.input_idle_deadline = None;
        self.mic.ensure_started();
        self.pending_ptt_off = false;
        self.send_plain(PacketType::PttOn);
        self.press_time = Some(Instant::now());
        self.try_start_tx()
    }

    pub fn set_talk_allowed(&mut self, allowed: bool) -> Vec<PttNotice> {
        if self.talk_allowed == allowed {
            return Vec::new();
        }
        self.talk_allowed = allowed;

        if self.ptt_pressed && self.talk_allowed {
            self.pending_ptt_off = false;
            return self.try_start_tx();
        }

        self.tx_start_deadline = None;

        // A pending release keeps the timer alive until the queue drains.
        if !self.ptt_pressed && self.pending_ptt_off {
            self.tx_timer_active = true;
            if self.tx_queue.is_empty() {
                return self.tx_tick();
            }
            return Vec::new();
        }

        self.pending_ptt_off = false;
        self.tx_timer_active = false;
        self.tx_queue.clear();
        self.fec.reset();
        self.audio_seq = 0;
        self.schedule_input_idle_stop();
        vec![PttNotice::TxStopped]
    }

    /// The delayed-start timer elapsed.
    pub fn tx_start_delay_elapsed(&mut self) -> Vec<PttNotice> {
        self.tx_start_deadline = None;
        self.try_start_tx()
    }

    fn try_start_tx(&mut self) -> Vec<PttNotice> {
        if !self.ptt_pressed || !self.talk_allowed {
            return Vec::new();
        }

        self.input_idle_deadline = None;

        if self.start_guard_ms > 0 {
            if let Some(pressed_at) = self.press_time {
                let guard = Duration::from_millis(self.start_guard_ms);
                if pressed_at.elapsed() < guard {
                    self.tx_start_deadline = Some(pressed_at + guard);
                    return Vec::new();
                }
            }
        }

        self.tx_start_deadline = None;
        self.mic.ensure_started();
        if !self.mic.is_running() {
            return Vec::new();
        }

        self.tx_interval_ms = self.codec.frame_ms().max(1);
        self.tx_queue.clear();
        self.fec.reset();
        self.audio_seq = 0;
        self.tx_timer_active = true;
        debug!(interval_ms = self.tx_interval_ms, "TX started");
        vec![PttNotice::TxStarted]
    }

    /// A PCM frame arrived from the mic session.
    pub fn on_mic_frame(&mut self, pcm: &[u8]) {
        if !self.ptt_pressed || !self.talk_allowed {
            return;
        }
        if !self.cipher.lock().expect("cipher lock").is_ready() {
            return;
        }

        let codec_frame = self.codec.encode(pcm);

        let frame_ms = self.codec.frame_ms();
        if frame_ms > 0 && self.tx_interval_ms != frame_ms {
            self.tx_interval_ms = frame_ms;
        }

        self.tx_queue.push_back(codec_frame);
        while self.tx_queue.len() > TX_QUEUE_MAX_FRAMES {
            self.tx_queue.pop_front();
        }

        self.tx_timer_active = true;
    }

    /// One TX timer tick: send one queued frame, or finish a pending
    /// release once the queue is dry.
    pub fn tx_tick(&mut self) -> Vec<PttNotice> {
        let can_send_audio =
            self.talk_allowed && self.cipher.lock().expect("cipher lock").is_ready();

        if can_send_audio {
            if let Some(frame) = self.tx_queue.pop_front() {
                self.send_codec_frame(&frame);
                return Vec::new();
            }
        }

        if self.pending_ptt_off {
            // Anything still queued can no longer be sent; drop and finish.
            self.tx_queue.clear();
            self.send_plain(PacketType::PttOff);
            self.pending_ptt_off = false;
            self.tx_timer_active = false;
            self.fec.reset();
            self.audio_seq = 0;
            debug!("TX stopped");
            self.schedule_input_idle_stop();
            return vec![PttNotice::TxStopped];
        }

        if !self.ptt_pressed && self.tx_queue.is_empty() {
            self.tx_timer_active = false;
            self.schedule_input_idle_stop();
        }
        Vec::new()
    }

    /// The mic idle timer elapsed.
    pub fn input_idle_elapsed(&mut self) {
        self.input_idle_deadline = None;
        if self.always_keep_input
            || self.rx_hold_active
            || self.ptt_pressed
            || self.pending_ptt_off
            || self.tx_timer_active
        {
            return;
        }
        self.mic.stop();
    }

    fn schedule_input_idle_stop(&mut self) {
        if self.always_keep_input {
            self.input_idle_deadline = None;
            self.mic.ensure_started();
            return;
        }
        if self.rx_hold_active || self.ptt_pressed || self.pending_ptt_off || self.tx_timer_active
        {
            self.input_idle_deadline = None;
            return;
        }
        if !self.mic.is_running() {
            return;
        }
        self.input_idle_deadline = Some(Instant::now() + INPUT_IDLE_TIMEOUT);
    }

    fn send_plain(&self, packet_type: PacketType) {
        let Some(target) = self.target else {
            return;
        };
        let packet = self
            .packetizer
            .lock()
            .expect("packetizer lock")
            .pack_plain(packet_type, &[]);
        self.transport.send(&packet, target);
    }

    fn send_codec_frame(&mut self, codec_frame: &[u8]) {
        let payload = messages::audio_payload(self.audio_seq, codec_frame);

        let (nonce, encrypted) = {
            let mut cipher = self.cipher.lock().expect("cipher lock");
            let nonce = cipher.next_nonce();
            (nonce, cipher.encrypt(&payload, nonce, &[]))
        };
        let (ciphertext, tag) = match encrypted {
            Ok(result) => result,
            Err(e) => {
                warn!("audio encrypt failed: {e}");
                return;
            }
        };

        let packet = self
            .packetizer
            .lock()
            .expect("packetizer lock")
            .pack(PacketType::Audio, &ciphertext, &tag, nonce);
        if let Some(target) = self.target {
            self.transport.send(&packet, target);
        }
        trace!(audio_seq = self.audio_seq, bytes = packet.len(), "audio frame sent");

        if self.fec.enabled() {
            for parity in self.fec.add_frame(self.audio_seq, codec_frame) {
                let fec_payload = parity.to_bytes();
                let (fec_nonce, fec_encrypted) = {
                    let mut cipher = self.cipher.lock().expect("cipher lock");
                    let nonce = cipher.next_nonce();
                    (nonce, cipher.encrypt(&fec_payload, nonce, &[]))
                };
                let Ok((fec_ct, fec_tag)) = fec_encrypted else {
                    continue;
                };
                let fec_packet = self
                    .packetizer
                    .lock()
                    .expect("packetizer lock")
                    .pack(PacketType::Fec, &fec_ct, &fec_tag, fec_nonce);
                if let Some(target) = self.target {
                    self.transport.send(&fec_packet, target);
                }
            }
        }

        self.audio_seq = self.audio_seq.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pttlink_protocol::packet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{timeout, Duration as TokioDuration};

    struct FakeMic {
        running: Arc<AtomicBool>,
    }

    impl MicSession for FakeMic {
        fn ensure_started(&mut self) {
            self.running.store(true, Ordering::Relaxed);
        }
        fn stop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Relaxed)
        }
    }

    struct Rig {
        scheduler: PttScheduler,
        receiver: Arc<UdpTransport>,
        mic_running: Arc<AtomicBool>,
    }

    fn rig() -> Rig {
        let receiver = Arc::new(UdpTransport::bind(0).unwrap());
        let transport = Arc::new(UdpTransport::bind(0).unwrap());

        let mic_running = Arc::new(AtomicBool::new(false));
        let mic = Box::new(FakeMic {
            running: Arc::clone(&mic_running),
        });

        let codec = Arc::new(CodecEngine::new());
        let mut cipher = AeadCipher::new();
        cipher.set_key(&[9u8; 32], &1u64.to_be_bytes());
        let cipher = Arc::new(Mutex::new(cipher));

        let mut packetizer = Packetizer::new();
        packetizer.set_channel_id(7);
        packetizer.set_sender_id(42);
        packetizer.set_key_id(1);
        let packetizer = Arc::new(Mutex::new(packetizer));

        let mut scheduler = PttScheduler::new(mic, codec, cipher, packetizer, transport);
        let target: SocketAddr = format!("127.0.0.1:{}", receiver.local_port())
            .parse()
            .unwrap();
        scheduler.set_target(Some(target));

        Rig {
            scheduler,
            receiver,
            mic_running,
        }
    }

    async fn recv_type(receiver: &UdpTransport) -> u8 {
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(TokioDuration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("timed out waiting for packet")
            .unwrap();
        packet::parse_packet(&buf[..len]).unwrap().header.packet_type
    }

    fn pcm_frame() -> Vec<u8> {
        vec![1u8; pttlink_audio::PCM_FRAME_BYTES]
    }

    #[tokio::test]
    async fn press_sends_ptt_on_and_grant_starts_tx() {
        let mut rig = rig();
        assert!(rig.scheduler.set_ptt_pressed(true).is_empty());
        assert_eq!(recv_type(&rig.receiver).await, PacketType::PttOn as u8);
        assert!(rig.mic_running.load(Ordering::Relaxed));

        let notices = rig.scheduler.set_talk_allowed(true);
        assert_eq!(notices, vec![PttNotice::TxStarted]);
        assert!(rig.scheduler.tx_timer_active());
    }

    #[tokio::test]
    async fn tick_sends_one_audio_packet_per_queued_frame() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);

        rig.scheduler.on_mic_frame(&pcm_frame());
        rig.scheduler.on_mic_frame(&pcm_frame());
        assert!(rig.scheduler.tx_tick().is_empty());
        assert_eq!(recv_type(&rig.receiver).await, PacketType::Audio as u8);
        assert!(rig.scheduler.tx_tick().is_empty());
        assert_eq!(recv_type(&rig.receiver).await, PacketType::Audio as u8);
    }

    #[tokio::test]
    async fn release_drains_queue_before_ptt_off() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);

        rig.scheduler.on_mic_frame(&pcm_frame());
        assert!(rig.scheduler.set_ptt_pressed(false).is_empty());

        // Queued audio first, then the PTT_OFF, then the timer stops.
        assert!(rig.scheduler.tx_tick().is_empty());
        assert_eq!(recv_type(&rig.receiver).await, PacketType::Audio as u8);
        assert_eq!(rig.scheduler.tx_tick(), vec![PttNotice::TxStopped]);
        assert_eq!(recv_type(&rig.receiver).await, PacketType::PttOff as u8);
        assert!(!rig.scheduler.tx_timer_active());
        assert!(rig.scheduler.input_idle_deadline().is_some());
    }

    #[tokio::test]
    async fn release_with_empty_queue_sends_ptt_off_immediately() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);

        let notices = rig.scheduler.set_ptt_pressed(false);
        assert_eq!(notices, vec![PttNotice::TxStopped]);
        assert_eq!(recv_type(&rig.receiver).await, PacketType::PttOff as u8);
    }

    #[tokio::test]
    async fn losing_talk_grant_while_pressed_discards_queue() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);
        rig.scheduler.on_mic_frame(&pcm_frame());

        let notices = rig.scheduler.set_talk_allowed(false);
        assert_eq!(notices, vec![PttNotice::TxStopped]);
        assert!(!rig.scheduler.tx_timer_active());
        assert!(rig.scheduler.tx_queue.is_empty());
    }

    #[tokio::test]
    async fn fec_parity_follows_each_complete_block() {
        let mut rig = rig();
        rig.scheduler.set_fec_enabled(true);
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);

        for _ in 0..6 {
            rig.scheduler.on_mic_frame(&pcm_frame());
            rig.scheduler.tx_tick();
        }

        let mut audio = 0;
        let mut fec = 0;
        for _ in 0..8 {
            match recv_type(&rig.receiver).await {
                t if t == PacketType::Audio as u8 => audio += 1,
                t if t == PacketType::Fec as u8 => fec += 1,
                other => panic!("unexpected packet type {other:#x}"),
            }
        }
        assert_eq!(audio, 6);
        assert_eq!(fec, 2);
    }

    #[tokio::test]
    async fn tx_queue_drops_oldest_beyond_limit() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.set_talk_allowed(true);

        for _ in 0..20 {
            rig.scheduler.on_mic_frame(&pcm_frame());
        }
        assert_eq!(rig.scheduler.tx_queue.len(), TX_QUEUE_MAX_FRAMES);
    }

    #[tokio::test]
    async fn start_guard_defers_tx_start() {
        let mut rig = rig();
        rig.scheduler.set_start_guard_ms(40);
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;

        assert!(rig.scheduler.set_talk_allowed(true).is_empty());
        assert!(rig.scheduler.tx_start_deadline().is_some());

        tokio::time::sleep(TokioDuration::from_millis(60)).await;
        assert_eq!(
            rig.scheduler.tx_start_delay_elapsed(),
            vec![PttNotice::TxStarted]
        );
    }

    #[tokio::test]
    async fn always_on_keeps_mic_after_idle() {
        let mut rig = rig();
        rig.scheduler.set_always_keep_input_session(true);
        assert!(rig.mic_running.load(Ordering::Relaxed));

        rig.scheduler.input_idle_elapsed();
        assert!(rig.mic_running.load(Ordering::Relaxed));

        rig.scheduler.set_always_keep_input_session(false);
        rig.scheduler.input_idle_elapsed();
        assert!(!rig.mic_running.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn no_frames_accepted_without_grant() {
        let mut rig = rig();
        rig.scheduler.set_ptt_pressed(true);
        recv_type(&rig.receiver).await;
        rig.scheduler.on_mic_frame(&pcm_frame());
        assert!(rig.scheduler.tx_queue.is_empty());
    }
}
