//! Channel session-key establishment.
//!
//! Both peers derive the key material from the channel id and the shared
//! password, so the "handshake" is a one-way announcement: legacy-mode
//! peers emit a literal marker packet, GCM peers derive silently and use
//! a random per-session nonce base.

use hkdf::Hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::CipherMode;
use crate::password::normalize_password_hash;

/// HKDF info for the legacy profile (wire-protocol constant).
const HKDF_INFO_LEGACY: &[u8] = b"incomudon-session";
/// HKDF info for the AES-GCM profile (wire-protocol constant).
const HKDF_INFO_AESGCM: &[u8] = b"incomudon-session-aesgcm";

/// Handshake payload announcing legacy mode.
pub const LEGACY_HANDSHAKE_PAYLOAD: &[u8] = b"LEGACY";

/// Events produced by the key exchange. The coordinator enqueues them on
/// its event loop so session-key installation happens on the next tick,
/// never re-entrantly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExchangeEvent {
    SessionKeyReady {
        key: Vec<u8>,
        nonce_base: [u8; 8],
        mode: CipherMode,
    },
    HandshakePacket(Vec<u8>),
}

/// Derives the channel session key from `(channel_id, password)`.
pub struct KeyExchange {
    ready: bool,
    crypto_mode: CipherMode,
    preferred_mode: CipherMode,
    channel_id: u32,
    password_hash: String,
    password_key: Option<Zeroizing<[u8; 32]>>,
    rng: SystemRandom,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    pub fn new() -> Self {
        Self {
            ready: false,
            crypto_mode: CipherMode::AesGcm,
            preferred_mode: CipherMode::AesGcm,
            channel_id: 0,
            password_hash: String::new(),
            password_key: None,
            rng: SystemRandom::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn crypto_mode(&self) -> CipherMode {
        self.crypto_mode
    }

    pub fn set_preferred_mode(&mut self, mode: CipherMode) {
        self.preferred_mode = mode;
    }

    pub fn preferred_mode(&self) -> CipherMode {
        self.preferred_mode
    }

    pub fn set_channel_id(&mut self, channel_id: u32) {
        if self.channel_id == channel_id {
            return;
        }
        self.channel_id = channel_id;
        self.password_key = None;
    }

    /// Install the channel password (plain text or its sha256 hex form).
    pub fn set_password(&mut self, password: &str) {
        let normalized = normalize_password_hash(password);
        if self.password_hash == normalized {
            return;
        }
        self.password_hash = normalized;
        self.password_key = None;
    }

    /// Begin (re-)derivation for the configured channel. Always produces
    /// a `SessionKeyReady` event; legacy mode also announces itself with
    /// a handshake packet.
    pub fn start_handshake(&mut self) -> Vec<KeyExchangeEvent> {
        self.ready = false;
        self.derive_session()
    }

    /// Handle a peer's handshake packet. Idempotent once ready: legacy
    /// re-derives the same deterministic key, GCM regenerates only when
    /// not yet established in that mode.
    pub fn process_handshake_packet(&mut self, _payload: &[u8]) -> Vec<KeyExchangeEvent> {
        if self.ready && self.crypto_mode == self.preferred_mode {
            return Vec::new();
        }
        self.derive_session()
    }

    fn derive_session(&mut self) -> Vec<KeyExchangeEvent> {
        let password_key = self.password_key();
        let mut out = Vec::new();

        match self.preferred_mode {
            CipherMode::LegacyXor => {
                let mut okm = Zeroizing::new([0u8; 40]);
                hkdf_expand(&password_key[..], HKDF_INFO_LEGACY, &mut okm[..]);

                let key = okm[..32].to_vec();
                let mut nonce_base = [0u8; 8];
                nonce_base.copy_from_slice(&okm[32..40]);

                self.ready = true;
                self.crypto_mode = CipherMode::LegacyXor;
                debug!(channel_id = self.channel_id, "legacy session key derived");

                out.push(KeyExchangeEvent::SessionKeyReady {
                    key,
                    nonce_base,
                    mode: CipherMode::LegacyXor,
                });
                out.push(KeyExchangeEvent::HandshakePacket(
                    LEGACY_HANDSHAKE_PAYLOAD.to_vec(),
                ));
            }
            CipherMode::AesGcm => {
                let mut key = Zeroizing::new([0u8; 32]);
                hkdf_expand(&password_key[..], HKDF_INFO_AESGCM, &mut key[..]);

                let mut nonce_base = [0u8; 8];
                // Fresh random base per derivation so reinstalling the
                // same channel key never reuses a nonce sequence.
                self.rng
                    .fill(&mut nonce_base)
                    .expect("system RNG unavailable");

                self.ready = true;
                self.crypto_mode = CipherMode::AesGcm;
                debug!(channel_id = self.channel_id, "gcm session key derived");

                out.push(KeyExchangeEvent::SessionKeyReady {
                    key: key.to_vec(),
                    nonce_base,
                    mode: CipherMode::AesGcm,
                });
            }
        }

        out
    }

    /// `SHA-256(password_hash_utf8 ‖ channel_id_be4)`, cached per
    /// `(channel, password)` pair.
    fn password_key(&mut self) -> Zeroizing<[u8; 32]> {
        if let Some(key) = &self.password_key {
            return key.clone();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.password_hash.as_bytes());
        hasher.update(self.channel_id.to_be_bytes());
        let key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
        self.password_key = Some(key.clone());
        key
    }
}

/// HKDF-SHA-256 with an empty salt (per RFC 5869, equivalent to a
/// zeroed hash-length salt).
fn hkdf_expand(ikm: &[u8], info: &[u8], okm: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    hk.expand(info, okm).expect("okm length is valid for sha256");
}
