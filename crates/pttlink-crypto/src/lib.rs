//! pttlink cryptographic layer.
//!
//! This crate provides:
//! - The per-frame AEAD envelope (AES-256-GCM, plus a legacy XOR mode
//!   kept for backward interop)
//! - Channel session-key derivation from the shared channel password
//!   via HKDF-SHA-256
//! - Password hash normalization helpers

pub mod cipher;
pub mod keyexchange;
pub mod password;

pub use cipher::{AeadCipher, CipherMode, CryptoError, AUTH_TAG_SIZE};
pub use keyexchange::{KeyExchange, KeyExchangeEvent};
pub use password::{is_sha256_hex, normalize_password_hash, sha256_hex};
