use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// AEAD authentication tag size.
pub const AUTH_TAG_SIZE: usize = 16;

/// GCM IV size; the 8-byte nonce is right-justified into it.
const IV_SIZE: usize = 12;

/// Session key length; any other input length is normalized by hashing.
const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher has no key installed")]
    KeyNotSet,

    #[error("authentication failed")]
    AuthFailed,

    #[error("encryption failed")]
    EncryptFailed,
}

/// Cipher suite selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// AEAD-AES-256-GCM with a 16-byte tag.
    AesGcm,
    /// Repeating-key XOR with a truncated SHA-256 tag. Not a real AEAD;
    /// exists only for interop with peers that cannot do GCM.
    LegacyXor,
}

/// Per-session frame cipher.
///
/// Holds the normalized 32-byte session key, the nonce base and the
/// monotone nonce counter. `next_nonce` is the only nonce source for
/// encryption; installing a key resets the counter, so callers must pair
/// a fresh nonce base with any key reinstall.
pub struct AeadCipher {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    nonce_base: u64,
    nonce_counter: u64,
    key_id: u32,
    mode: CipherMode,
}

impl Default for AeadCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl AeadCipher {
    pub fn new() -> Self {
        Self {
            key: None,
            nonce_base: 0,
            nonce_counter: 0,
            key_id: 1,
            mode: CipherMode::AesGcm,
        }
    }

    /// Install a session key and nonce base.
    ///
    /// An empty key clears the cipher. A non-32-byte key is replaced by
    /// its SHA-256. Reinstalling the identical `(key, nonce_base)` pair
    /// is a no-op; any other install resets the nonce counter to zero.
    pub fn set_key(&mut self, key: &[u8], nonce_base: &[u8]) {
        if key.is_empty() {
            self.key = None;
            self.nonce_base = 0;
            self.nonce_counter = 0;
            return;
        }

        let normalized: [u8; KEY_SIZE] = if key.len() == KEY_SIZE {
            key.try_into().expect("length checked")
        } else {
            Sha256::digest(key).into()
        };

        let new_base = fold_nonce_base(nonce_base);
        if let Some(current) = &self.key {
            if **current == normalized && self.nonce_base == new_base {
                return;
            }
        }

        self.key = Some(Zeroizing::new(normalized));
        self.nonce_base = new_base;
        self.nonce_counter = 0;
    }

    pub fn clear_key(&mut self) {
        self.set_key(&[], &[]);
    }

    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    pub fn set_mode(&mut self, mode: CipherMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn set_key_id(&mut self, key_id: u32) {
        self.key_id = key_id;
    }

    /// Produce the next encryption nonce: `nonce_base + counter`, then
    /// advance the counter.
    pub fn next_nonce(&mut self) -> u64 {
        let nonce = self.nonce_base.wrapping_add(self.nonce_counter);
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        nonce
    }

    /// Encrypt a frame. Returns `(ciphertext, tag)` with
    /// `ciphertext.len() == plaintext.len()` and a 16-byte tag.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: u64,
        aad: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::KeyNotSet)?;

        match self.mode {
            CipherMode::AesGcm => {
                let aead = gcm_key(key)?;
                let mut in_out = plaintext.to_vec();
                let tag = aead
                    .seal_in_place_separate_tag(
                        Nonce::assume_unique_for_key(nonce_to_iv(nonce)),
                        Aad::from(aad),
                        &mut in_out,
                    )
                    .map_err(|_| CryptoError::EncryptFailed)?;
                Ok((in_out, tag.as_ref().to_vec()))
            }
            CipherMode::LegacyXor => {
                let ct = xor_with_key(plaintext, key);
                let tag = legacy_tag(key, aad, &ct, nonce);
                Ok((ct, tag))
            }
        }
    }

    /// Decrypt a frame. Fails on tag mismatch or a missing key.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        tag: &[u8],
        nonce: u64,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.key.as_ref().ok_or(CryptoError::KeyNotSet)?;
        if tag.len() != AUTH_TAG_SIZE {
            return Err(CryptoError::AuthFailed);
        }

        match self.mode {
            CipherMode::AesGcm => {
                let aead = gcm_key(key)?;
                let mut in_out = ciphertext.to_vec();
                in_out.extend_from_slice(tag);
                let plaintext = aead
                    .open_in_place(
                        Nonce::assume_unique_for_key(nonce_to_iv(nonce)),
                        Aad::from(aad),
                        &mut in_out,
                    )
                    .map_err(|_| CryptoError::AuthFailed)?;
                Ok(plaintext.to_vec())
            }
            CipherMode::LegacyXor => {
                let expected = legacy_tag(key, aad, ciphertext, nonce);
                if expected.ct_eq(tag).unwrap_u8() != 1 {
                    return Err(CryptoError::AuthFailed);
                }
                Ok(xor_with_key(ciphertext, key))
            }
        }
    }
}

fn gcm_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::KeyNotSet)?;
    Ok(LessSafeKey::new(unbound))
}

/// Right-justify the big-endian nonce into a zeroed 12-byte IV.
fn nonce_to_iv(nonce: u64) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    iv[IV_SIZE - 8..].copy_from_slice(&nonce.to_be_bytes());
    iv
}

/// Fold up to 8 nonce-base bytes into a u64, big-endian.
fn fold_nonce_base(bytes: &[u8]) -> u64 {
    bytes.iter().take(8).fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn xor_with_key(data: &[u8], key: &[u8; KEY_SIZE]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, &b)| b ^ key[i % KEY_SIZE])
        .collect()
}

/// Legacy tag: first 16 bytes of SHA-256(key ‖ aad ‖ ct ‖ nonce_le8).
fn legacy_tag(key: &[u8; KEY_SIZE], aad: &[u8], ciphertext: &[u8], nonce: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(aad);
    hasher.update(ciphertext);
    hasher.update(nonce.to_le_bytes());
    hasher.finalize()[..AUTH_TAG_SIZE].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcm_cipher() -> AeadCipher {
        let mut cipher = AeadCipher::new();
        cipher.set_key(&[7u8; 32], &1u64.to_be_bytes());
        cipher
    }

    fn legacy_cipher() -> AeadCipher {
        let mut cipher = gcm_cipher();
        cipher.set_mode(CipherMode::LegacyXor);
        cipher
    }

    #[test]
    fn gcm_roundtrip() {
        let cipher = gcm_cipher();
        let (ct, tag) = cipher.encrypt(b"voice frame", 5, b"aad").unwrap();
        assert_eq!(ct.len(), 11);
        assert_eq!(tag.len(), AUTH_TAG_SIZE);
        assert_ne!(ct, b"voice frame");

        let pt = cipher.decrypt(&ct, &tag, 5, b"aad").unwrap();
        assert_eq!(pt, b"voice frame");
    }

    #[test]
    fn gcm_rejects_any_bit_flip() {
        let cipher = gcm_cipher();
        let (ct, tag) = cipher.encrypt(b"secret", 5, b"aad").unwrap();

        let mut bad_ct = ct.clone();
        bad_ct[0] ^= 1;
        assert!(cipher.decrypt(&bad_ct, &tag, 5, b"aad").is_err());

        let mut bad_tag = tag.clone();
        bad_tag[15] ^= 1;
        assert!(cipher.decrypt(&ct, &bad_tag, 5, b"aad").is_err());

        assert!(cipher.decrypt(&ct, &tag, 6, b"aad").is_err());
        assert!(cipher.decrypt(&ct, &tag, 5, b"oad").is_err());
    }

    #[test]
    fn legacy_roundtrip_and_tamper_detection() {
        let cipher = legacy_cipher();
        let (ct, tag) = cipher.encrypt(b"secret", 9, b"").unwrap();
        assert_eq!(cipher.decrypt(&ct, &tag, 9, b"").unwrap(), b"secret");

        let mut bad = ct.clone();
        bad[2] ^= 0xFF;
        assert!(cipher.decrypt(&bad, &tag, 9, b"").is_err());
        assert!(cipher.decrypt(&ct, &tag, 10, b"").is_err());
    }

    #[test]
    fn modes_do_not_interoperate() {
        let (ct, tag) = gcm_cipher().encrypt(b"secret", 3, b"").unwrap();
        assert!(legacy_cipher().decrypt(&ct, &tag, 3, b"").is_err());
    }

    #[test]
    fn next_nonce_is_fresh_within_a_session() {
        let mut cipher = gcm_cipher();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(cipher.next_nonce()));
        }
    }

    #[test]
    fn nonce_starts_at_base_and_counts_up() {
        let mut cipher = AeadCipher::new();
        cipher.set_key(&[1u8; 32], &0x0102u64.to_be_bytes());
        assert_eq!(cipher.next_nonce(), 0x0102);
        assert_eq!(cipher.next_nonce(), 0x0103);
    }

    #[test]
    fn set_key_normalizes_short_keys() {
        let mut a = AeadCipher::new();
        a.set_key(b"password", &[0u8; 8]);
        let mut b = AeadCipher::new();
        let digest: [u8; 32] = Sha256::digest(b"password").into();
        b.set_key(&digest, &[0u8; 8]);

        let (ct, tag) = a.encrypt(b"x", 0, b"").unwrap();
        assert_eq!(b.decrypt(&ct, &tag, 0, b"").unwrap(), b"x");
    }

    #[test]
    fn reinstalling_same_key_and_base_keeps_counter() {
        let mut cipher = gcm_cipher();
        cipher.next_nonce();
        cipher.next_nonce();
        cipher.set_key(&[7u8; 32], &1u64.to_be_bytes());
        // No-op install: the counter must not rewind to a used nonce.
        assert_eq!(cipher.next_nonce(), 3);
    }

    #[test]
    fn new_nonce_base_resets_counter() {
        let mut cipher = gcm_cipher();
        cipher.next_nonce();
        cipher.set_key(&[7u8; 32], &100u64.to_be_bytes());
        assert_eq!(cipher.next_nonce(), 100);
    }

    #[test]
    fn empty_key_clears_cipher() {
        let mut cipher = gcm_cipher();
        cipher.clear_key();
        assert!(!cipher.is_ready());
        assert!(cipher.encrypt(b"x", 0, b"").is_err());
        assert!(cipher.decrypt(b"x", &[0u8; 16], 0, b"").is_err());
    }

    #[test]
    fn short_nonce_base_folds_big_endian() {
        let mut cipher = AeadCipher::new();
        cipher.set_key(&[1u8; 32], &[0x01, 0x02]);
        assert_eq!(cipher.next_nonce(), 0x0102);
    }
}
