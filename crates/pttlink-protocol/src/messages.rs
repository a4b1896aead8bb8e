use bytes::BufMut;

use crate::error::ProtocolError;

/// CODEC_CONFIG payload: the sender's intended codec, bitrate mode and
/// PCM-only flag.
///
/// Wire format: `[flags: u8] [codec_id: u8] [mode: u16 BE]`, flags bit 0
/// is "force PCM".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub force_pcm: bool,
    pub codec_id: u8,
    pub mode: u16,
}

impl CodecConfig {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.put_u8(u8::from(self.force_pcm));
        buf.put_u8(self.codec_id);
        buf.put_u16(self.mode);
        buf
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::PayloadTooShort {
                expected: 4,
                got: payload.len(),
            });
        }
        Ok(Self {
            force_pcm: payload[0] & 0x01 != 0,
            codec_id: payload[1],
            mode: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }
}

/// FEC payload: one parity packet covering a block of audio frames.
///
/// Wire format: `[block_start: u16 BE] [block_size: u8] [parity_index: u8]
/// [parity bytes]`, parity length equals the block's frame size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecPayload {
    pub block_start: u16,
    pub block_size: u8,
    pub parity_index: u8,
    pub parity: Vec<u8>,
}

impl FecPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.parity.len());
        buf.put_u16(self.block_start);
        buf.put_u8(self.block_size);
        buf.put_u8(self.parity_index);
        buf.put_slice(&self.parity);
        buf
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::PayloadTooShort {
                expected: 4,
                got: payload.len(),
            });
        }
        Ok(Self {
            block_start: u16::from_be_bytes([payload[0], payload[1]]),
            block_size: payload[2],
            parity_index: payload[3],
            parity: payload[4..].to_vec(),
        })
    }
}

/// Extract the talker id from a TALK_GRANT / TALK_RELEASE / TALK_DENY
/// payload, falling back to the packet's sender id for short payloads.
pub fn talker_id(payload: &[u8], fallback: u32) -> u32 {
    if payload.len() < 4 {
        return fallback;
    }
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
}

/// Encode a talker id payload.
pub fn talker_id_bytes(talker: u32) -> Vec<u8> {
    talker.to_be_bytes().to_vec()
}

/// Split a decrypted AUDIO payload into `(audio_seq, codec_frame)`.
///
/// Two accepted forms: exactly one codec frame (headerless — the
/// packet-level `seq` stands in), or a 2-byte `audio_seq` prefix followed
/// by the frame. TX always emits the prefixed form.
pub fn split_audio_payload<'a>(
    plaintext: &'a [u8],
    expected_frame_size: usize,
    packet_seq: u16,
) -> (u16, &'a [u8]) {
    if expected_frame_size > 0 && plaintext.len() == expected_frame_size {
        return (packet_seq, plaintext);
    }
    if plaintext.len() >= 2 {
        let audio_seq = u16::from_be_bytes([plaintext[0], plaintext[1]]);
        return (audio_seq, &plaintext[2..]);
    }
    (packet_seq, plaintext)
}

/// Build the on-wire AUDIO payload (`audio_seq` prefixed form).
pub fn audio_payload(audio_seq: u16, codec_frame: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + codec_frame.len());
    buf.put_u16(audio_seq);
    buf.put_slice(codec_frame);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_config_roundtrip() {
        let config = CodecConfig {
            force_pcm: true,
            codec_id: 2,
            mode: 16000,
        };
        let decoded = CodecConfig::from_bytes(&config.to_bytes()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn codec_config_ignores_reserved_flag_bits() {
        let decoded = CodecConfig::from_bytes(&[0xFE, 1, 0x06, 0x40]).unwrap();
        assert!(!decoded.force_pcm);
        assert_eq!(decoded.codec_id, 1);
        assert_eq!(decoded.mode, 1600);
    }

    #[test]
    fn codec_config_too_short() {
        assert!(CodecConfig::from_bytes(&[1, 0]).is_err());
    }

    #[test]
    fn fec_payload_roundtrip() {
        let payload = FecPayload {
            block_start: 96,
            block_size: 6,
            parity_index: 1,
            parity: vec![1, 2, 3, 4, 5],
        };
        let decoded = FecPayload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn talker_id_prefers_payload() {
        assert_eq!(talker_id(&talker_id_bytes(1234), 9), 1234);
        assert_eq!(talker_id(&[], 9), 9);
        assert_eq!(talker_id(&[0, 0], 9), 9);
    }

    #[test]
    fn audio_payload_headerless_when_exact_frame_size() {
        let frame = [7u8; 8];
        let (seq, out) = split_audio_payload(&frame, 8, 55);
        assert_eq!(seq, 55);
        assert_eq!(out, frame);
    }

    #[test]
    fn audio_payload_prefixed_form() {
        let payload = audio_payload(300, &[7u8; 8]);
        let (seq, out) = split_audio_payload(&payload, 8, 55);
        assert_eq!(seq, 300);
        assert_eq!(out, [7u8; 8]);
    }

    #[test]
    fn audio_payload_tiny_falls_back_to_packet_seq() {
        let (seq, out) = split_audio_payload(&[9], 8, 55);
        assert_eq!(seq, 55);
        assert_eq!(out, [9]);
    }
}
