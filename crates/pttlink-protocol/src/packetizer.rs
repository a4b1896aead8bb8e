use bytes::BufMut;

use crate::error::ProtocolError;
use crate::packet::{
    self, PacketHeader, PacketType, ParsedPacket, SecurityHeader, AUTH_TAG_SIZE,
    FIXED_HEADER_SIZE, LEGACY_FIXED_HEADER_SIZE, PROTOCOL_VERSION, SECURITY_HEADER_SIZE,
};

/// Builds outgoing packets for one connection.
///
/// Owns the monotone per-sender sequence counter and the wire-variant
/// flag: once a peer is seen using legacy framing, all subsequent
/// packets are emitted legacy-framed.
#[derive(Debug, Default)]
pub struct Packetizer {
    channel_id: u32,
    sender_id: u32,
    key_id: u32,
    seq: u16,
    use_legacy: bool,
}

impl Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel_id(&mut self, channel_id: u32) {
        self.channel_id = channel_id;
    }

    pub fn set_sender_id(&mut self, sender_id: u32) {
        self.sender_id = sender_id;
    }

    pub fn set_key_id(&mut self, key_id: u32) {
        self.key_id = key_id;
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn sender_id(&self) -> u32 {
        self.sender_id
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn set_use_legacy(&mut self, legacy: bool) {
        self.use_legacy = legacy;
    }

    pub fn use_legacy(&self) -> bool {
        self.use_legacy
    }

    /// The sequence number the next packed packet will carry.
    pub fn next_seq(&self) -> u16 {
        self.seq
    }

    /// Build an encrypted packet in the active framing.
    pub fn pack(
        &mut self,
        packet_type: PacketType,
        encrypted_payload: &[u8],
        auth_tag: &[u8],
        nonce: u64,
    ) -> Vec<u8> {
        if self.use_legacy {
            return self.pack_legacy(packet_type, encrypted_payload, auth_tag, nonce);
        }

        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: packet_type as u8,
            header_len: (FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE) as u16,
            channel_id: self.channel_id,
            sender_id: self.sender_id,
            seq: self.take_seq(),
            flags: 0,
        };
        let sec = SecurityHeader {
            nonce,
            key_id: self.key_id,
        };
        packet::serialize_packet(&header, &sec, encrypted_payload, auth_tag)
    }

    /// Build an unencrypted packet in the active framing. Modern plain
    /// packets still carry a zeroed security header and tag so their
    /// layout matches the recorded header length.
    pub fn pack_plain(&mut self, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        if self.use_legacy {
            return self.pack_plain_legacy(packet_type, payload);
        }

        let header = PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type: packet_type as u8,
            header_len: (FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE) as u16,
            channel_id: self.channel_id,
            sender_id: self.sender_id,
            seq: self.take_seq(),
            flags: 0,
        };
        packet::serialize_packet(
            &header,
            &SecurityHeader::default(),
            payload,
            &[0u8; AUTH_TAG_SIZE],
        )
    }

    /// Build an encrypted legacy-framed packet regardless of the flag.
    pub fn pack_legacy(
        &mut self,
        packet_type: PacketType,
        encrypted_payload: &[u8],
        auth_tag: &[u8],
        nonce: u64,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            LEGACY_FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE + encrypted_payload.len()
                + auth_tag.len(),
        );
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(packet_type as u8);
        buf.put_u16((LEGACY_FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE) as u16);
        buf.put_u32(self.channel_id);
        buf.put_u32(self.sender_id);
        buf.put_u16(self.take_seq());
        buf.put_u64(nonce);
        buf.put_u32(self.key_id);
        buf.put_slice(encrypted_payload);
        buf.put_slice(auth_tag);
        buf
    }

    /// Build an unencrypted legacy-framed packet regardless of the flag.
    pub fn pack_plain_legacy(&mut self, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LEGACY_FIXED_HEADER_SIZE + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(packet_type as u8);
        buf.put_u16(LEGACY_FIXED_HEADER_SIZE as u16);
        buf.put_u32(self.channel_id);
        buf.put_u32(self.sender_id);
        buf.put_u16(self.take_seq());
        buf.put_slice(payload);
        buf
    }

    /// Parse a received datagram.
    pub fn unpack(&self, datagram: &[u8]) -> Result<ParsedPacket, ProtocolError> {
        packet::parse_packet(datagram)
    }

    fn take_seq(&mut self) -> u16 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packetizer() -> Packetizer {
        let mut p = Packetizer::new();
        p.set_channel_id(7);
        p.set_sender_id(42);
        p.set_key_id(1);
        p
    }

    #[test]
    fn pack_roundtrip() {
        let mut p = packetizer();
        let payload = vec![1u8, 2, 3, 4];
        let tag = vec![0xAB; AUTH_TAG_SIZE];
        let bytes = p.pack(PacketType::Audio, &payload, &tag, 77);

        let parsed = p.unpack(&bytes).unwrap();
        assert_eq!(parsed.header.channel_id, 7);
        assert_eq!(parsed.header.sender_id, 42);
        assert_eq!(parsed.header.seq, 0);
        assert_eq!(parsed.sec.nonce, 77);
        assert_eq!(parsed.sec.key_id, 1);
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.tag, tag);
    }

    #[test]
    fn seq_increments_across_pack_calls() {
        let mut p = packetizer();
        p.pack_plain(PacketType::Join, &[]);
        p.pack(PacketType::Audio, &[0], &[0u8; AUTH_TAG_SIZE], 1);
        let bytes = p.pack_plain(PacketType::Keepalive, &[]);
        let parsed = p.unpack(&bytes).unwrap();
        assert_eq!(parsed.header.seq, 2);
        assert_eq!(p.next_seq(), 3);
    }

    #[test]
    fn seq_wraps_at_u16_boundary() {
        let mut p = packetizer();
        p.seq = u16::MAX;
        p.pack_plain(PacketType::Keepalive, &[]);
        assert_eq!(p.next_seq(), 0);
    }

    #[test]
    fn legacy_flag_switches_framing() {
        let mut p = packetizer();
        p.set_use_legacy(true);
        let bytes = p.pack_plain(PacketType::Join, &[]);
        assert_eq!(bytes.len(), LEGACY_FIXED_HEADER_SIZE);

        let parsed = p.unpack(&bytes).unwrap();
        assert!(parsed.header.is_legacy_framing());
        assert_eq!(parsed.header.flags, 0);
    }

    #[test]
    fn legacy_encrypted_roundtrip() {
        let mut p = packetizer();
        p.set_use_legacy(true);
        let bytes = p.pack(PacketType::Audio, &[9, 9], &[0x11; AUTH_TAG_SIZE], 5);

        let parsed = p.unpack(&bytes).unwrap();
        assert!(parsed.header.is_legacy_framing());
        assert_eq!(parsed.sec.nonce, 5);
        assert_eq!(parsed.payload, vec![9, 9]);
    }
}
