use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Protocol version carried in the first header byte.
pub const PROTOCOL_VERSION: u8 = 1;
/// Modern fixed header size (includes the `flags` field).
pub const FIXED_HEADER_SIZE: usize = 16;
/// Legacy fixed header size (no `flags` field).
pub const LEGACY_FIXED_HEADER_SIZE: usize = 14;
/// Optional security header: nonce (8) + key id (4).
pub const SECURITY_HEADER_SIZE: usize = 12;
/// Trailing authentication tag size for encrypted packets.
pub const AUTH_TAG_SIZE: usize = 16;

/// Packet types carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Audio = 0x01,
    PttOn = 0x02,
    PttOff = 0x03,
    Keepalive = 0x04,
    Join = 0x05,
    Leave = 0x06,
    TalkGrant = 0x07,
    TalkRelease = 0x08,
    TalkDeny = 0x09,
    KeyExchange = 0x0A,
    CodecConfig = 0x0B,
    Fec = 0x0C,
    ServerConfig = 0x0D,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0x01 => Ok(Self::Audio),
            0x02 => Ok(Self::PttOn),
            0x03 => Ok(Self::PttOff),
            0x04 => Ok(Self::Keepalive),
            0x05 => Ok(Self::Join),
            0x06 => Ok(Self::Leave),
            0x07 => Ok(Self::TalkGrant),
            0x08 => Ok(Self::TalkRelease),
            0x09 => Ok(Self::TalkDeny),
            0x0A => Ok(Self::KeyExchange),
            0x0B => Ok(Self::CodecConfig),
            0x0C => Ok(Self::Fec),
            0x0D => Ok(Self::ServerConfig),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Codec identifiers announced in CODEC_CONFIG payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecTransportId {
    Pcm = 0x00,
    Codec2 = 0x01,
    Opus = 0x02,
}

/// Fixed packet header. `header_len` records which framing the sender
/// used and whether a security header follows: 14 or 14+12 is legacy,
/// 16 or 16+12 is modern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: u8,
    pub header_len: u16,
    pub channel_id: u32,
    pub sender_id: u32,
    pub seq: u16,
    pub flags: u16,
}

impl PacketHeader {
    /// Whether `header_len` names one of the legacy framings.
    pub fn is_legacy_framing(&self) -> bool {
        self.header_len == LEGACY_FIXED_HEADER_SIZE as u16
            || self.header_len == (LEGACY_FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE) as u16
    }
}

/// Optional per-packet security header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityHeader {
    pub nonce: u64,
    pub key_id: u32,
}

/// A parsed datagram. Plain packets carry a zeroed security header and
/// an empty tag.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: PacketHeader,
    pub sec: SecurityHeader,
    pub payload: Vec<u8>,
    pub tag: Vec<u8>,
}

/// Serialize a modern-framed packet: fixed header, security header,
/// payload, tag. Plain modern packets pass a zeroed security header and
/// a zeroed tag; the receiver sees an empty payload boundary either way.
pub fn serialize_packet(
    header: &PacketHeader,
    sec: &SecurityHeader,
    payload: &[u8],
    tag: &[u8],
) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE + payload.len() + tag.len());

    buf.put_u8(header.version);
    buf.put_u8(header.packet_type);
    buf.put_u16(header.header_len);
    buf.put_u32(header.channel_id);
    buf.put_u32(header.sender_id);
    buf.put_u16(header.seq);
    buf.put_u16(header.flags);

    buf.put_u64(sec.nonce);
    buf.put_u32(sec.key_id);

    buf.put_slice(payload);
    buf.put_slice(tag);

    buf
}

/// Parse a datagram into header, security header, payload and tag.
///
/// The first 14 bytes are read unconditionally; the framing variant is
/// decided from the recorded `header_len`. A security header is only
/// accepted when the datagram is long enough to also carry the trailing
/// tag; otherwise the packet must be exactly a plain framing or the
/// parse fails.
pub fn parse_packet(datagram: &[u8]) -> Result<ParsedPacket, ProtocolError> {
    if datagram.len() < LEGACY_FIXED_HEADER_SIZE {
        return Err(ProtocolError::DatagramTooShort {
            expected: LEGACY_FIXED_HEADER_SIZE,
            got: datagram.len(),
        });
    }

    let mut buf = datagram;
    let mut header = PacketHeader {
        version: buf.get_u8(),
        packet_type: buf.get_u8(),
        header_len: buf.get_u16(),
        channel_id: buf.get_u32(),
        sender_id: buf.get_u32(),
        seq: buf.get_u16(),
        flags: 0,
    };

    let modern = header.header_len == FIXED_HEADER_SIZE as u16
        || header.header_len == (FIXED_HEADER_SIZE + SECURITY_HEADER_SIZE) as u16;

    let fixed_used = if modern {
        if datagram.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::DatagramTooShort {
                expected: FIXED_HEADER_SIZE,
                got: datagram.len(),
            });
        }
        header.flags = buf.get_u16();
        FIXED_HEADER_SIZE
    } else {
        LEGACY_FIXED_HEADER_SIZE
    };

    let secured_len = fixed_used + SECURITY_HEADER_SIZE;
    if header.header_len as usize >= secured_len
        && datagram.len() >= secured_len + AUTH_TAG_SIZE
    {
        let sec = SecurityHeader {
            nonce: buf.get_u64(),
            key_id: buf.get_u32(),
        };
        let payload_len = buf.remaining() - AUTH_TAG_SIZE;
        let payload = buf[..payload_len].to_vec();
        let tag = buf[payload_len..].to_vec();
        return Ok(ParsedPacket {
            header,
            sec,
            payload,
            tag,
        });
    }

    if header.header_len as usize != fixed_used {
        return Err(ProtocolError::BadHeaderLength(header.header_len));
    }

    Ok(ParsedPacket {
        header,
        sec: SecurityHeader::default(),
        payload: buf.to_vec(),
        tag: Vec::new(),
    })
}
