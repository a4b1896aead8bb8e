use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("datagram too short: expected at least {expected} bytes, got {got}")]
    DatagramTooShort { expected: usize, got: usize },

    #[error("header length {0} does not match any known framing")]
    BadHeaderLength(u16),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("payload too short: expected at least {expected} bytes, got {got}")]
    PayloadTooShort { expected: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_too_short_display() {
        let e = ProtocolError::DatagramTooShort { expected: 14, got: 3 };
        let msg = e.to_string();
        assert!(msg.contains("14"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn unknown_packet_type_display() {
        let e = ProtocolError::UnknownPacketType(0xEE);
        assert!(e.to_string().contains("0xee"));
    }
}
