//! pttlink wire protocol — packet framing, control payloads and FEC.
//!
//! Every UDP datagram is one packet: a fixed header (modern 16-byte or
//! legacy 14-byte variant), an optional 12-byte security header, the
//! payload and, when encrypted, a trailing 16-byte auth tag. All
//! multi-byte integers are big-endian.

pub mod error;
pub mod fec;
pub mod messages;
pub mod packet;
pub mod packetizer;

pub use error::ProtocolError;
pub use packet::{PacketHeader, PacketType, ParsedPacket, SecurityHeader};
pub use packetizer::Packetizer;
