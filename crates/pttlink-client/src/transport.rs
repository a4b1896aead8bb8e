use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// DSCP Expedited Forwarding in the TOS byte (ECN bits zero).
const TOS_DSCP_EF: u32 = 46 << 2;

/// One bound IPv4 UDP socket; every datagram is one packet.
///
/// Sends are fire-and-forget from the event loop: `try_send_to` never
/// blocks, and a dropped datagram is no worse than a lost one.
pub struct UdpTransport {
    socket: UdpSocket,
    local_port: u16,
}

impl UdpTransport {
    /// Bind on `0.0.0.0`; port 0 picks an ephemeral port. Built via
    /// socket2 so the TOS option stays reachable for QoS toggling.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create UDP socket")?;
        socket
            .set_nonblocking(true)
            .context("failed to set socket non-blocking")?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .with_context(|| format!("failed to bind UDP port {port}"))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let local_port = std_socket
            .local_addr()
            .context("failed to read bound address")?
            .port();
        let socket =
            UdpSocket::from_std(std_socket).context("failed to register UDP socket")?;

        info!(local_port, "UDP transport bound");
        Ok(Self { socket, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send one datagram without blocking the event loop.
    pub fn send(&self, data: &[u8], target: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(data, target) {
            debug!(%target, "datagram send failed: {e}");
        }
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Toggle DSCP EF marking for voice traffic.
    pub fn set_qos_enabled(&self, enabled: bool) {
        let tos = if enabled { TOS_DSCP_EF } else { 0 };
        if let Err(e) = SockRef::from(&self.socket).set_tos_v4(tos) {
            warn!("failed to set IP_TOS={tos}: {e}");
        } else {
            info!(enabled, "QoS (DSCP EF) marking updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_loops_back() {
        let a = UdpTransport::bind(0).unwrap();
        let b = UdpTransport::bind(0).unwrap();
        assert_ne!(a.local_port(), 0);

        let target: SocketAddr = format!("127.0.0.1:{}", b.local_port()).parse().unwrap();
        a.send(b"ping", target);

        let mut buf = [0u8; 64];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), a.local_port());
    }

    #[tokio::test]
    async fn qos_toggle_does_not_disturb_the_socket() {
        let transport = UdpTransport::bind(0).unwrap();
        transport.set_qos_enabled(true);
        transport.set_qos_enabled(false);

        let target: SocketAddr = format!("127.0.0.1:{}", transport.local_port())
            .parse()
            .unwrap();
        transport.send(b"x", target);
        let mut buf = [0u8; 8];
        let (len, _) = transport.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, 1);
    }
}
