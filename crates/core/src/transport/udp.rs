use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use super::RtpSink;

/// Largest UDP datagram we emit, sized below a typical Ethernet MTU.
pub const UDP_MAX_PACKET: usize = 1400;

/// How many times to look for a free `(port, port + 1)` pair.
const BIND_ATTEMPTS: usize = 16;

/// UDP binding of one RTP track.
///
/// RTP leaves from an ephemeral port, RTCP from the port right above it,
/// as RFC 3550 §11 recommends. Destinations are the client's announced
/// `client_port` pair on the RTSP peer's IP.
pub struct UdpSink {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    rtp_dest: SocketAddr,
    rtcp_dest: SocketAddr,
    local_ports: (u16, u16),
}

impl UdpSink {
    pub fn bind(peer: IpAddr, client_rtp_port: u16, client_rtcp_port: u16) -> io::Result<Self> {
        let any = match peer {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let mut last_err = io::Error::new(io::ErrorKind::AddrInUse, "no free RTP/RTCP port pair");
        for _ in 0..BIND_ATTEMPTS {
            let rtp = UdpSocket::bind(SocketAddr::new(any, 0))?;
            let rtp_port = rtp.local_addr()?.port();
            let Some(rtcp_port) = rtp_port.checked_add(1) else {
                continue;
            };
            match UdpSocket::bind(SocketAddr::new(any, rtcp_port)) {
                Ok(rtcp) => {
                    tracing::debug!(
                        rtp_port,
                        rtcp_port,
                        client_rtp_port,
                        client_rtcp_port,
                        %peer,
                        "UDP transport bound"
                    );
                    return Ok(Self {
                        rtp,
                        rtcp,
                        rtp_dest: SocketAddr::new(peer, client_rtp_port),
                        rtcp_dest: SocketAddr::new(peer, client_rtcp_port),
                        local_ports: (rtp_port, rtcp_port),
                    });
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl RtpSink for UdpSink {
    fn max_packet_size(&self) -> usize {
        UDP_MAX_PACKET
    }

    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtp.send_to(packet, self.rtp_dest).map(|_| ())
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtcp.send_to(packet, self.rtcp_dest).map(|_| ())
    }

    fn local_ports(&self) -> Option<(u16, u16)> {
        Some(self.local_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rtcp_port_is_rtp_plus_one() {
        let sink = UdpSink::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 9, 10).unwrap();
        let (rtp, rtcp) = sink.local_ports().unwrap();
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(sink.max_packet_size(), 1400);
    }

    #[test]
    fn packets_reach_client_ports() {
        let rtp_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rtcp_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rtp_rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        rtcp_rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut sink = UdpSink::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtp_rx.local_addr().unwrap().port(),
            rtcp_rx.local_addr().unwrap().port(),
        )
        .unwrap();
        sink.send_rtp(&[0x80, 96, 0, 1]).unwrap();
        sink.send_rtcp(&[0x80, 200, 0, 6]).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = rtp_rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 96, 0, 1]);
        assert_eq!(from.port(), sink.local_ports().unwrap().0);
        let (n, from) = rtcp_rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x80, 200, 0, 6]);
        assert_eq!(from.port(), sink.local_ports().unwrap().1);
    }
}
