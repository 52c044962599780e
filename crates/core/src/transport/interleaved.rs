use std::io;
use std::sync::Arc;

use super::RtpSink;
use super::tcp::Connection;

/// Largest interleaved payload we emit (fits the 16-bit length field).
pub const INTERLEAVED_MAX_PACKET: usize = 65000;
const FRAME_HEADER_LEN: usize = 4;

/// TCP interleaved binding of one RTP track (RFC 2326 §10.12).
///
/// ```text
/// '$' | channel (u8) | length (u16, big-endian) | packet
/// ```
///
/// Frames go through the owning connection's serialized writer, so they
/// never interleave with RTSP replies or the other track's packets. One
/// buffer is reused for every frame.
pub struct InterleavedSink {
    conn: Arc<Connection>,
    rtp_channel: u8,
    rtcp_channel: u8,
    buf: Vec<u8>,
}

impl InterleavedSink {
    pub fn new(conn: Arc<Connection>, rtp_channel: u8, rtcp_channel: u8) -> Self {
        Self {
            conn,
            rtp_channel,
            rtcp_channel,
            buf: Vec::with_capacity(FRAME_HEADER_LEN + INTERLEAVED_MAX_PACKET),
        }
    }

    fn send(&mut self, channel: u8, packet: &[u8]) -> io::Result<()> {
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interleaved frame too large"))?;
        self.buf.clear();
        self.buf.push(b'$');
        self.buf.push(channel);
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(packet);
        self.conn.write_all(&self.buf)
    }
}

impl RtpSink for InterleavedSink {
    fn max_packet_size(&self) -> usize {
        INTERLEAVED_MAX_PACKET
    }

    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        let channel = self.rtp_channel;
        self.send(channel, packet)
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        let channel = self.rtcp_channel;
        self.send(channel, packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn frames_carry_channel_and_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = Arc::new(Connection::new(server).unwrap());

        let mut sink = InterleavedSink::new(conn, 2, 3);
        sink.send_rtp(&[0xAA; 300]).unwrap();
        sink.send_rtcp(&[0xBB; 28]).unwrap();

        let mut frame = [0u8; 4 + 300];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[b'$', 2, 0x01, 0x2C]);
        assert!(frame[4..].iter().all(|b| *b == 0xAA));

        let mut frame = [0u8; 4 + 28];
        client.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[..4], &[b'$', 3, 0, 28]);
    }
}
