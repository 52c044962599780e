//! Network transport layer for signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): the single listening port. Every accepted socket
//!   becomes a [`tcp::Connection`] handled by a worker from a fixed pool.
//!
//! - **UDP** ([`udp`]): a per-track RTP/RTCP socket pair addressed to the
//!   client's announced ports.
//!
//! - **Interleaved** ([`interleaved`]): RTP/RTCP framed with `$` on the
//!   RTSP connection itself (RFC 2326 §10.12).
//!
//! Packetizers only see the [`RtpSink`] trait and never know which
//! binding they are writing to.

pub mod interleaved;
pub mod tcp;
pub mod udp;

use std::io;

pub use interleaved::InterleavedSink;
pub use tcp::{Connection, ConnectionHandler, Listener};
pub use udp::UdpSink;

/// Outbound half of one RTP track.
pub trait RtpSink: Send {
    /// Largest packet, RTP header included, the binding accepts.
    fn max_packet_size(&self) -> usize;

    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()>;

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Locally bound (RTP, RTCP) ports, for bindings that own sockets.
    fn local_ports(&self) -> Option<(u16, u16)> {
        None
    }
}
