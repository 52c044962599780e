/// Dynamic payload type used for every track.
pub const PAYLOAD_TYPE: u8 = 96;

/// Size of the RTP fixed header without CSRCs.
pub const HEADER_LEN: usize = 12;

/// RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One instance lives in each packetizer thread:
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet
///   including each FU-A fragment. Seeded from the RTSP session.
/// - **Timestamp**: set per access unit from the buffer's capture time,
///   scaled to the track clock rate.
/// - **SSRC**: fixed for the packetizer's lifetime.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, sequence: u16) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence,
            timestamp: 0,
        }
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Set the media timestamp for the packets of the next access unit.
    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of an access unit
    /// (RFC 6184 §5.1, RFC 3640 §3.2.1).
    pub fn write(&mut self, marker: bool) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7F);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Convert a capture time in microseconds to a media clock timestamp.
///
/// The result wraps modulo 2^32 as RTP timestamps do.
pub fn scale_timestamp(timestamp_us: u64, clock_rate: u32) -> u32 {
    ((timestamp_us as u128 * clock_rate as u128) / 1_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(PAYLOAD_TYPE, 0xAABBCCDD, 100)
    }

    #[test]
    fn first_byte_is_0x80() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(false);
        assert_eq!(no_marker[1], 96);

        let with_marker = h.write(true);
        assert_eq!(with_marker[1], 0x80 | 96);
    }

    #[test]
    fn sequence_starts_at_seed_and_increments() {
        let mut h = make_header();
        let b1 = h.write(false);
        let b2 = h.write(false);
        assert_eq!(u16::from_be_bytes([b1[2], b1[3]]), 100);
        assert_eq!(u16::from_be_bytes([b2[2], b2[3]]), 101);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(PAYLOAD_TYPE, 1, u16::MAX);
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn ssrc_and_timestamp_written() {
        let mut h = make_header();
        h.set_timestamp(0x01020304);
        let buf = h.write(false);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 0xAABBCCDD);
    }

    #[test]
    fn timestamp_scaling() {
        assert_eq!(scale_timestamp(1_000_000, 90_000), 90_000);
        assert_eq!(scale_timestamp(33_333, 90_000), 2_999);
        assert_eq!(scale_timestamp(500_000, 44_100), 22_050);
        // wraps instead of saturating
        let big = (u32::MAX as u64 + 1) * 1_000_000 / 90_000 + 1_000_000;
        assert!(scale_timestamp(big, 90_000) < 100_000);
    }
}
