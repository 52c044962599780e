use std::time::Duration;

/// Interval between two sender reports on one track.
pub const SENDER_REPORT_INTERVAL: Duration = Duration::from_millis(2500);

/// Length in bytes of a sender report without report blocks.
pub const SENDER_REPORT_LEN: usize = 28;

/// Build an RTCP Sender Report with no reception report blocks
/// (RFC 3550 §6.4.1).
///
/// ```text
/// |V=2|P|  RC=0   |   PT=SR=200   |         length=6              |
/// |                         SSRC of sender                        |
/// |              NTP timestamp, most significant word             |
/// |             NTP timestamp, least significant word             |
/// |                         RTP timestamp                         |
/// |                     sender's packet count                     |
/// |                      sender's octet count                     |
/// ```
pub fn sender_report(
    ssrc: u32,
    ntp: u64,
    rtp_timestamp: u32,
    packets: u32,
    octets: u32,
) -> [u8; SENDER_REPORT_LEN] {
    let mut sr = [0u8; SENDER_REPORT_LEN];
    sr[0] = 0x80;
    sr[1] = 200;
    sr[2..4].copy_from_slice(&6u16.to_be_bytes());
    sr[4..8].copy_from_slice(&ssrc.to_be_bytes());
    sr[8..16].copy_from_slice(&ntp.to_be_bytes());
    sr[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    sr[20..24].copy_from_slice(&packets.to_be_bytes());
    sr[24..28].copy_from_slice(&octets.to_be_bytes());
    sr
}
