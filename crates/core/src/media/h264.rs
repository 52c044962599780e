use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use super::packetizer::Payloader;
use super::rtp::{HEADER_LEN, RtpHeader};
use super::{ConfigKey, StreamKind};
use crate::error::Result;

/// NAL unit type of an IDR slice.
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
/// FU-A payload type (RFC 6184 §5.8).
const NAL_FU_A: u8 = 28;
/// FU indicator + FU header.
const FU_HEADER_LEN: usize = 2;

/// H.264 RTP payloader (RFC 6184).
///
/// Converts Annex B access units into RTP packets using two of the
/// packetization modes of RFC 6184:
///
/// - **Single NAL Unit** (§5.6): a NAL that fits in one packet is sent
///   as-is after the 12-byte RTP header.
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split across packets.
///   Each fragment carries a 2-byte FU header before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to max - 14 bytes)
///   ```
///
///   The first NAL byte is not sent; it is rebuilt by the receiver from
///   the FU indicator and header.
///
/// The marker bit is set on the last packet of the access unit.
///
/// ## IDR synchronization
///
/// Nothing is emitted until an access unit containing an IDR slice (NAL
/// type 5) is seen, so clients never receive a partial GOP.
#[derive(Debug, Default)]
pub struct H264Payloader {
    synced: bool,
}

impl H264Payloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the first IDR has been observed.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    fn packetize_nal(
        rtp: &mut RtpHeader,
        nal: &[u8],
        is_last_nal: bool,
        max_packet_size: usize,
        packets: &mut Vec<Vec<u8>>,
    ) {
        if nal.is_empty() {
            return;
        }

        if nal.len() + HEADER_LEN <= max_packet_size {
            let hdr = rtp.write(is_last_nal);
            let mut packet = Vec::with_capacity(HEADER_LEN + nal.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal);
            packets.push(packet);
            return;
        }

        let nal_header = nal[0];
        let nal_type = nal_header & 0x1F;
        let fu_indicator = (nal_header & 0xE0) | NAL_FU_A;
        let body = &nal[1..];
        let max_fragment = max_packet_size - HEADER_LEN - FU_HEADER_LEN;

        let before = packets.len();
        for (i, chunk) in body.chunks(max_fragment).enumerate() {
            let first = i == 0;
            let last = body.len() - i * max_fragment <= max_fragment;

            let mut fu_header = nal_type;
            if first {
                fu_header |= 0x80;
            }
            if last {
                fu_header |= 0x40;
            }

            let hdr = rtp.write(is_last_nal && last);
            let mut packet = Vec::with_capacity(HEADER_LEN + FU_HEADER_LEN + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal.len(),
            fragments = packets.len() - before,
            "FU-A fragmented NAL unit"
        );
    }
}

impl Payloader for H264Payloader {
    const KIND: StreamKind = StreamKind::H264;

    fn packetize(
        &mut self,
        rtp: &mut RtpHeader,
        unit: &[u8],
        max_packet_size: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let nal_units = nal_units(unit);
        let mut packets = Vec::new();

        if !self.synced {
            if !nal_units.iter().any(|nal| nal_type(nal) == Some(NAL_IDR)) {
                return Ok(packets);
            }
            tracing::debug!("first IDR observed, output enabled");
            self.synced = true;
        }

        let count = nal_units.len();
        for (i, nal) in nal_units.into_iter().enumerate() {
            Self::packetize_nal(rtp, nal, i + 1 == count, max_packet_size, &mut packets);
        }
        Ok(packets)
    }
}

/// NAL unit type (lower five bits of the first byte).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL to ensure boundaries
/// between adjacent NALs are computed correctly when mixed 3-byte
/// and 4-byte start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;
    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(&data[start..end]);
        }
    }
    nal_units
}

/// NAL units of an access unit. Input without any start code is treated as
/// a single bare NAL.
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let units = extract_nal_units(data);
    if units.is_empty() && !data.is_empty() {
        return vec![data];
    }
    units
}

/// Remove a leading Annex B start code, if any.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.starts_with(&[0, 0, 0, 1]) {
        &data[4..]
    } else if data.starts_with(&[0, 0, 1]) {
        &data[3..]
    } else {
        data
    }
}

/// Latest SPS/PPS, as announced in DESCRIBE.
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    explicit: bool,
}

impl ParameterSets {
    /// Store a configuration NAL delivered out-of-band by the encoder.
    pub fn set(&mut self, key: ConfigKey, data: &[u8]) {
        let nal = Bytes::copy_from_slice(strip_start_code(data));
        if nal.is_empty() {
            return;
        }
        tracing::debug!(?key, len = nal.len(), "H.264 parameter set stored");
        match key {
            ConfigKey::Sps => self.sps = Some(nal),
            ConfigKey::Pps => self.pps = Some(nal),
        }
        self.explicit = true;
    }

    /// Pick up SPS/PPS NAL units carried in-band, unless the encoder has
    /// already supplied them out-of-band.
    pub fn capture_in_band(&mut self, unit: &[u8]) {
        if self.explicit {
            return;
        }
        for nal in extract_nal_units(unit) {
            match nal_type(nal) {
                Some(NAL_SPS) if self.sps.is_none() => {
                    tracing::debug!(len = nal.len(), "H.264 SPS captured from bitstream");
                    self.sps = Some(Bytes::copy_from_slice(nal));
                }
                Some(NAL_PPS) if self.pps.is_none() => {
                    tracing::debug!(len = nal.len(), "H.264 PPS captured from bitstream");
                    self.pps = Some(Bytes::copy_from_slice(nal));
                }
                _ => {}
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// `profile-level-id` from SPS bytes 1..4 (RFC 6184 §8.1).
    pub fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(hex::encode(&sps[1..4]))
    }

    /// `sprop-parameter-sets` value: Base64 SPS and PPS joined by a comma.
    pub fn sprop_parameter_sets(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        let pps = self.pps.as_deref()?;
        Some(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1400;

    fn rtp() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 1000)
    }

    fn seq(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[2], packet[3]])
    }

    fn annex_b(nal: &[u8]) -> Vec<u8> {
        [&[0u8, 0, 0, 1][..], nal].concat()
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
        assert_eq!(nal_units(&[0x65, 0x01]), vec![&[0x65, 0x01][..]]);
    }

    #[test]
    fn strip_start_codes() {
        assert_eq!(strip_start_code(&[0, 0, 0, 1, 0x67]), &[0x67]);
        assert_eq!(strip_start_code(&[0, 0, 1, 0x68]), &[0x68]);
        assert_eq!(strip_start_code(&[0x68]), &[0x68]);
    }

    // --- Packetization ---

    #[test]
    fn no_output_before_first_idr() {
        let mut p = H264Payloader::new();
        let mut h = rtp();
        for _ in 0..20 {
            let packets = p.packetize(&mut h, &annex_b(&[0x41, 1, 2, 3]), MAX).unwrap();
            assert!(packets.is_empty());
        }
        assert!(!p.is_synced());
        assert_eq!(h.sequence(), 1000);

        let packets = p.packetize(&mut h, &annex_b(&[0x65, 1, 2, 3]), MAX).unwrap();
        assert_eq!(packets.len(), 1);
        let packets = p.packetize(&mut h, &annex_b(&[0x41, 1, 2, 3]), MAX).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn small_nal_single_packet_with_marker() {
        let mut p = H264Payloader::new();
        let mut h = rtp();
        let packets = p.packetize(&mut h, &annex_b(&[0x65, 0xAA, 0xBB]), MAX).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 3);
        assert_eq!(packets[0][1] & 0x80, 0x80);
        assert_eq!(&packets[0][12..], &[0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn nal_exactly_filling_packet_is_not_fragmented() {
        let mut p = H264Payloader::new();
        let mut h = rtp();
        let mut nal = vec![0x65];
        nal.resize(MAX - 12, 0x11);
        let packets = p.packetize(&mut h, &annex_b(&nal), MAX).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), MAX);
    }

    #[test]
    fn fragmentation_reconstructs_nal() {
        let mut p = H264Payloader::new();
        let mut h = rtp();
        let size = 5000usize;
        let mut nal = vec![0x65];
        nal.extend((1..size).map(|i| (i % 251) as u8));

        let packets = p.packetize(&mut h, &annex_b(&nal), MAX).unwrap();
        let expected = (size - 1).div_ceil(MAX - 14);
        assert_eq!(packets.len(), expected);

        let mut body = Vec::new();
        for (i, pkt) in packets.iter().enumerate() {
            assert!(pkt.len() <= MAX);
            assert_eq!(pkt[12], (0x65 & 0xE0) | 28);
            let fu = pkt[13];
            assert_eq!(fu & 0x1F, 5);
            assert_eq!(fu & 0x80 != 0, i == 0, "S bit only on first fragment");
            let last = i + 1 == packets.len();
            assert_eq!(fu & 0x40 != 0, last, "E bit only on last fragment");
            assert_eq!(pkt[1] & 0x80 != 0, last, "marker only on last fragment");
            assert_eq!(seq(pkt), 1000 + i as u16);
            body.extend_from_slice(&pkt[14..]);
        }
        assert_eq!(body, &nal[1..]);
    }

    #[test]
    fn marker_only_on_last_nal_of_access_unit() {
        let mut p = H264Payloader::new();
        let mut h = rtp();
        let au = [annex_b(&[0x67, 0x42, 0, 0x1E]), annex_b(&[0x68, 0xCE]), annex_b(&[0x65, 1])].concat();
        let packets = p.packetize(&mut h, &au, MAX).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0][1] & 0x80, 0);
        assert_eq!(packets[1][1] & 0x80, 0);
        assert_eq!(packets[2][1] & 0x80, 0x80);
    }

    // --- Parameter sets ---

    #[test]
    fn parameter_sets_from_config_buffers() {
        let mut ps = ParameterSets::default();
        assert!(!ps.is_complete());
        ps.set(ConfigKey::Sps, &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E]);
        assert!(ps.sprop_parameter_sets().is_none());
        ps.set(ConfigKey::Pps, &[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80]);
        assert!(ps.is_complete());
        assert_eq!(ps.profile_level_id().as_deref(), Some("42001e"));
        assert_eq!(ps.sprop_parameter_sets().as_deref(), Some("Z0IAHg==,aM44gA=="));
    }

    #[test]
    fn parameter_sets_captured_in_band() {
        let mut ps = ParameterSets::default();
        let au = [annex_b(&[0x67, 0x42, 0x00, 0x1E]), annex_b(&[0x68, 0xCE]), annex_b(&[0x65, 0x88])].concat();
        ps.capture_in_band(&au);
        assert!(ps.is_complete());
    }

    #[test]
    fn explicit_config_wins_over_in_band() {
        let mut ps = ParameterSets::default();
        ps.set(ConfigKey::Sps, &[0x67, 0x64, 0x00, 0x28]);
        ps.capture_in_band(&[annex_b(&[0x67, 0x42, 0x00, 0x1E]), annex_b(&[0x68, 0xCE])].concat());
        assert_eq!(ps.profile_level_id().as_deref(), Some("640028"));
        assert!(!ps.is_complete());
    }
}
