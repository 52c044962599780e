use super::StreamKind;
use super::packetizer::Payloader;
use super::rtp::{HEADER_LEN, RtpHeader};
use crate::error::{Result, StreamError};

/// AU-header-section: 16-bit AU-headers-length plus one 16-bit AU-header.
const AU_HEADER_SECTION_LEN: usize = 4;
/// Largest AU size representable with `sizelength=13`.
const MAX_AU_SIZE: usize = (1 << 13) - 1;

/// AAC RTP payloader, `mode=AAC-hbr` (RFC 3640 §3.3.6).
///
/// Every access unit travels in its own packet behind a 4-byte
/// AU-header-section:
///
/// ```text
/// AU-headers-length = 16 bits     (2 bytes)
/// AU-size (13) | AU-Index (3) = 0 (2 bytes)
/// ```
///
/// Fragmenting one access unit over several packets is not supported; an
/// oversized unit fails with [`StreamError::AccessUnitTooLarge`].
#[derive(Debug, Default)]
pub struct AacPayloader;

impl AacPayloader {
    pub fn new() -> Self {
        Self
    }
}

/// `[0x00, 0x10, size >> 5, size << 3]`
pub fn au_header_section(size: usize) -> [u8; AU_HEADER_SECTION_LEN] {
    [0x00, 0x10, (size >> 5) as u8, (size << 3) as u8]
}

impl Payloader for AacPayloader {
    const KIND: StreamKind = StreamKind::Aac;

    fn packetize(
        &mut self,
        rtp: &mut RtpHeader,
        unit: &[u8],
        max_packet_size: usize,
    ) -> Result<Vec<Vec<u8>>> {
        if unit.is_empty() {
            return Ok(Vec::new());
        }
        let total = HEADER_LEN + AU_HEADER_SECTION_LEN + unit.len();
        if total > max_packet_size || unit.len() > MAX_AU_SIZE {
            return Err(StreamError::AccessUnitTooLarge {
                size: unit.len(),
                max: max_packet_size,
            });
        }

        let mut packet = Vec::with_capacity(total);
        packet.extend_from_slice(&rtp.write(true));
        packet.extend_from_slice(&au_header_section(unit.len()));
        packet.extend_from_slice(unit);
        Ok(vec![packet])
    }
}

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Fields parsed from an MPEG-4 AudioSpecificConfig (ISO/IEC 14496-3 §1.6.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sampling_frequency: u32,
    pub channels: u8,
}

impl AudioSpecificConfig {
    /// Parse the leading fields. Only AAC-LC (object type 2) is accepted.
    ///
    /// ```text
    /// 5 bits   object type
    /// 4 bits   frequency index
    /// 24 bits  frequency          (only if index == 15)
    /// 4 bits   channel configuration
    /// ```
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut bits = BitReader::new(data);
        let object_type = bits.read(5)? as u8;
        if object_type != 2 {
            return None;
        }
        let index = bits.read(4)? as usize;
        let sampling_frequency = if index == 15 {
            bits.read(24)?
        } else {
            *SAMPLING_FREQUENCIES.get(index)?
        };
        let channels = bits.read(4)? as u8;
        if sampling_frequency == 0 || channels == 0 {
            return None;
        }
        Some(Self {
            object_type,
            sampling_frequency,
            channels,
        })
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self, count: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let byte = *self.data.get(self.pos / 8)?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn au_header_encodes_size() {
        let h = au_header_section(371);
        assert_eq!(h[0], 0x00);
        assert_eq!(h[1], 0x10);
        let size = ((h[2] as usize) << 5) | ((h[3] as usize) >> 3);
        assert_eq!(size, 371);
        assert_eq!(h[3] & 0x07, 0, "AU-Index must be 0");
    }

    #[test]
    fn access_unit_packet_layout() {
        let mut h = RtpHeader::new(96, 1, 7);
        let unit = vec![0x21; 200];
        let packets = AacPayloader::new().packetize(&mut h, &unit, 1400).unwrap();
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(p.len(), 12 + 4 + 200);
        assert_eq!(p[1] & 0x80, 0x80, "every AU packet carries the marker");
        assert_eq!(&p[12..16], &au_header_section(200));
        assert_eq!(&p[16..], &unit[..]);
    }

    #[test]
    fn oversized_access_unit_is_rejected() {
        let mut h = RtpHeader::new(96, 1, 7);
        let err = AacPayloader::new()
            .packetize(&mut h, &vec![0u8; 2000], 1400)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::AccessUnitTooLarge { size: 2000, max: 1400 }
        ));
        assert_eq!(h.sequence(), 7, "nothing was sent");
    }

    #[test]
    fn au_larger_than_size_field_is_rejected() {
        let mut h = RtpHeader::new(96, 1, 0);
        let result = AacPayloader::new().packetize(&mut h, &vec![0u8; 9000], 65000);
        assert!(matches!(result, Err(StreamError::AccessUnitTooLarge { .. })));
    }

    #[test]
    fn parse_aac_lc_config() {
        // AAC-LC, 44.1 kHz (index 4), stereo
        let cfg = AudioSpecificConfig::parse(&[0x12, 0x10]).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sampling_frequency, 44100);
        assert_eq!(cfg.channels, 2);

        // AAC-LC, 8 kHz (index 11), mono
        let cfg = AudioSpecificConfig::parse(&[0x15, 0x88]).unwrap();
        assert_eq!(cfg.sampling_frequency, 8000);
        assert_eq!(cfg.channels, 1);
    }

    #[test]
    fn parse_explicit_frequency() {
        // object 2, index 15, freq 0x00AC44 (44100), channels 1
        // 00010 1111 000000001010110001000100 0001 -> pad
        let cfg = AudioSpecificConfig::parse(&[0x17, 0x80, 0x56, 0x22, 0x08]).unwrap();
        assert_eq!(cfg.sampling_frequency, 44100);
        assert_eq!(cfg.channels, 1);
    }

    #[test]
    fn parse_rejects_other_profiles_and_truncation() {
        // object type 5 (SBR)
        assert!(AudioSpecificConfig::parse(&[0x2A, 0x10]).is_none());
        assert!(AudioSpecificConfig::parse(&[0x12]).is_none());
        assert!(AudioSpecificConfig::parse(&[]).is_none());
    }
}
