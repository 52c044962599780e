//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses:
//!
//! ```text
//! v=0
//! o=- <sess-id> 1 IN IP4 <addr>
//! s=<session-name>
//! c=IN IP4 <addr>
//! t=0 0
//! m=video 0 RTP/AVP 96
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;profile-level-id=<hex>;sprop-parameter-sets=<sps>,<pps>
//! a=control:trackID=1
//! m=audio 0 RTP/AVP 96                                  (only with a usable AAC config)
//! a=rtpmap:96 mpeg4-generic/<rate>/<channels>
//! a=fmtp:96 profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=<hex>
//! a=control:trackID=2
//! ```

use std::net::IpAddr;

use crate::media::rtp::PAYLOAD_TYPE;

/// The H.264 track as announced in SDP (RFC 6184 §8.1).
#[derive(Debug, Clone)]
pub struct VideoTrack {
    /// Base64 `sps,pps`.
    pub sprop_parameter_sets: String,
    pub profile_level_id: Option<String>,
}

/// The AAC track as announced in SDP (RFC 3640 §4.1).
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub sampling_frequency: u32,
    pub channels: u8,
    /// AudioSpecificConfig bytes.
    pub config: Vec<u8>,
}

/// Generate the session description for the live stream.
pub fn generate_sdp(
    host: IpAddr,
    session_name: &str,
    video: &VideoTrack,
    audio: Option<&AudioTrack>,
) -> String {
    let addr_type = if host.is_ipv6() { "IP6" } else { "IP4" };
    let session_id = crate::media::ntp_timestamp() >> 32;
    let pt = PAYLOAD_TYPE;

    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!("o=- {session_id} 1 IN {addr_type} {host}"),
        format!("s={session_name}"),
        format!("c=IN {addr_type} {host}"),
        "t=0 0".to_string(),
        format!("m=video 0 RTP/AVP {pt}"),
        format!("a=rtpmap:{pt} H264/90000"),
    ];

    let mut fmtp = format!("a=fmtp:{pt} packetization-mode=1");
    if let Some(id) = &video.profile_level_id {
        fmtp.push_str(&format!(";profile-level-id={id}"));
    }
    fmtp.push_str(&format!(";sprop-parameter-sets={}", video.sprop_parameter_sets));
    sdp.push(fmtp);
    sdp.push("a=control:trackID=1".to_string());

    if let Some(audio) = audio {
        sdp.push(format!("m=audio 0 RTP/AVP {pt}"));
        sdp.push(format!(
            "a=rtpmap:{pt} mpeg4-generic/{}/{}",
            audio.sampling_frequency, audio.channels
        ));
        sdp.push(format!(
            "a=fmtp:{pt} profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config={}",
            hex::encode(&audio.config)
        ));
        sdp.push("a=control:trackID=2".to_string());
    }

    tracing::trace!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn video() -> VideoTrack {
        VideoTrack {
            sprop_parameter_sets: "Z0IAHg==,aM44gA==".to_string(),
            profile_level_id: Some("42001e".to_string()),
        }
    }

    #[test]
    fn generates_video_only_sdp() {
        let sdp = generate_sdp(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), "Live", &video(), None);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("s=Live\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains(
            "a=fmtp:96 packetization-mode=1;profile-level-id=42001e;sprop-parameter-sets=Z0IAHg==,aM44gA==\r\n"
        ));
        assert!(sdp.contains("a=control:trackID=1\r\n"));
        assert!(!sdp.contains("m=audio"));

        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        assert!(rtpmap_idx < fmtp_idx, "a=rtpmap must precede a=fmtp");
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn audio_track_follows_video() {
        let audio = AudioTrack {
            sampling_frequency: 44100,
            channels: 2,
            config: vec![0x12, 0x10],
        };
        let sdp = generate_sdp(IpAddr::V4(Ipv4Addr::LOCALHOST), "Live", &video(), Some(&audio));
        assert!(sdp.contains("m=audio 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 mpeg4-generic/44100/2\r\n"));
        assert!(sdp.contains(
            "a=fmtp:96 profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1210\r\n"
        ));
        assert!(sdp.find("m=video").unwrap() < sdp.find("m=audio").unwrap());
        assert!(sdp.ends_with("a=control:trackID=2\r\n"));
    }
}
