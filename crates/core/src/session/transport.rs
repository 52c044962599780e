/// Client transport request parsed from the RTSP `Transport` header
/// (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Client → Server (UDP):
///   Transport: RTP/AVP;unicast;client_port=8000-8001
/// Server → Client:
///   Transport: RTP/AVP/UDP;unicast;client_port=8000-8001;server_port=50124-50125
///
/// Client → Server (TCP interleaved, RFC 2326 §10.12):
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// Server → Client:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP and RTCP over a UDP socket pair aimed at the client's ports.
    Udp { rtp_port: u16, rtcp_port: u16 },
    /// RTP and RTCP framed on the RTSP connection itself.
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

/// Why a `Transport` value was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The profile is neither `RTP/AVP[/UDP]` nor `RTP/AVP/TCP`.
    UnsupportedProfile,
    /// `client_port=` or `interleaved=` is absent or malformed.
    MissingParameter,
}

impl TransportSpec {
    /// Parse a `Transport` header value.
    ///
    /// ## Examples
    ///
    /// ```
    /// use camstream::session::transport::TransportSpec;
    ///
    /// let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(spec, TransportSpec::Udp { rtp_port: 8000, rtcp_port: 8001 });
    ///
    /// let spec = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
    /// assert_eq!(spec, TransportSpec::Interleaved { rtp_channel: 2, rtcp_channel: 3 });
    ///
    /// assert!(TransportSpec::parse("RTP/AVP;unicast").is_err());
    /// ```
    pub fn parse(header: &str) -> Result<Self, TransportError> {
        let header = header.trim();
        if header.starts_with("RTP/AVP/TCP;") {
            let (rtp_channel, rtcp_channel) =
                find_pair(header, "interleaved=").ok_or(TransportError::MissingParameter)?;
            Ok(Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            })
        } else if header.starts_with("RTP/AVP;") || header.starts_with("RTP/AVP/UDP;") {
            let (rtp_port, rtcp_port) =
                find_pair(header, "client_port=").ok_or(TransportError::MissingParameter)?;
            Ok(Self::Udp {
                rtp_port,
                rtcp_port,
            })
        } else {
            Err(TransportError::UnsupportedProfile)
        }
    }

    /// `Transport` value for the SETUP reply; `server_ports` are the locally
    /// bound UDP ports.
    pub fn reply(&self, server_ports: Option<(u16, u16)>) -> String {
        match *self {
            Self::Udp {
                rtp_port,
                rtcp_port,
            } => {
                let (srv_rtp, srv_rtcp) = server_ports.unwrap_or((0, 0));
                format!(
                    "RTP/AVP/UDP;unicast;client_port={}-{};server_port={}-{}",
                    rtp_port, rtcp_port, srv_rtp, srv_rtcp
                )
            }
            Self::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                rtp_channel, rtcp_channel
            ),
        }
    }
}

fn find_pair<T: std::str::FromStr>(header: &str, key: &str) -> Option<(T, T)> {
    header.split(';').find_map(|part| {
        let (a, b) = part.trim().strip_prefix(key)?.split_once('-')?;
        Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
    })
}
