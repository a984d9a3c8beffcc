//! `Transport` header negotiation (RFC 2326 Section 12.39)

use std::fmt;

use super::ProtocolError;

/// Delivery parameters a client asked for in SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// RTP and RTCP over UDP to the client's port pair
    Udp { client_rtp: u16, client_rtcp: u16 },

    /// RTP and RTCP framed on the RTSP TCP connection
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl TransportSpec {
    /// Picks the first acceptable alternative from a `Transport` header.
    ///
    /// Alternatives are comma-separated and listed in client preference
    /// order. The error describes the last rejected alternative.
    pub fn parse(header: &str) -> Result<Self, ProtocolError> {
        let mut last_err = ProtocolError::InvalidTransport("empty header".to_string());

        for alternative in header.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match Self::parse_one(alternative) {
                Ok(spec) => return Ok(spec),
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }

    fn parse_one(spec: &str) -> Result<Self, ProtocolError> {
        let mut params = spec.split(';').map(str::trim);
        let profile = params.next().unwrap_or_default();

        let tcp = match profile {
            "RTP/AVP" | "RTP/AVP/UDP" => false,
            "RTP/AVP/TCP" => true,
            other => return Err(ProtocolError::UnsupportedTransport(other.to_string())),
        };

        let mut client_port = None;
        let mut interleaved = None;

        for param in params {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key {
                "multicast" => {
                    return Err(ProtocolError::UnsupportedTransport("multicast".to_string()))
                }
                "client_port" => client_port = Some(parse_pair::<u16>(key, value)?),
                "interleaved" => interleaved = Some(parse_pair::<u8>(key, value)?),
                // unicast, mode, ttl, ssrc and friends carry nothing we act on
                _ => {}
            }
        }

        if tcp {
            let (rtp_channel, rtcp_channel) = interleaved.unwrap_or((0, 1));
            Ok(TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            })
        } else {
            let (client_rtp, client_rtcp) = client_port
                .ok_or_else(|| ProtocolError::InvalidTransport("missing client_port".to_string()))?;
            if client_rtp == 0 {
                return Err(ProtocolError::InvalidTransport("client_port 0".to_string()));
            }
            Ok(TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            })
        }
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self, TransportSpec::Interleaved { .. })
    }

    /// Transport header for the SETUP reply
    ///
    /// `server_ports` is only meaningful for UDP.
    pub fn reply_header(&self, server_ports: Option<(u16, u16)>, ssrc: u32) -> String {
        match self {
            TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let mut header = format!(
                    "RTP/AVP;unicast;client_port={}-{}",
                    client_rtp, client_rtcp
                );
                if let Some((rtp, rtcp)) = server_ports {
                    header.push_str(&format!(";server_port={}-{}", rtp, rtcp));
                }
                header.push_str(&format!(";ssrc={:08X}", ssrc));
                header
            }
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{};ssrc={:08X}",
                rtp_channel, rtcp_channel, ssrc
            ),
        }
    }
}

impl fmt::Display for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSpec::Udp {
                client_rtp,
                client_rtcp,
            } => write!(f, "udp {}-{}", client_rtp, client_rtcp),
            TransportSpec::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => write!(f, "tcp interleaved {}-{}", rtp_channel, rtcp_channel),
        }
    }
}

/// Parses `a-b`, or a lone `a` meaning `a-(a+1)`
fn parse_pair<T>(key: &str, value: &str) -> Result<(T, T), ProtocolError>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    let invalid = || ProtocolError::InvalidTransport(format!("{}={}", key, value));

    let (first, second) = match value.split_once('-') {
        Some((a, b)) => (a.trim(), Some(b.trim())),
        None => (value.trim(), None),
    };

    let first: T = first.parse().map_err(|_| invalid())?;
    let second: T = match second {
        Some(s) => s.parse().map_err(|_| invalid())?,
        None => T::try_from(u32::from(first) + 1).map_err(|_| invalid())?,
    };

    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_transport() {
        let spec = TransportSpec::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Udp {
                client_rtp: 5000,
                client_rtcp: 5001
            }
        );
        assert_eq!(
            spec.reply_header(Some((6970, 6971)), 0x13F97E67),
            "RTP/AVP;unicast;client_port=5000-5001;server_port=6970-6971;ssrc=13F97E67"
        );
    }

    #[test]
    fn test_single_client_port() {
        let spec = TransportSpec::parse("RTP/AVP/UDP;unicast;client_port=7000").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Udp {
                client_rtp: 7000,
                client_rtcp: 7001
            }
        );
    }

    #[test]
    fn test_interleaved_transport() {
        let spec = TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=2-3").unwrap();
        assert_eq!(
            spec,
            TransportSpec::Interleaved {
                rtp_channel: 2,
                rtcp_channel: 3
            }
        );
        assert!(spec.is_interleaved());

        let default = TransportSpec::parse("RTP/AVP/TCP;unicast").unwrap();
        assert_eq!(
            default.reply_header(None, 1),
            "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=00000001"
        );
    }

    #[test]
    fn test_first_acceptable_alternative_wins() {
        let header = "RTP/SAVP;unicast;client_port=1-2, RTP/AVP/TCP;interleaved=0-1";
        assert!(TransportSpec::parse(header).unwrap().is_interleaved());
    }

    #[test]
    fn test_malformed_parameters() {
        assert!(matches!(
            TransportSpec::parse("RTP/AVP;unicast"),
            Err(ProtocolError::InvalidTransport(_))
        ));
        assert!(matches!(
            TransportSpec::parse("RTP/AVP;unicast;client_port=abc-def"),
            Err(ProtocolError::InvalidTransport(_))
        ));
        assert!(matches!(
            TransportSpec::parse("RTP/AVP/TCP;interleaved=0-300"),
            Err(ProtocolError::InvalidTransport(_))
        ));
        assert!(matches!(
            TransportSpec::parse("RTP/AVP;multicast;client_port=5000-5001"),
            Err(ProtocolError::UnsupportedTransport(_))
        ));
        assert!(TransportSpec::parse("").is_err());
    }
}
