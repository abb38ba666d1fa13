//! Minimal SDP offer/answer (RFC 4566 bodies, RFC 3264 negotiation).
//!
//! Grounded on spec §4.7 and `original_source/WiPhone/tinySIP.cpp`'s
//! `sdpBody()`/SDP-parsing routines. Only what offer/answer for a single
//! `m=audio` stream needs is implemented; multipart bodies, video, and
//! additional attribute lines are out of scope (spec Non-goals).

use std::net::IpAddr;

use crate::error::{Error, Result};

/// RTP payload type for G.722.
pub const PT_G722: u8 = 9;
/// RTP payload type for G.711 A-law (PCMA).
pub const PT_PCMA: u8 = 8;
/// RTP payload type for G.711 u-law (PCMU).
pub const PT_PCMU: u8 = 0;

/// The engine's codec preference order, matching
/// `TinySIP::SUPPORTED_RTP_PAYLOADS` in the original source.
pub const SUPPORTED_PAYLOADS: [u8; 3] = [PT_G722, PT_PCMA, PT_PCMU];

/// Maps a payload type to its `rtpmap` encoding name.
pub fn codec_name(pt: u8) -> Option<&'static str> {
    match pt {
        PT_G722 => Some("G722"),
        PT_PCMA => Some("PCMA"),
        PT_PCMU => Some("PCMU"),
        _ => None,
    }
}

/// Computes the local RTP port from the SDP session id, per spec §4.5:
/// `50000 + 2*(session_id % 4096)`.
pub fn local_audio_port(session_id: u64) -> u16 {
    (50000 + 2 * (session_id % 4096)) as u16
}

/// Builds an offered (or answered) SDP body for a single audio stream.
pub struct SdpBody {
    pub session_id: u64,
    pub local_ip: IpAddr,
    pub local_port: u16,
    /// Payload types to advertise, in preference order; each must be one of
    /// [`SUPPORTED_PAYLOADS`].
    pub payload_types: Vec<u8>,
}

impl SdpBody {
    /// Renders the body text (CRLF-terminated lines, per RFC 4566).
    pub fn render(&self) -> String {
        let pts = self
            .payload_types
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        let mut body = String::new();
        body.push_str("v=0\r\n");
        body.push_str(&format!(
            "o=- {sid} {sid} IN IP4 {ip}\r\n",
            sid = self.session_id,
            ip = self.local_ip
        ));
        body.push_str("s=WiPhone\r\n");
        body.push_str(&format!("c=IN IP4 {}\r\n", self.local_ip));
        body.push_str("t=0 0\r\n");
        body.push_str(&format!("m=audio {} RTP/AVP {}\r\n", self.local_port, pts));
        body.push_str(&format!("a=rtcp:{}\r\n", self.local_port + 1));
        for pt in &self.payload_types {
            if let Some(name) = codec_name(*pt) {
                body.push_str(&format!("a=rtpmap:{pt} {name}/8000\r\n"));
            }
        }
        body.push_str("a=sendrecv\r\n");
        body
    }
}

/// The outcome of negotiating an inbound SDP offer/answer against the
/// engine's supported codec set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub payload_type: u8,
}

/// Parses `body` as an SDP offer/answer and picks the first payload type
/// (in the offer's own order) that is also in `supported`.
///
/// Returns [`Error::UnsupportedCodec`] if no `m=audio` line is present or no
/// offered payload type is supported (spec §4.7: engine SHOULD reply 488).
pub fn negotiate(body: &str, supported: &[u8]) -> Result<Negotiated> {
    let mut session_addr: Option<IpAddr> = None;
    let mut media_addr: Option<IpAddr> = None;
    let mut remote_port: Option<u16> = None;
    let mut chosen_pt: Option<u8> = None;
    let mut saw_v0 = false;
    let mut in_media = false;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line == "v=0" {
            saw_v0 = true;
        } else if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            let addr = rest.trim().parse().ok();
            if in_media {
                media_addr = addr;
            } else {
                session_addr = addr;
            }
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            in_media = true;
            let mut parts = rest.split_whitespace();
            let Some(port) = parts.next().and_then(|p| p.parse().ok()) else {
                continue;
            };
            remote_port = Some(port);
            // "RTP/AVP" token, then the payload type list.
            let _proto = parts.next();
            for pt_str in parts {
                if let Ok(pt) = pt_str.parse::<u8>() {
                    if chosen_pt.is_none() && supported.contains(&pt) {
                        chosen_pt = Some(pt);
                    }
                }
            }
        }
    }

    if !saw_v0 {
        return Err(Error::Parse("SDP missing v=0".into()));
    }

    let addr = media_addr.or(session_addr).ok_or(Error::UnsupportedCodec)?;
    let (Some(port), Some(pt)) = (remote_port, chosen_pt) else {
        return Err(Error::UnsupportedCodec);
    };

    Ok(Negotiated {
        remote_addr: addr,
        remote_port: port,
        payload_type: pt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn renders_offer_with_supported_codecs() {
        let body = SdpBody {
            session_id: 12345,
            local_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
            local_port: 50002,
            payload_types: SUPPORTED_PAYLOADS.to_vec(),
        };
        let rendered = body.render();
        assert!(rendered.contains("m=audio 50002 RTP/AVP 9 8 0"));
        assert!(rendered.contains("a=rtpmap:9 G722/8000"));
        assert!(rendered.contains("a=rtcp:50003"));
        assert!(rendered.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn negotiates_scenario_s2_prefers_first_supported_in_offer_order() {
        let sdp = "v=0\r\n\
o=- 1 1 IN IP4 198.51.100.7\r\n\
s=-\r\n\
c=IN IP4 198.51.100.7\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0 9\r\n";
        let negotiated = negotiate(sdp, &SUPPORTED_PAYLOADS).unwrap();
        assert_eq!(negotiated.remote_port, 40000);
        assert_eq!(negotiated.payload_type, PT_PCMU);
    }

    #[test]
    fn media_level_c_line_overrides_session_level() {
        let sdp = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 9\r\n\
c=IN IP4 10.0.0.2\r\n";
        let negotiated = negotiate(sdp, &SUPPORTED_PAYLOADS).unwrap();
        assert_eq!(negotiated.remote_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn unsupported_codec_only_is_rejected() {
        let sdp = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.1\r\n\
s=-\r\n\
c=IN IP4 10.0.0.1\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 18\r\n";
        let err = negotiate(sdp, &SUPPORTED_PAYLOADS).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCodec));
    }

    #[test]
    fn local_audio_port_wraps_modulo_4096() {
        assert_eq!(local_audio_port(0), 50000);
        assert_eq!(local_audio_port(1), 50002);
        assert_eq!(local_audio_port(4096), 50000);
    }
}
