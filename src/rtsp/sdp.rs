//! SDP description of the single MJPEG video stream (RFC 4566)

use std::fmt::Write;
use std::net::IpAddr;

use crate::rtp::{RTP_CLOCK_RATE, RTP_PAYLOAD_TYPE_JPEG};

/// Control attribute for the only track
pub const TRACK_CONTROL: &str = "track1";

/// Builds the DESCRIBE body
pub fn describe(session_id: u64, server_ip: IpAddr, fps: u32) -> String {
    let family = match server_ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };

    let mut sdp = String::with_capacity(256);
    // Writing to a String cannot fail
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=- {id} 1 IN {family} {ip}\r\n\
         s=camstream\r\n\
         c=IN {family} {any}\r\n\
         t=0 0\r\n\
         a=control:*\r\n\
         m=video 0 RTP/AVP {pt}\r\n\
         a=rtpmap:{pt} JPEG/{clock}\r\n\
         a=framerate:{fps}\r\n\
         a=control:{track}\r\n",
        id = session_id,
        family = family,
        ip = server_ip,
        any = if server_ip.is_ipv4() { "0.0.0.0" } else { "::" },
        pt = RTP_PAYLOAD_TYPE_JPEG,
        clock = RTP_CLOCK_RATE,
        fps = fps,
        track = TRACK_CONTROL,
    );
    sdp
}
