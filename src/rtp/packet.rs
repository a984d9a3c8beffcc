//! RTP packet structures (RFC 3550)

use bytes::{BufMut, Bytes, BytesMut};

use super::{RTP_HEADER_SIZE, RTP_PAYLOAD_TYPE_JPEG, RTP_VERSION};

/// Size of the `$`-prefixed frame header used for RTP over the RTSP
/// TCP connection (RFC 2326 Section 10.12)
pub const INTERLEAVED_HEADER_SIZE: usize = 4;

/// RTP fixed header (12 bytes, no CSRC list or extension)
///
/// RFC 3550 Section 5.1:
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit (set on last packet of frame)
    pub marker: bool,

    /// Payload type (26 for JPEG)
    pub payload_type: u8,

    /// Sequence number (16 bits, wraps around)
    pub sequence_number: u16,

    /// Timestamp (90kHz clock for video)
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    /// Creates a JPEG payload header
    pub fn jpeg(sequence_number: u16, timestamp: u32, ssrc: u32, marker: bool) -> Self {
        Self {
            marker,
            payload_type: RTP_PAYLOAD_TYPE_JPEG,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    /// Parses the fixed header from the start of a packet.
    ///
    /// Returns `None` for short buffers or a version other than 2.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE || data[0] >> 6 != RTP_VERSION {
            return None;
        }

        Some(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Appends the 12 header bytes to `buf`
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(RTP_VERSION << 6); // P=0, X=0, CC=0
        buf.put_u8(if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// Wraps an RTP or RTCP packet for delivery on the RTSP control connection
pub fn interleave(channel: u8, packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(INTERLEAVED_HEADER_SIZE + packet.len());
    buf.put_u8(b'$');
    buf.put_u8(channel);
    buf.put_u16(packet.len() as u16);
    buf.put_slice(packet);
    buf.freeze()
}
