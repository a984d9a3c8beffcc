//! RTP/JPEG packetization according to RFC 2435
//!
//! A frame is fragmented lazily: [`RtpPacketizer::packetize`] returns an
//! iterator that builds one packet per `next()` call, so a session never holds
//! more than the packet it is currently sending.

mod jpeg;
mod jpeg_parser;
mod packet;

pub use jpeg::{write_quant_tables, JpegHeader, JpegType};
pub use jpeg_parser::{parse_jpeg_for_rtp, validate_jpeg, JpegInfo, JpegParseError};
pub use packet::{interleave, RtpHeader, INTERLEAVED_HEADER_SIZE};

#[cfg(test)]
pub(crate) use jpeg_parser::build_test_jpeg;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

use crate::pool::Frame;

/// RTP protocol constants
pub const RTP_VERSION: u8 = 2;
pub const RTP_PAYLOAD_TYPE_JPEG: u8 = 26;
pub const RTP_HEADER_SIZE: usize = 12;
pub const JPEG_HEADER_SIZE: usize = 8;
pub const QTABLE_HEADER_SIZE: usize = 4;
pub const QTABLE_SIZE: usize = 64;
pub const RTP_CLOCK_RATE: u32 = 90000; // Standard 90kHz clock for video
pub const DEFAULT_MTU: usize = 1400;

/// Q value announcing in-band quantization tables
pub const Q_DYNAMIC_TABLES: u8 = 128;

/// Q value used when the frame carries no usable tables
pub const Q_DEFAULT: u8 = 0x5e;

/// Width and height travel as 8-pixel block counts in one byte each
pub const MAX_DIMENSION: u16 = 255 * 8;

/// Smallest MTU that fits all headers of a first fragment plus one byte
pub const MIN_MTU: usize =
    RTP_HEADER_SIZE + JPEG_HEADER_SIZE + QTABLE_HEADER_SIZE + 2 * QTABLE_SIZE + 1;

const MAX_FRAGMENT_OFFSET: usize = 0x00FF_FFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketizerError {
    #[error("MTU {mtu} is below the {min} byte RTP/JPEG minimum")]
    FrameTooLarge { mtu: usize, min: usize },

    #[error("invalid JPEG: {0}")]
    InvalidJpeg(#[from] JpegParseError),

    #[error("scan data of {0} bytes exceeds the 24-bit fragment offset")]
    ScanTooLong(usize),
}

/// Statistics for RTP packetizer
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PacketizerStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub current_seq: u16,
}

/// Maps monotonic capture instants onto the 90kHz RTP timeline
#[derive(Debug, Clone, Copy)]
pub struct RtpClock {
    epoch: Instant,
    offset: u32,
}

impl RtpClock {
    /// `offset` is the RTP timestamp reported for `epoch`
    pub fn new(epoch: Instant, offset: u32) -> Self {
        Self { epoch, offset }
    }

    pub fn timestamp(&self, at: Instant) -> u32 {
        let elapsed = at.saturating_duration_since(self.epoch);
        let ticks = elapsed.as_micros() * u128::from(RTP_CLOCK_RATE) / 1_000_000;
        // RTP timestamps wrap modulo 2^32
        self.offset.wrapping_add(ticks as u32)
    }
}

/// Per-session RTP/JPEG packetizer
///
/// Owns the session's sequence counter and clock. Not shared between
/// sessions; each negotiated stream gets its own.
#[derive(Debug)]
pub struct RtpPacketizer {
    ssrc: u32,
    mtu: usize,
    sequence: u16,
    clock: RtpClock,
    stats: PacketizerStats,
}

impl RtpPacketizer {
    /// Creates a new RTP packetizer
    ///
    /// # Arguments
    /// * `ssrc` - Synchronization source identifier (unique per stream)
    /// * `mtu` - Largest packet to emit, RTP header included
    pub fn new(ssrc: u32, mtu: usize) -> Result<Self, PacketizerError> {
        if mtu < MIN_MTU {
            return Err(PacketizerError::FrameTooLarge { mtu, min: MIN_MTU });
        }

        Ok(Self {
            ssrc,
            mtu,
            sequence: 0,
            clock: RtpClock::new(Instant::now(), 0),
            stats: PacketizerStats::default(),
        })
    }

    /// Starts the sequence counter at `sequence` instead of zero
    pub fn with_initial_sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_clock(mut self, clock: RtpClock) -> Self {
        self.clock = clock;
        self
    }

    /// Packetizes a pooled frame
    pub fn packetize<'a>(&'a mut self, frame: &'a Frame) -> Result<RtpFragments<'a>, PacketizerError> {
        self.packetize_jpeg(frame.payload(), frame.captured_at())
    }

    /// Packetizes raw JPEG bytes captured at `captured_at`
    ///
    /// Nothing is consumed from the sequence space until the returned
    /// iterator is advanced.
    pub fn packetize_jpeg<'a>(
        &'a mut self,
        jpeg: &'a [u8],
        captured_at: Instant,
    ) -> Result<RtpFragments<'a>, PacketizerError> {
        let info = parse_jpeg_for_rtp(jpeg)?;
        if info.scan.len() > MAX_FRAGMENT_OFFSET {
            return Err(PacketizerError::ScanTooLong(info.scan.len()));
        }

        let timestamp = self.clock.timestamp(captured_at);

        Ok(RtpFragments {
            packetizer: self,
            info,
            timestamp,
            offset: 0,
            done: false,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sequence number the next packet will carry
    pub fn sequence_number(&self) -> u16 {
        self.sequence
    }

    pub fn stats(&self) -> PacketizerStats {
        PacketizerStats {
            current_seq: self.sequence,
            ..self.stats
        }
    }
}

/// Lazy sequence of RTP packets covering one frame
///
/// Finite and not restartable. Dropping it early leaves the sequence counter
/// at the last packet actually produced.
pub struct RtpFragments<'a> {
    packetizer: &'a mut RtpPacketizer,
    info: JpegInfo<'a>,
    timestamp: u32,
    offset: usize,
    done: bool,
}

impl RtpFragments<'_> {
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn jpeg_info(&self) -> &JpegInfo<'_> {
        &self.info
    }
}

impl Iterator for RtpFragments<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.done {
            return None;
        }

        let scan = self.info.scan;
        let first = self.offset == 0;

        // Quantization tables ride along in the first fragment only
        let tables = if first { self.info.quant_tables() } else { None };
        let q = match self.info.quant_tables() {
            Some(_) => Q_DYNAMIC_TABLES,
            None => Q_DEFAULT,
        };

        let mut overhead = RTP_HEADER_SIZE + JPEG_HEADER_SIZE;
        if tables.is_some() {
            overhead += QTABLE_HEADER_SIZE + 2 * QTABLE_SIZE;
        }

        let room = self.packetizer.mtu - overhead;
        let len = room.min(scan.len() - self.offset);
        let last = self.offset + len >= scan.len();

        let mut buf = BytesMut::with_capacity(overhead + len);
        RtpHeader::jpeg(
            self.packetizer.sequence,
            self.timestamp,
            self.packetizer.ssrc,
            last,
        )
        .write_to(&mut buf);
        JpegHeader::new(
            self.offset as u32,
            self.info.width,
            self.info.height,
            self.info.jpeg_type,
            q,
        )
        .write_to(&mut buf);
        if let Some((luma, chroma)) = tables {
            write_quant_tables(&mut buf, luma, chroma);
        }
        buf.put_slice(&scan[self.offset..self.offset + len]);

        let packet = buf.freeze();

        let p = &mut *self.packetizer;
        p.sequence = p.sequence.wrapping_add(1);
        p.stats.packets_sent += 1;
        p.stats.bytes_sent += packet.len() as u64;
        self.offset += len;
        if last {
            p.stats.frames_sent += 1;
            self.done = true;
        }

        Some(packet)
    }
}
