//! JPEG-specific RTP header structures (RFC 2435)

use bytes::BufMut;

use super::QTABLE_SIZE;

/// RFC 2435 image types for baseline YCbCr JPEG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JpegType {
    /// Chroma downsampled horizontally by 2 (4:2:2)
    Yuv422 = 0,

    /// Chroma downsampled horizontally and vertically by 2 (4:2:0)
    Yuv420 = 1,
}

impl JpegType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Yuv422),
            1 => Some(Self::Yuv420),
            _ => None,
        }
    }
}

/// JPEG main header (RFC 2435 Section 3.1)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Type-specific |              Fragment Offset                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      Type     |       Q       |     Width     |     Height    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegHeader {
    /// Byte offset of this fragment within the scan data (24 bits)
    pub fragment_offset: u32,

    pub jpeg_type: JpegType,

    /// Quantization selector; 128..=255 means tables travel in-band
    pub q: u8,

    /// Frame width in 8-pixel blocks
    pub width_blocks: u8,

    /// Frame height in 8-pixel blocks
    pub height_blocks: u8,
}

impl JpegHeader {
    pub fn new(fragment_offset: u32, width: u16, height: u16, jpeg_type: JpegType, q: u8) -> Self {
        Self {
            fragment_offset,
            jpeg_type,
            q,
            width_blocks: (width / 8) as u8,
            height_blocks: (height / 8) as u8,
        }
    }

    /// Parses the 8-byte header that follows the RTP header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }

        Some(Self {
            fragment_offset: u32::from_be_bytes([0, data[1], data[2], data[3]]),
            jpeg_type: JpegType::from_u8(data[4])?,
            q: data[5],
            width_blocks: data[6],
            height_blocks: data[7],
        })
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(0); // type-specific, progressive scan not used
        buf.put_uint(u64::from(self.fragment_offset & 0x00FF_FFFF), 3);
        buf.put_u8(self.jpeg_type as u8);
        buf.put_u8(self.q);
        buf.put_u8(self.width_blocks);
        buf.put_u8(self.height_blocks);
    }

    pub fn width(&self) -> u32 {
        u32::from(self.width_blocks) * 8
    }

    pub fn height(&self) -> u32 {
        u32::from(self.height_blocks) * 8
    }
}

/// Writes the quantization table header plus luma and chroma tables
/// (RFC 2435 Section 3.1.8). Only sent in the first packet of a frame.
pub fn write_quant_tables<B: BufMut>(buf: &mut B, luma: &[u8], chroma: &[u8]) {
    buf.put_u8(0); // MBZ
    buf.put_u8(0); // 8-bit precision for both tables
    buf.put_u16((2 * QTABLE_SIZE) as u16);
    buf.put_slice(&luma[..QTABLE_SIZE]);
    buf.put_slice(&chroma[..QTABLE_SIZE]);
}
