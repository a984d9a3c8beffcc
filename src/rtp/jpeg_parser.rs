//! JPEG parser for RFC 2435 payload extraction
//!
//! RFC 2435 sends only the entropy-coded scan data in the RTP payload. The
//! receiver rebuilds the JPEG headers from the type, Q, and dimensions in the
//! RTP/JPEG header, plus the quantization tables carried in-band on the first
//! packet. This parser pulls exactly those pieces out of a baseline JPEG
//! without copying anything.

use thiserror::Error;

use super::{JpegType, MAX_DIMENSION, QTABLE_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JpegParseError {
    #[error("invalid JPEG: too short")]
    TooShort,

    #[error("missing SOI marker")]
    MissingSoi,

    #[error("missing SOF marker before scan")]
    MissingSof,

    #[error("missing SOS marker")]
    MissingSos,

    #[error("missing EOI marker")]
    MissingEoi,

    #[error("segment at offset {0} runs past end of data")]
    Truncated(usize),

    #[error("empty scan data")]
    EmptyScan,

    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u16, height: u16 },

    #[error("unsupported JPEG format: {0}")]
    Unsupported(&'static str),
}

/// JPEG marker codes
mod markers {
    pub const SOI: u8 = 0xD8; // Start of Image
    pub const EOI: u8 = 0xD9; // End of Image
    pub const SOS: u8 = 0xDA; // Start of Scan
    pub const DQT: u8 = 0xDB; // Define Quantization Table
    pub const DRI: u8 = 0xDD; // Define Restart Interval
    pub const SOF0: u8 = 0xC0; // Start of Frame (Baseline)
    pub const SOF2: u8 = 0xC2; // Start of Frame (Progressive)
    pub const DHT: u8 = 0xC4; // Define Huffman Table
    pub const JPG: u8 = 0xC8;
    pub const DAC: u8 = 0xCC; // Define Arithmetic Coding
    pub const TEM: u8 = 0x01;
    pub const RST0: u8 = 0xD0;
    pub const RST7: u8 = 0xD7;
}

/// Parsed JPEG information, borrowing from the frame payload
#[derive(Debug, Clone, Copy)]
pub struct JpegInfo<'a> {
    /// Width in pixels
    pub width: u16,

    /// Height in pixels
    pub height: u16,

    pub jpeg_type: JpegType,

    /// 8-bit quantization table used by the luma component (zigzag order)
    pub luma_table: Option<&'a [u8]>,

    /// 8-bit quantization table used by both chroma components
    pub chroma_table: Option<&'a [u8]>,

    /// Entropy-coded scan data, SOS header and EOI excluded
    pub scan: &'a [u8],
}

impl<'a> JpegInfo<'a> {
    /// Both tables, when the frame defines them
    pub fn quant_tables(&self) -> Option<(&'a [u8], &'a [u8])> {
        Some((self.luma_table?, self.chroma_table?))
    }
}

#[derive(Default)]
struct FrameParams {
    width: u16,
    height: u16,
    jpeg_type: Option<JpegType>,
    luma_tq: usize,
    chroma_tq: usize,
}

/// Parses a baseline JPEG and locates the pieces RFC 2435 transmits
pub fn parse_jpeg_for_rtp(data: &[u8]) -> Result<JpegInfo<'_>, JpegParseError> {
    validate_soi(data)?;

    let mut tables: [Option<&[u8]>; 4] = [None; 4];
    let mut frame: Option<FrameParams> = None;
    let mut pos = 2;

    loop {
        // Markers may be preceded by any number of 0xFF fill bytes
        while pos < data.len() && data[pos] == 0xFF && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if pos + 1 >= data.len() {
            return Err(JpegParseError::MissingSos);
        }
        if data[pos] != 0xFF {
            return Err(JpegParseError::Truncated(pos));
        }

        let marker = data[pos + 1];
        pos += 2;

        match marker {
            markers::SOI | markers::TEM | markers::RST0..=markers::RST7 => continue,
            markers::EOI => return Err(JpegParseError::MissingSos),
            _ => {}
        }

        let segment = segment_body(data, pos)?;
        let next = pos + 2 + segment.len();

        match marker {
            markers::SOS => {
                let frame = frame.ok_or(JpegParseError::MissingSof)?;
                let scan = scan_data(data, next)?;
                let jpeg_type = frame.jpeg_type.ok_or(JpegParseError::MissingSof)?;

                return Ok(JpegInfo {
                    width: frame.width,
                    height: frame.height,
                    jpeg_type,
                    luma_table: tables[frame.luma_tq],
                    chroma_table: tables[frame.chroma_tq],
                    scan,
                });
            }
            markers::DQT => parse_dqt(segment, &mut tables)?,
            markers::SOF0 => frame = Some(parse_sof(segment)?),
            markers::SOF2 => return Err(JpegParseError::Unsupported("progressive JPEG")),
            0xC1..=0xCF if marker != markers::DHT && marker != markers::JPG && marker != markers::DAC => {
                return Err(JpegParseError::Unsupported("non-baseline JPEG"));
            }
            markers::DRI => {
                if segment.len() >= 2 && (segment[0] != 0 || segment[1] != 0) {
                    return Err(JpegParseError::Unsupported("restart markers"));
                }
            }
            // APPn, COM, DHT: nothing to extract
            _ => {}
        }

        pos = next;
    }
}

/// Quick check that a buffer starts and ends like a JPEG
pub fn validate_jpeg(data: &[u8]) -> Result<(), JpegParseError> {
    validate_soi(data)?;

    if data[data.len() - 2] != 0xFF || data[data.len() - 1] != markers::EOI {
        return Err(JpegParseError::MissingEoi);
    }

    Ok(())
}

fn validate_soi(data: &[u8]) -> Result<(), JpegParseError> {
    if data.len() < 4 {
        return Err(JpegParseError::TooShort);
    }

    if data[0] != 0xFF || data[1] != markers::SOI {
        return Err(JpegParseError::MissingSoi);
    }

    Ok(())
}

/// Returns the segment contents after its 2-byte length field
fn segment_body(data: &[u8], pos: usize) -> Result<&[u8], JpegParseError> {
    if pos + 2 > data.len() {
        return Err(JpegParseError::Truncated(pos));
    }

    let length = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    if length < 2 || pos + length > data.len() {
        return Err(JpegParseError::Truncated(pos));
    }

    Ok(&data[pos + 2..pos + length])
}

/// The scan runs from the end of the SOS header to the final EOI
fn scan_data(data: &[u8], start: usize) -> Result<&[u8], JpegParseError> {
    let end = data
        .windows(2)
        .rposition(|w| w[0] == 0xFF && w[1] == markers::EOI)
        .filter(|&end| end >= start)
        .ok_or(JpegParseError::MissingEoi)?;

    let scan = &data[start..end];
    if scan.is_empty() {
        return Err(JpegParseError::EmptyScan);
    }

    Ok(scan)
}

fn parse_dqt<'a>(
    mut segment: &'a [u8],
    tables: &mut [Option<&'a [u8]>; 4],
) -> Result<(), JpegParseError> {
    // One DQT segment may define several tables back to back
    while let Some((&pq_tq, rest)) = segment.split_first() {
        if pq_tq >> 4 != 0 {
            return Err(JpegParseError::Unsupported("16-bit quantization tables"));
        }
        if rest.len() < QTABLE_SIZE {
            return Err(JpegParseError::Truncated(0));
        }

        tables[usize::from(pq_tq & 0x03)] = Some(&rest[..QTABLE_SIZE]);
        segment = &rest[QTABLE_SIZE..];
    }

    Ok(())
}

fn parse_sof(segment: &[u8]) -> Result<FrameParams, JpegParseError> {
    // precision(1) + height(2) + width(2) + components(1) + 3 * (id, hv, tq)
    if segment.len() < 6 {
        return Err(JpegParseError::Truncated(0));
    }
    if segment[0] != 8 {
        return Err(JpegParseError::Unsupported("sample precision other than 8 bits"));
    }

    let height = u16::from_be_bytes([segment[1], segment[2]]);
    let width = u16::from_be_bytes([segment[3], segment[4]]);
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(JpegParseError::InvalidDimensions { width, height });
    }

    if segment[5] != 3 {
        return Err(JpegParseError::Unsupported("component count other than 3"));
    }
    let components = segment.get(6..15).ok_or(JpegParseError::Truncated(0))?;
    let (y, cb, cr) = (&components[0..3], &components[3..6], &components[6..9]);

    let jpeg_type = match y[1] {
        0x21 => JpegType::Yuv422,
        0x22 => JpegType::Yuv420,
        _ => return Err(JpegParseError::Unsupported("chroma subsampling")),
    };
    if cb[1] != 0x11 || cr[1] != 0x11 {
        return Err(JpegParseError::Unsupported("chroma subsampling"));
    }
    if cb[2] != cr[2] {
        return Err(JpegParseError::Unsupported("separate Cb and Cr tables"));
    }

    Ok(FrameParams {
        width,
        height,
        jpeg_type: Some(jpeg_type),
        luma_tq: usize::from(y[2] & 0x03),
        chroma_tq: usize::from(cb[2] & 0x03),
    })
}

/// Builds a structurally valid baseline JPEG for tests
#[cfg(test)]
pub(crate) fn build_test_jpeg(width: u16, height: u16, y_sampling: u8, scan_len: usize) -> Vec<u8> {
    let mut jpeg = vec![0xFF, markers::SOI];

    // Two quantization tables in one DQT segment
    jpeg.extend([0xFF, markers::DQT, 0x00, 0x84]);
    jpeg.push(0x00);
    jpeg.extend(std::iter::repeat(0x10).take(QTABLE_SIZE));
    jpeg.push(0x01);
    jpeg.extend(std::iter::repeat(0x11).take(QTABLE_SIZE));

    jpeg.extend([0xFF, markers::SOF0, 0x00, 0x11, 0x08]);
    jpeg.extend(height.to_be_bytes());
    jpeg.extend(width.to_be_bytes());
    jpeg.extend([0x03, 0x01, y_sampling, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);

    jpeg.extend([0xFF, markers::SOS, 0x00, 0x0C, 0x03]);
    jpeg.extend([0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00]);

    // Never emits 0xFF, so no marker can appear inside the scan
    jpeg.extend((0..scan_len).map(|i| (i % 200) as u8));
    jpeg.extend([0xFF, markers::EOI]);
    jpeg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_jpeg() {
        let valid = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        assert!(validate_jpeg(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x01, 0x02];
        assert_eq!(validate_jpeg(&invalid), Err(JpegParseError::MissingSoi));

        let unterminated = vec![0xFF, 0xD8, 0x01, 0x02];
        assert_eq!(validate_jpeg(&unterminated), Err(JpegParseError::MissingEoi));
    }

    #[test]
    fn test_parse_baseline_422() {
        let jpeg = build_test_jpeg(640, 480, 0x21, 100);
        let info = parse_jpeg_for_rtp(&jpeg).unwrap();

        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.jpeg_type, JpegType::Yuv422);
        assert_eq!(info.scan.len(), 100);

        let (luma, chroma) = info.quant_tables().unwrap();
        assert!(luma.iter().all(|&b| b == 0x10));
        assert!(chroma.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_parse_420() {
        let jpeg = build_test_jpeg(320, 240, 0x22, 10);
        let info = parse_jpeg_for_rtp(&jpeg).unwrap();
        assert_eq!(info.jpeg_type, JpegType::Yuv420);
    }

    #[test]
    fn test_scan_borrows_payload() {
        let jpeg = build_test_jpeg(160, 120, 0x21, 32);
        let info = parse_jpeg_for_rtp(&jpeg).unwrap();

        let start = jpeg.len() - 2 - 32;
        assert_eq!(info.scan.as_ptr(), jpeg[start..].as_ptr());
    }

    #[test]
    fn test_rejects_444() {
        let jpeg = build_test_jpeg(160, 120, 0x11, 32);
        assert_eq!(
            parse_jpeg_for_rtp(&jpeg).unwrap_err(),
            JpegParseError::Unsupported("chroma subsampling")
        );
    }

    #[test]
    fn test_rejects_oversized_dimensions() {
        let jpeg = build_test_jpeg(2048, 1536, 0x21, 32);
        assert_eq!(
            parse_jpeg_for_rtp(&jpeg).unwrap_err(),
            JpegParseError::InvalidDimensions {
                width: 2048,
                height: 1536
            }
        );
    }

    #[test]
    fn test_rejects_progressive() {
        let mut jpeg = build_test_jpeg(160, 120, 0x21, 32);
        let sof = jpeg.windows(2).position(|w| w == [0xFF, 0xC0]).unwrap();
        jpeg[sof + 1] = 0xC2;

        assert_eq!(
            parse_jpeg_for_rtp(&jpeg).unwrap_err(),
            JpegParseError::Unsupported("progressive JPEG")
        );
    }

    #[test]
    fn test_truncated_segment() {
        let jpeg = build_test_jpeg(160, 120, 0x21, 32);
        let err = parse_jpeg_for_rtp(&jpeg[..40]).unwrap_err();
        assert!(matches!(err, JpegParseError::Truncated(_)));
    }

    #[test]
    fn test_missing_eoi() {
        let jpeg = build_test_jpeg(160, 120, 0x21, 32);
        let err = parse_jpeg_for_rtp(&jpeg[..jpeg.len() - 2]).unwrap_err();
        assert_eq!(err, JpegParseError::MissingEoi);
    }

    #[test]
    fn test_not_a_jpeg() {
        assert_eq!(
            parse_jpeg_for_rtp(b"\x89PNG\r\n\x1a\n").unwrap_err(),
            JpegParseError::MissingSoi
        );
    }
}
