//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;

/// Builds a baseline 4:2:0 JPEG whose entropy-coded scan is `scan_len` bytes.
///
/// The headers take 171 bytes, so the whole file is `scan_len + 171`.
pub fn baseline_jpeg(width: u16, height: u16, scan_len: usize) -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];

    // DQT with a luma and a chroma table
    jpeg.extend([0xFF, 0xDB, 0x00, 0x84]);
    jpeg.push(0x00);
    jpeg.extend(std::iter::repeat(0x08).take(64));
    jpeg.push(0x01);
    jpeg.extend(std::iter::repeat(0x09).take(64));

    // SOF0, three components, Y sampled 2x2
    jpeg.extend([0xFF, 0xC0, 0x00, 0x11, 0x08]);
    jpeg.extend(height.to_be_bytes());
    jpeg.extend(width.to_be_bytes());
    jpeg.extend([0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);

    // SOS
    jpeg.extend([0xFF, 0xDA, 0x00, 0x0C, 0x03]);
    jpeg.extend([0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00]);

    jpeg.extend((0..scan_len).map(|i| (i % 251) as u8));
    jpeg.extend([0xFF, 0xD9]);
    jpeg
}

/// Size of everything in [`baseline_jpeg`] except the scan
pub const BASELINE_OVERHEAD: usize = 171;

/// Writes `count` frames into `dir` as `frame_NNN.jpg`
pub fn write_frames(dir: &Path, count: usize, scan_len: usize) {
    for i in 0..count {
        let jpeg = baseline_jpeg(320, 240, scan_len + i);
        std::fs::write(dir.join(format!("frame_{:03}.jpg", i)), jpeg).unwrap();
    }
}
