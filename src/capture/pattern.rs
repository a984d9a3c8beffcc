//! Synthetic camera producing a moving color-bar pattern

use image::{Rgb, RgbImage};
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};

use super::{CaptureError, FrameSize, FrameSource};
use crate::pool::SlotWriter;

const BARS: [Rgb<u8>; 8] = [
    Rgb([255, 255, 255]),
    Rgb([255, 255, 0]),
    Rgb([0, 255, 255]),
    Rgb([0, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([255, 0, 0]),
    Rgb([0, 0, 255]),
    Rgb([0, 0, 0]),
];

/// Color bars with a sweeping cursor, re-encoded for every frame as a
/// baseline 4:2:0 JPEG so it can be carried over RTP as well as HTTP.
pub struct TestPattern {
    size: FrameSize,
    quality: u8,
    tick: u32,
    image: RgbImage,
}

impl TestPattern {
    pub fn new(size: FrameSize, quality: u8) -> Self {
        let (width, height) = size.dimensions();
        Self {
            size,
            quality,
            tick: 0,
            image: RgbImage::new(width, height),
        }
    }

    fn render(&mut self) {
        let width = self.image.width();
        let height = self.image.height();
        let cursor = (self.tick * 4) % width;
        let bar_width = (width / BARS.len() as u32).max(1);

        for (x, y, pixel) in self.image.enumerate_pixels_mut() {
            *pixel = if x.abs_diff(cursor) < 2 {
                Rgb([128, 128, 128])
            } else if y > height * 3 / 4 {
                // Bottom strip is a grey ramp that scrolls with the cursor
                let v = ((x + self.tick) % width) * 255 / width;
                Rgb([v as u8; 3])
            } else {
                BARS[((x / bar_width) as usize).min(BARS.len() - 1)]
            };
        }
    }
}

impl FrameSource for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn frame_size(&self) -> Option<FrameSize> {
        Some(self.size)
    }

    fn capture(&mut self, slot: &mut SlotWriter) -> Result<(), CaptureError> {
        self.render();
        self.tick = self.tick.wrapping_add(1);

        let (width, height) = self.size.dimensions();
        let (width, height) = match (u16::try_from(width), u16::try_from(height)) {
            (Ok(w), Ok(h)) => (w, h),
            _ => return Err(CaptureError::Unsupported(self.size)),
        };

        let mut encoder = Encoder::new(&mut *slot, self.quality);
        encoder.set_sampling_factor(SamplingFactor::F_2_2);
        encoder.encode(self.image.as_raw(), width, height, ColorType::Rgb)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;
    use crate::rtp::validate_jpeg;
    use std::time::Instant;

    #[test]
    fn test_produces_jpeg() {
        let pool = FramePool::new(1, 64 * 1024);
        let mut source = TestPattern::new(FrameSize::Qqvga, 80);

        let mut slot = pool.acquire().unwrap();
        source.capture(&mut slot).unwrap();
        let frame = slot.commit(0, Instant::now());

        assert!(validate_jpeg(frame.payload()).is_ok());
    }

    #[test]
    fn test_frames_packetize_for_rtp() {
        use crate::rtp::{parse_jpeg_for_rtp, JpegType, RtpHeader, RtpPacketizer};

        let pool = FramePool::for_memory(false);
        let mut source = TestPattern::new(FrameSize::default(), 80);

        let mut slot = pool.acquire().unwrap();
        source.capture(&mut slot).unwrap();
        let frame = slot.commit(0, Instant::now());

        let info = parse_jpeg_for_rtp(frame.payload()).unwrap();
        assert_eq!(info.jpeg_type, JpegType::Yuv420);

        let mut packetizer = RtpPacketizer::new(1, 1400).unwrap();
        let packets: Vec<_> = packetizer.packetize(&frame).unwrap().collect();
        assert!(!packets.is_empty());
        assert!(packets.iter().all(|p| p.len() <= 1400));

        let markers = packets
            .iter()
            .filter(|p| RtpHeader::parse(p).unwrap().marker)
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_overflowing_slot_fails() {
        let pool = FramePool::new(1, 128);
        let mut source = TestPattern::new(FrameSize::Vga, 95);

        let mut slot = pool.acquire().unwrap();
        assert!(source.capture(&mut slot).is_err());
    }
}
