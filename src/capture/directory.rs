//! Replays JPEG files from a directory as camera frames

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CaptureError, FrameSize, FrameSource};
use crate::pool::SlotWriter;
use crate::rtp::validate_jpeg;

/// Loops over the `.jpg`/`.jpeg` files of a directory in name order
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();

        if files.is_empty() {
            return Err(CaptureError::NoFrames(dir.to_path_buf()));
        }
        files.sort();

        debug!(dir = %dir.display(), count = files.len(), "Loaded frame files");
        Ok(Self { files, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    fn frame_size(&self) -> Option<FrameSize> {
        None
    }

    fn capture(&mut self, slot: &mut SlotWriter) -> Result<(), CaptureError> {
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let data = fs::read(path)?;
        validate_jpeg(&data).map_err(|source| CaptureError::InvalidFrame {
            path: path.clone(),
            source,
        })?;

        slot.extend(&data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;
    use std::time::Instant;

    #[test]
    fn test_cycles_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.jpg"), [0xFF, 0xD8, 2, 0xFF, 0xD9]).unwrap();
        fs::write(dir.path().join("a.JPEG"), [0xFF, 0xD8, 1, 0xFF, 0xD9]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let pool = FramePool::new(1, 64);
        let mut seen = Vec::new();
        for seq in 0..3 {
            let mut slot = pool.acquire().unwrap();
            source.capture(&mut slot).unwrap();
            seen.push(slot.commit(seq, Instant::now()).payload()[2]);
        }
        assert_eq!(seen, vec![1, 2, 1]);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectorySource::open(dir.path()),
            Err(CaptureError::NoFrames(_))
        ));
    }

    #[test]
    fn test_rejects_non_jpeg_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"definitely not jpeg").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        let pool = FramePool::new(1, 64);
        let mut slot = pool.acquire().unwrap();

        assert!(matches!(
            source.capture(&mut slot),
            Err(CaptureError::InvalidFrame { .. })
        ));
    }
}
