//! Frame capture: sources and the blocking capture loop
//!
//! The capture loop runs on a blocking thread, pulls one frame per period
//! from a [`FrameSource`] into a pool slot, and hands it to the scheduler
//! without ever waiting on consumers. When nobody is watching, it idles.

mod directory;
mod frame_size;
mod pattern;

pub use directory::DirectorySource;
pub use frame_size::FrameSize;
pub use pattern::TestPattern;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, SourceKind};
use crate::pool::{Frame, FramePool, PoolError, SlotWriter};
use crate::rtp::JpegParseError;

/// How often an idle loop re-checks for consumers
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] jpeg_encoder::EncodingError),

    #[error("frame size {0} too large for the encoder")]
    Unsupported(FrameSize),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{path}: {source}")]
    InvalidFrame {
        path: PathBuf,
        source: JpegParseError,
    },

    #[error("no JPEG files in {0}")]
    NoFrames(PathBuf),

    #[error("capture already running")]
    AlreadyRunning,
}

/// A camera-like producer of encoded JPEG frames
pub trait FrameSource: Send + 'static {
    fn name(&self) -> &str;

    /// Nominal resolution, if the source knows it
    fn frame_size(&self) -> Option<FrameSize>;

    /// Writes one complete JPEG into `slot`
    fn capture(&mut self, slot: &mut SlotWriter) -> Result<(), CaptureError>;
}

/// Builds the source selected in the camera config
pub fn build_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    match config.source {
        SourceKind::TestPattern => Ok(Box::new(TestPattern::new(config.frame_size, config.quality))),
        SourceKind::Directory => {
            let dir = config
                .directory
                .as_deref()
                .ok_or_else(|| CaptureError::NoFrames(PathBuf::new()))?;
            Ok(Box::new(DirectorySource::open(dir)?))
        }
    }
}

/// What the capture loop hands the scheduler each cycle
#[derive(Debug)]
pub enum CaptureEvent {
    Captured(Frame),

    /// Every pool slot was still in use; this cycle was skipped
    Exhausted,
}

/// Statistics for capture
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    /// Cycles skipped because the pool was exhausted
    pub frames_skipped: u64,
    /// Frames the scheduler had no room for
    pub frames_dropped: u64,
    pub capture_errors: u64,
    pub is_running: bool,
}

#[derive(Default)]
struct Counters {
    captured: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Drives a [`FrameSource`] at a fixed rate on a blocking thread
pub struct CaptureLoop {
    pool: FramePool,
    period: Duration,
    demand: Arc<AtomicUsize>,
    is_running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureLoop {
    /// `demand` is the number of active consumers; capture pauses at zero
    pub fn new(pool: FramePool, fps: u32, demand: Arc<AtomicUsize>) -> Self {
        Self {
            pool,
            period: Duration::from_secs(1) / fps.max(1),
            demand,
            is_running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
            handle: None,
        }
    }

    /// Starts capturing into `events`
    pub fn start(
        &mut self,
        source: Box<dyn FrameSource>,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<(), CaptureError> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::AlreadyRunning);
        }

        info!(
            source = source.name(),
            period_ms = self.period.as_millis() as u64,
            "Starting capture"
        );

        let worker = Worker {
            source,
            pool: self.pool.clone(),
            period: self.period,
            demand: Arc::clone(&self.demand),
            is_running: Arc::clone(&self.is_running),
            counters: Arc::clone(&self.counters),
            events,
        };
        self.handle = Some(tokio::task::spawn_blocking(move || worker.run()));
        Ok(())
    }

    /// Stops the loop and waits for the thread to exit
    pub async fn stop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Capture thread ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CaptureStats {
        self.monitor().stats()
    }

    /// Read-only view of the counters that outlives borrows of the loop
    pub fn monitor(&self) -> CaptureMonitor {
        CaptureMonitor {
            is_running: Arc::clone(&self.is_running),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Cloneable handle for reading capture statistics
#[derive(Clone)]
pub struct CaptureMonitor {
    is_running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl CaptureMonitor {
    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_skipped: self.counters.skipped.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            capture_errors: self.counters.errors.load(Ordering::Relaxed),
            is_running: self.is_running.load(Ordering::Acquire),
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
    }
}

struct Worker {
    source: Box<dyn FrameSource>,
    pool: FramePool,
    period: Duration,
    demand: Arc<AtomicUsize>,
    is_running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    events: mpsc::Sender<CaptureEvent>,
}

impl Worker {
    fn run(mut self) {
        let mut sequence = 0u64;
        let mut next = Instant::now();
        let mut idle = false;

        while self.is_running.load(Ordering::Acquire) {
            if self.demand.load(Ordering::Acquire) == 0 {
                if !idle {
                    debug!("No consumers, capture idle");
                    idle = true;
                }
                std::thread::sleep(IDLE_POLL);
                next = Instant::now();
                continue;
            }
            if idle {
                debug!("Consumers present, capture resumed");
                idle = false;
            }

            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            }
            // Never burst to catch up after a stall
            next = Instant::now().max(next) + self.period;

            let event = match self.capture_one(sequence) {
                Some(event) => event,
                None => continue,
            };
            if let CaptureEvent::Captured(_) = event {
                sequence += 1;
            }

            match self.events.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Frame handle dropped here, slot goes straight back
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Capture receiver closed");
                    break;
                }
            }
        }

        self.is_running.store(false, Ordering::Release);
        info!(frames = sequence, "Capture stopped");
    }

    fn capture_one(&mut self, sequence: u64) -> Option<CaptureEvent> {
        let mut slot = match self.pool.acquire() {
            Ok(slot) => slot,
            Err(_) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Some(CaptureEvent::Exhausted);
            }
        };

        match self.source.capture(&mut slot) {
            Ok(()) => {
                self.counters.captured.fetch_add(1, Ordering::Relaxed);
                Some(CaptureEvent::Captured(slot.commit(sequence, Instant::now())))
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(source = self.source.name(), error = %e, "Capture failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    impl FrameSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        fn frame_size(&self) -> Option<FrameSize> {
            None
        }

        fn capture(&mut self, slot: &mut SlotWriter) -> Result<(), CaptureError> {
            slot.extend(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9])?;
            Ok(())
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<CaptureEvent>) -> CaptureEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for capture")
            .expect("capture channel closed")
    }

    #[tokio::test]
    async fn test_captures_sequential_frames() {
        let pool = FramePool::new(2, 64);
        let demand = Arc::new(AtomicUsize::new(1));
        let (tx, mut rx) = mpsc::channel(4);

        let mut capture = CaptureLoop::new(pool, 100, demand);
        capture.start(Box::new(FixedSource), tx).unwrap();

        let mut sequences = Vec::new();
        while sequences.len() < 3 {
            if let CaptureEvent::Captured(frame) = next_event(&mut rx).await {
                sequences.push(frame.sequence());
            }
        }
        assert_eq!(sequences[0], 0);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        capture.stop().await;
        assert!(!capture.is_running());
        assert!(capture.stats().frames_captured >= 3);
    }

    #[tokio::test]
    async fn test_held_frames_exhaust_pool() {
        let pool = FramePool::new(2, 64);
        let demand = Arc::new(AtomicUsize::new(1));
        let (tx, mut rx) = mpsc::channel(8);

        let mut capture = CaptureLoop::new(pool.clone(), 100, demand);
        capture.start(Box::new(FixedSource), tx).unwrap();

        let mut held = Vec::new();
        loop {
            match next_event(&mut rx).await {
                CaptureEvent::Captured(frame) => held.push(frame),
                CaptureEvent::Exhausted => break,
            }
        }
        assert_eq!(held.len(), 2);
        assert_eq!(pool.free_slots(), 0);

        capture.stop().await;
        assert!(capture.stats().frames_skipped >= 1);
    }

    #[tokio::test]
    async fn test_idle_without_demand() {
        let pool = FramePool::new(2, 64);
        let demand = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(4);

        let mut capture = CaptureLoop::new(pool, 100, Arc::clone(&demand));
        capture.start(Box::new(FixedSource), tx).unwrap();

        let idle = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(idle.is_err());

        demand.store(1, Ordering::Release);
        assert!(matches!(next_event(&mut rx).await, CaptureEvent::Captured(_)));

        capture.stop().await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let pool = FramePool::new(1, 64);
        let (tx, _rx) = mpsc::channel(1);
        let mut capture = CaptureLoop::new(pool, 10, Arc::new(AtomicUsize::new(0)));

        capture.start(Box::new(FixedSource), tx.clone()).unwrap();
        assert!(matches!(
            capture.start(Box::new(FixedSource), tx),
            Err(CaptureError::AlreadyRunning)
        ));
        capture.stop().await;
    }
}
