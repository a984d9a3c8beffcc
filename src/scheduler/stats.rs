//! Dispatch statistics

use serde::{Deserialize, Serialize};

use crate::rtsp::SessionSnapshot;

/// Counters kept by the transport scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Frames received from capture and fanned out
    pub frames_dispatched: u64,

    /// Frame handles queued to a session
    pub deliveries: u64,

    /// Per-session drops due to a full queue
    pub frames_dropped: u64,

    /// Capture cycles skipped because the pool was exhausted
    pub capture_skipped: u64,

    pub sessions_opened: u64,

    pub sessions_torn_down: u64,

    /// Subset of `sessions_torn_down` caused by the idle timeout
    pub sessions_reaped: u64,

    /// Sessions currently receiving frames
    pub active_sessions: usize,

    pub open_sessions: usize,
}

impl SchedulerStats {
    /// Calculates dispatch rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_dispatched.saturating_sub(previous.frames_dispatched);
        frames_delta as f64 / elapsed_secs
    }

    /// Share of session deliveries lost to backpressure
    pub fn drop_rate(&self) -> f64 {
        let total = self.deliveries + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }

        self.frames_dropped as f64 / total as f64
    }
}

/// Stats plus a view of every session, as served on the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    #[serde(flatten)]
    pub stats: SchedulerStats,

    pub sessions: Vec<SessionSnapshot>,
}
