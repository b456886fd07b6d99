//! Per-session capture counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters written by the capture thread and read by anyone.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_grabbed: CachePadded<AtomicU64>,
    frames_forwarded: CachePadded<AtomicU64>,
    bytes_forwarded: AtomicU64,
    frames_skipped: AtomicU64,
    grab_timeouts: AtomicU64,
    grab_failures: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_grabbed: u64,
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    /// Frames published but not forwarded because they did not match the sink format
    pub frames_skipped: u64,
    pub grab_timeouts: u64,
    pub grab_failures: u64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_grab(&self) {
        self.frames_grabbed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self, bytes: usize) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("camstream_frames_forwarded").increment(1);
    }

    pub fn record_skip(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_frames_skipped").increment(1);
    }

    pub fn record_timeout(&self) {
        self.grab_timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_grab_timeouts").increment(1);
    }

    pub fn record_failure(&self) {
        self.grab_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camstream_grab_failures").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_grabbed: self.frames_grabbed.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            grab_timeouts: self.grab_timeouts.load(Ordering::Relaxed),
            grab_failures: self.grab_failures.load(Ordering::Relaxed),
        }
    }
}
