//! A/V synchronization drift and starvation instrumentation.
//!
//! Tracks the drift between presented video pts and the sync clock's mapped
//! position, plus buffer-underrun events observed by the renderer. Lock-free
//! so the render path can record without contention; tests and embedding
//! players read snapshots.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Acceptable drift between video and the clock (±ms).
pub const DRIFT_THRESHOLD_MS: i64 = 100;

/// Clearly-out-of-sync drift (±ms); crossing it is logged.
pub const DRIFT_SEVERE_MS: i64 = 200;

/// Shared drift/underrun tracker.
#[derive(Clone)]
pub struct SyncMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    /// Latest drift in microseconds (video pts − clock position; positive =
    /// video ahead).
    current_drift_us: AtomicI64,
    /// Largest drift seen with video ahead.
    max_ahead_us: AtomicI64,
    /// Largest drift seen with video behind (stored negative).
    max_behind_us: AtomicI64,
    /// Sum of absolute drift for averaging.
    total_abs_us: AtomicU64,
    samples: AtomicU64,
    out_of_sync: AtomicU64,
    underruns: AtomicU64,
}

impl SyncMetrics {
    /// Creates a zeroed tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current_drift_us: AtomicI64::new(0),
                max_ahead_us: AtomicI64::new(0),
                max_behind_us: AtomicI64::new(0),
                total_abs_us: AtomicU64::new(0),
                samples: AtomicU64::new(0),
                out_of_sync: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
            }),
        }
    }

    /// Records one presented frame against the clock position it was
    /// selected for. Both values in seconds of media time.
    pub fn record_frame(&self, video_pts: f64, clock_pts: f64) {
        let drift_us = ((video_pts - clock_pts) * 1_000_000.0) as i64;
        let inner = &self.inner;
        inner.current_drift_us.store(drift_us, Ordering::Relaxed);
        inner.max_ahead_us.fetch_max(drift_us, Ordering::Relaxed);
        inner.max_behind_us.fetch_min(drift_us, Ordering::Relaxed);
        inner
            .total_abs_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        inner.samples.fetch_add(1, Ordering::Relaxed);
        let drift_ms = drift_us / 1000;
        if drift_ms.abs() > DRIFT_THRESHOLD_MS {
            inner.out_of_sync.fetch_add(1, Ordering::Relaxed);
            if drift_ms.abs() > DRIFT_SEVERE_MS {
                tracing::warn!(drift_ms, "severe A/V drift");
            }
        }
    }

    /// Records a renderer fallback to a stale frame (buffer underrun).
    pub fn record_underrun(&self) {
        self.inner.underruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears all counters (seek, new source).
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.current_drift_us.store(0, Ordering::Relaxed);
        inner.max_ahead_us.store(0, Ordering::Relaxed);
        inner.max_behind_us.store(0, Ordering::Relaxed);
        inner.total_abs_us.store(0, Ordering::Relaxed);
        inner.samples.store(0, Ordering::Relaxed);
        inner.out_of_sync.store(0, Ordering::Relaxed);
        inner.underruns.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> SyncSnapshot {
        let inner = &self.inner;
        SyncSnapshot {
            current_drift_us: inner.current_drift_us.load(Ordering::Relaxed),
            max_ahead_us: inner.max_ahead_us.load(Ordering::Relaxed),
            max_behind_us: inner.max_behind_us.load(Ordering::Relaxed),
            total_abs_us: inner.total_abs_us.load(Ordering::Relaxed),
            samples: inner.samples.load(Ordering::Relaxed),
            out_of_sync: inner.out_of_sync.load(Ordering::Relaxed),
            underruns: inner.underruns.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the tracker's counters at one instant.
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub current_drift_us: i64,
    pub max_ahead_us: i64,
    pub max_behind_us: i64,
    pub total_abs_us: u64,
    pub samples: u64,
    pub out_of_sync: u64,
    pub underruns: u64,
}

impl SyncSnapshot {
    /// Latest drift in milliseconds.
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    /// Mean absolute drift in milliseconds.
    pub fn average_drift_ms(&self) -> i64 {
        if self.samples == 0 {
            return 0;
        }
        (self.total_abs_us / self.samples) as i64 / 1000
    }

    /// True when no sample exceeded the sync threshold.
    pub fn in_sync(&self) -> bool {
        self.out_of_sync == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_sync() {
        let metrics = SyncMetrics::new();
        for i in 0..100 {
            let pts = i as f64 / 30.0;
            metrics.record_frame(pts, pts);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), 0);
        assert_eq!(snap.out_of_sync, 0);
        assert!(snap.in_sync());
    }

    #[test]
    fn test_video_ahead_counts_out_of_sync() {
        let metrics = SyncMetrics::new();
        metrics.record_frame(1.120, 1.0);
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), 120);
        assert!(snap.max_ahead_us > 0);
        assert_eq!(snap.out_of_sync, 1);
    }

    #[test]
    fn test_video_behind_within_threshold() {
        let metrics = SyncMetrics::new();
        metrics.record_frame(1.0, 1.030);
        let snap = metrics.snapshot();
        assert_eq!(snap.current_drift_ms(), -30);
        assert!(snap.max_behind_us < 0);
        assert!(snap.in_sync());
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = SyncMetrics::new();
        metrics.record_frame(2.0, 1.0);
        metrics.record_underrun();
        metrics.reset();
        let snap = metrics.snapshot();
        assert_eq!(snap.samples, 0);
        assert_eq!(snap.underruns, 0);
        assert!(snap.in_sync());
    }
}
