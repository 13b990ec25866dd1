//! Media timestamps: presentation time tagged with a seek generation.
//!
//! Every decoded frame and audio block carries a [`MediaTimestamp`]. The
//! generation is an epoch counter bumped on seeks and detected stream
//! discontinuities; content from an older generation sorts below everything
//! from the current one regardless of its numeric pts, so consumers can
//! discard stale buffers with a single comparison.

use std::cmp::Ordering;

/// Presentation timestamp in seconds, paired with the seek generation that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaTimestamp {
    /// Presentation time in seconds of media time.
    pub pts: f64,
    /// Seek generation this timestamp belongs to.
    pub generation: u64,
}

impl MediaTimestamp {
    /// Timestamp at media time zero in the initial generation.
    pub const ZERO: MediaTimestamp = MediaTimestamp {
        pts: 0.0,
        generation: 0,
    };

    /// Creates a timestamp from pts seconds and a generation.
    pub fn new(pts: f64, generation: u64) -> Self {
        Self { pts, generation }
    }

    /// Returns this timestamp shifted by `offset` seconds, same generation.
    ///
    /// Used for the loop offset that keeps presentation time monotonic across
    /// loop boundaries.
    pub fn with_offset(self, offset: f64) -> Self {
        Self {
            pts: self.pts + offset,
            generation: self.generation,
        }
    }

    /// Total order: generation first, then pts.
    ///
    /// Timestamps from different generations are never compared by pts; an
    /// older generation is always "before" a newer one. Within a generation,
    /// `f64::total_cmp` gives a total order even for non-finite pts values.
    pub fn order(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.pts.total_cmp(&other.pts))
    }

    /// Returns true if `self` sorts strictly before `other`.
    pub fn is_before(&self, other: &Self) -> bool {
        self.order(other) == Ordering::Less
    }
}

impl PartialOrd for MediaTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.order(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_within_generation() {
        let a = MediaTimestamp::new(1.0, 0);
        let b = MediaTimestamp::new(2.0, 0);
        assert!(a.is_before(&b));
        assert!(!b.is_before(&a));
        assert!(a < b);
    }

    #[test]
    fn test_older_generation_sorts_first() {
        // A numerically larger pts from an older generation is still "older".
        let stale = MediaTimestamp::new(100.0, 1);
        let fresh = MediaTimestamp::new(0.5, 2);
        assert!(stale.is_before(&fresh));
    }

    #[test]
    fn test_with_offset_preserves_generation() {
        let ts = MediaTimestamp::new(3.0, 7);
        let shifted = ts.with_offset(10.0);
        assert_eq!(shifted.generation, 7);
        assert!((shifted.pts - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_timestamps() {
        let a = MediaTimestamp::new(1.5, 3);
        let b = MediaTimestamp::new(1.5, 3);
        assert_eq!(a.order(&b), Ordering::Equal);
    }
}
