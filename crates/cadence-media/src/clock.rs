//! The audio/video synchronization clock.
//!
//! [`SyncClock`] maps a consumer's presentation wall-clock timestamp to a
//! media timestamp. When audio is present the audio callback re-anchors the
//! mapping every time it starts consuming a fresh sample block, making audio
//! the master clock; without audio the decode engine anchors on the first
//! published video frame and the clock extrapolates from wall time.
//!
//! Pausing freezes the mapped position; a seek installs a new generation and
//! holds the clock at the seek target until the first content of that
//! generation anchors it again.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::timing::MediaTimestamp;

/// Play/pause mode of the presentation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// The clock advances with wall time (or audio consumption).
    Playing,
    /// The clock is frozen at its current position.
    Paused,
}

/// Wall-clock to media-time mapping, shared between the decode thread, the
/// audio callback, and the renderer.
///
/// All fields are independent atomics; a reader racing an anchor update can
/// observe a mapping that is off by at most one anchor step, which is far
/// below the frame period and self-corrects on the next anchor.
pub struct SyncClock {
    /// Process-local epoch all wall instants are measured against.
    epoch: Instant,
    playing: AtomicBool,
    generation: AtomicU64,
    /// Wall time of the anchor, microseconds since `epoch`.
    anchor_wall_us: AtomicU64,
    /// Media time of the anchor, microseconds.
    anchor_pts_us: AtomicI64,
    /// False until content of the current generation has anchored the clock;
    /// until then the mapped position holds at the anchor pts.
    anchored: AtomicBool,
}

impl SyncClock {
    /// Creates a paused clock at media time zero, generation zero.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            playing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            anchor_wall_us: AtomicU64::new(0),
            anchor_pts_us: AtomicI64::new(0),
            anchored: AtomicBool::new(false),
        }
    }

    fn wall_us(&self, wall: Instant) -> u64 {
        wall.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Maps a presentation wall-clock timestamp to media time.
    ///
    /// Monotonic in `wall` for a fixed generation and play mode.
    pub fn media_time(&self, wall: Instant) -> MediaTimestamp {
        let generation = self.generation.load(Ordering::Acquire);
        let pts_us = self.anchor_pts_us.load(Ordering::Acquire);
        if !self.anchored.load(Ordering::Acquire) || !self.playing.load(Ordering::Acquire) {
            return MediaTimestamp::new(pts_us as f64 / 1_000_000.0, generation);
        }
        let elapsed = self
            .wall_us(wall)
            .saturating_sub(self.anchor_wall_us.load(Ordering::Acquire));
        MediaTimestamp::new((pts_us + elapsed as i64) as f64 / 1_000_000.0, generation)
    }

    /// Re-anchors the mapping: media time `pts` corresponds to wall time
    /// `wall`. Anchors carrying a stale generation are ignored — the audio
    /// callback may race a seek and must not resurrect the old timeline.
    pub fn anchor(&self, pts: f64, wall: Instant, generation: u64) {
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        self.anchor_wall_us.store(self.wall_us(wall), Ordering::Release);
        self.anchor_pts_us
            .store((pts * 1_000_000.0) as i64, Ordering::Release);
        self.anchored.store(true, Ordering::Release);
    }

    /// Switches between playing and paused.
    ///
    /// Pausing freezes the clock at the currently mapped position; resuming
    /// re-anchors that position at the current wall time.
    pub fn set_play_mode(&self, mode: PlayMode) {
        let now = Instant::now();
        match mode {
            PlayMode::Paused => {
                let frozen = self.media_time(now);
                self.anchor_pts_us
                    .store((frozen.pts * 1_000_000.0) as i64, Ordering::Release);
                self.anchor_wall_us.store(self.wall_us(now), Ordering::Release);
                self.playing.store(false, Ordering::Release);
            }
            PlayMode::Playing => {
                self.anchor_wall_us.store(self.wall_us(now), Ordering::Release);
                self.playing.store(true, Ordering::Release);
            }
        }
    }

    /// Returns true if the clock is advancing.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Current play mode.
    pub fn play_mode(&self) -> PlayMode {
        if self.is_playing() {
            PlayMode::Playing
        } else {
            PlayMode::Paused
        }
    }

    /// Installs a new generation holding at `start_pts` until content of
    /// that generation anchors the clock (seek, discontinuity, resync).
    pub fn set_generation(&self, generation: u64, start_pts: f64) {
        self.anchored.store(false, Ordering::Release);
        self.anchor_pts_us
            .store((start_pts * 1_000_000.0) as i64, Ordering::Release);
        self.anchor_wall_us
            .store(self.wall_us(Instant::now()), Ordering::Release);
        self.generation.store(generation, Ordering::Release);
    }

    /// The generation the clock is currently mapping into.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns true once content of the current generation has anchored the
    /// mapping.
    pub fn is_anchored(&self) -> bool {
        self.anchored.load(Ordering::Acquire)
    }
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_holds_at_anchor_until_anchored() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        let now = Instant::now();
        // No content anchored yet: position holds at zero.
        assert_eq!(clock.media_time(now + Duration::from_secs(5)).pts, 0.0);
    }

    #[test]
    fn test_extrapolates_while_playing() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        let start = Instant::now();
        clock.anchor(2.0, start, 0);
        let later = clock.media_time(start + Duration::from_millis(500));
        assert!((later.pts - 2.5).abs() < 0.01, "pts was {}", later.pts);
    }

    #[test]
    fn test_monotonic_for_fixed_generation_and_mode() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        let start = Instant::now();
        clock.anchor(0.0, start, 0);
        let mut last = f64::MIN;
        for ms in (0..1000).step_by(50) {
            let t = clock.media_time(start + Duration::from_millis(ms));
            assert!(t.pts >= last);
            assert_eq!(t.generation, 0);
            last = t.pts;
        }
    }

    #[test]
    fn test_pause_freezes_position() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        let start = Instant::now();
        clock.anchor(1.0, start, 0);
        clock.set_play_mode(PlayMode::Paused);
        let frozen = clock.media_time(Instant::now()).pts;
        let later = clock.media_time(Instant::now() + Duration::from_secs(3)).pts;
        assert!((frozen - later).abs() < 1e-6);
    }

    #[test]
    fn test_seek_installs_generation_and_target() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        clock.anchor(1.0, Instant::now(), 0);
        clock.set_generation(3, 7.5);
        let t = clock.media_time(Instant::now() + Duration::from_secs(1));
        assert_eq!(t.generation, 3);
        // Holds at the seek target until new-generation content anchors.
        assert!((t.pts - 7.5).abs() < 1e-6);
    }

    #[test]
    fn test_stale_generation_anchor_ignored() {
        let clock = SyncClock::new();
        clock.set_play_mode(PlayMode::Playing);
        clock.set_generation(2, 4.0);
        clock.anchor(99.0, Instant::now(), 1);
        assert!(!clock.is_anchored());
        assert!((clock.media_time(Instant::now()).pts - 4.0).abs() < 1e-6);
    }
}
