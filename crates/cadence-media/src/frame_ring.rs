//! Ring buffer of decoded video frames.
//!
//! Single writer (the decode thread) publishes frames in pts order; readers
//! (renderer, sync logic) observe the ready window through `peek`/`consume`
//! without ever blocking. The ready count is mirrored in an atomic so readers
//! never see a torn occupancy; the mutex is only held for the short slot
//! operations and administrative work (flush, growth).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::VideoFrame;

/// Default number of decoded frames to buffer ahead.
pub const DEFAULT_CAPACITY: usize = 5;

/// Hard ceiling for adaptive growth.
pub const MAX_CAPACITY: usize = 32;

/// Fixed-capacity FIFO of ready decoded video frames.
pub struct FrameRing {
    frames: Mutex<VecDeque<VideoFrame>>,
    /// Mirrors `frames.len()`; readers may load it without the lock.
    ready: AtomicUsize,
    /// Current capacity; grows up to [`MAX_CAPACITY`], never shrinks.
    capacity: AtomicUsize,
    /// Set while a flush is discarding the ready window.
    flushing: AtomicBool,
    /// End of stream reached and drained.
    eos: AtomicBool,
    /// Shutdown flag; wakes and permanently rejects blocked producers.
    stopped: AtomicBool,
    space_available: Condvar,
}

impl FrameRing {
    /// Creates a ring holding at most `capacity` ready frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(MAX_CAPACITY)),
            ready: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            flushing: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            space_available: Condvar::new(),
        }
    }

    /// Attempts to take a free slot and publish `frame` into it.
    ///
    /// Returns the frame back when the ring is full, flushing, or stopped;
    /// a full ring is backpressure and the producer should wait via
    /// [`FrameRing::wait_for_space`] and retry.
    pub fn try_push(&self, frame: VideoFrame) -> Result<(), VideoFrame> {
        if self.flushing.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return Err(frame);
        }
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity.load(Ordering::Acquire) {
            return Err(frame);
        }
        frames.push_back(frame);
        self.ready.store(frames.len(), Ordering::Release);
        Ok(())
    }

    /// Blocks up to `timeout` for a free slot, a flush, or shutdown.
    ///
    /// Returns true if space may now be available. Producers re-check pending
    /// seeks and the running flag between waits instead of busy spinning.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let mut frames = self.frames.lock();
        if frames.len() < self.capacity.load(Ordering::Acquire) {
            return true;
        }
        self.space_available.wait_for(&mut frames, timeout);
        frames.len() < self.capacity.load(Ordering::Acquire)
    }

    /// Number of published frames currently ready.
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }

    /// Current capacity of the ready window.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Read-only view of the ready frame at `offset` from the oldest.
    pub fn peek(&self, offset: usize) -> Option<VideoFrame> {
        let frames = self.frames.lock();
        frames.get(offset).cloned()
    }

    /// The newest ready frame, if any. Used by real-time scrub mode.
    pub fn latest(&self) -> Option<VideoFrame> {
        let frames = self.frames.lock();
        frames.back().cloned()
    }

    /// Removes and returns the oldest ready frame, freeing its slot.
    pub fn consume(&self) -> Option<VideoFrame> {
        let mut frames = self.frames.lock();
        let frame = frames.pop_front();
        self.ready.store(frames.len(), Ordering::Release);
        if frame.is_some() {
            self.space_available.notify_one();
        }
        frame
    }

    /// Grows capacity by one slot, bounded by [`MAX_CAPACITY`].
    ///
    /// Returns true if capacity changed. This is the starvation-avoidance
    /// valve: the decode thread grows the video window instead of stalling
    /// when audio is about to run dry.
    pub fn grow(&self) -> bool {
        let current = self.capacity.load(Ordering::Acquire);
        self.resize(current + 1)
    }

    /// Grows capacity to `new_capacity`, clamped to [`MAX_CAPACITY`].
    /// Shrinking is not supported; a smaller value is ignored.
    pub fn resize(&self, new_capacity: usize) -> bool {
        let frames = self.frames.lock();
        let current = self.capacity.load(Ordering::Acquire);
        let wanted = new_capacity.min(MAX_CAPACITY);
        if wanted <= current {
            return false;
        }
        self.capacity.store(wanted, Ordering::Release);
        drop(frames);
        self.space_available.notify_one();
        true
    }

    /// Discards every ready frame (seek / generation flush).
    ///
    /// Blocked producers are woken and their pending frame rejected; the
    /// end-of-stream flag is cleared so decoding can resume from the new
    /// position.
    pub fn flush(&self) {
        self.flushing.store(true, Ordering::Release);
        self.space_available.notify_all();
        let dropped = {
            let mut frames = self.frames.lock();
            let count = frames.len();
            frames.clear();
            self.ready.store(0, Ordering::Release);
            count
        };
        if dropped > 0 {
            tracing::debug!(dropped, "frame ring flushed");
        }
        self.eos.store(false, Ordering::Release);
        self.flushing.store(false, Ordering::Release);
    }

    /// Marks that end of stream has been reached and drained.
    pub fn set_eos(&self) {
        self.eos.store(true, Ordering::Release);
    }

    /// Returns true if end of stream was reached.
    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// Clears the end-of-stream flag (loop restart, seek).
    pub fn clear_eos(&self) {
        self.eos.store(false, Ordering::Release);
    }

    /// Permanently stops the ring, waking any blocked producer so shutdown
    /// never deadlocks on a full window.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.space_available.notify_all();
    }

    /// Returns true once the ring has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FramePool, PixelFormat, PlaneLayout};
    use crate::timing::MediaTimestamp;
    use std::sync::Arc;

    fn frame(pool: &FramePool, pts: f64, generation: u64, index: u64) -> VideoFrame {
        let buf = pool.acquire(4).unwrap();
        VideoFrame::new(
            MediaTimestamp::new(pts, generation),
            index,
            1,
            1,
            PixelFormat::Rgba,
            vec![PlaneLayout { offset: 0, stride: 4, rows: 1 }],
            buf.freeze(),
        )
    }

    #[test]
    fn test_fifo_order() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(3);
        for i in 0..3 {
            ring.try_push(frame(&pool, i as f64, 0, i)).unwrap();
        }
        assert_eq!(ring.ready_count(), 3);
        assert_eq!(ring.consume().unwrap().frame_index, 0);
        assert_eq!(ring.consume().unwrap().frame_index, 1);
        assert_eq!(ring.consume().unwrap().frame_index, 2);
        assert!(ring.consume().is_none());
    }

    #[test]
    fn test_backpressure_when_full() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(2);
        ring.try_push(frame(&pool, 0.0, 0, 0)).unwrap();
        ring.try_push(frame(&pool, 0.1, 0, 1)).unwrap();
        let rejected = ring.try_push(frame(&pool, 0.2, 0, 2));
        assert!(rejected.is_err());
        // Consuming frees a slot.
        ring.consume();
        assert!(ring.try_push(rejected.unwrap_err()).is_ok());
    }

    #[test]
    fn test_ready_never_exceeds_capacity() {
        let pool = FramePool::new(64);
        let ring = Arc::new(FrameRing::new(4));
        let writer_ring = Arc::clone(&ring);
        let writer_pool = pool.clone();

        let writer = std::thread::spawn(move || {
            let mut i = 0u64;
            while i < 200 {
                let f = frame(&writer_pool, i as f64 / 30.0, 0, i);
                if writer_ring.try_push(f).is_ok() {
                    i += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let reader = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut seen = 0usize;
                while seen < 200 {
                    assert!(ring.ready_count() <= ring.capacity());
                    if ring.consume().is_some() {
                        seen += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn test_peek_does_not_consume() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(3);
        ring.try_push(frame(&pool, 0.0, 0, 0)).unwrap();
        ring.try_push(frame(&pool, 0.1, 0, 1)).unwrap();
        assert_eq!(ring.peek(0).unwrap().frame_index, 0);
        assert_eq!(ring.peek(1).unwrap().frame_index, 1);
        assert!(ring.peek(2).is_none());
        assert_eq!(ring.ready_count(), 2);
        assert_eq!(ring.latest().unwrap().frame_index, 1);
    }

    #[test]
    fn test_flush_clears_and_resets_eos() {
        let pool = FramePool::new(8);
        let ring = FrameRing::new(3);
        ring.try_push(frame(&pool, 0.0, 0, 0)).unwrap();
        ring.set_eos();
        ring.flush();
        assert_eq!(ring.ready_count(), 0);
        assert!(!ring.is_eos());
        assert!(ring.try_push(frame(&pool, 5.0, 1, 0)).is_ok());
    }

    #[test]
    fn test_grow_bounded() {
        let ring = FrameRing::new(MAX_CAPACITY - 1);
        assert!(ring.grow());
        assert_eq!(ring.capacity(), MAX_CAPACITY);
        assert!(!ring.grow());
        assert_eq!(ring.capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_resize_never_shrinks() {
        let ring = FrameRing::new(8);
        assert!(!ring.resize(4));
        assert_eq!(ring.capacity(), 8);
        assert!(ring.resize(12));
        assert_eq!(ring.capacity(), 12);
        assert!(ring.resize(MAX_CAPACITY * 2));
        assert_eq!(ring.capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_stop_wakes_blocked_producer() {
        let pool = FramePool::new(8);
        let ring = Arc::new(FrameRing::new(1));
        ring.try_push(frame(&pool, 0.0, 0, 0)).unwrap();

        let waiter = Arc::clone(&ring);
        let handle = std::thread::spawn(move || {
            // Returns promptly (false) once stopped instead of waiting out
            // the full timeout repeatedly.
            while waiter.wait_for_space(Duration::from_millis(50)) {
                if waiter.is_stopped() {
                    break;
                }
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        ring.stop();
        handle.join().unwrap();
        assert!(ring.try_push(frame(&pool, 0.1, 0, 1)).is_err());
    }
}
