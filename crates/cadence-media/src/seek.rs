//! Seek requests and the coalescing seek controller.
//!
//! Any thread may file a [`SeekRequest`]; at most one request is pending at
//! a time and a newer one simply overwrites it. Each request is assigned a
//! fresh generation id the caller can use to detect completion: once content
//! tagged with that generation (or newer) appears, the seek has been applied.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Unit of the seek value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKind {
    /// Seconds of media time.
    Seconds,
    /// Fraction of the total duration in `0.0..=1.0`.
    Fraction,
    /// Byte offset into the source.
    Bytes,
}

/// Hint for which side of the target the underlying seek may land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Land at or after the target.
    Forward,
    /// Land at or before the target.
    Backward,
    /// No preference.
    Any,
}

/// A request to reposition the stream.
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    /// Target position, interpreted per `kind`.
    pub value: f64,
    /// Unit of `value`.
    pub kind: SeekKind,
    /// Bound hint for the underlying seek.
    pub direction: SeekDirection,
    /// Suppress output until the exact target pts is reached instead of
    /// snapping to the nearest keyframe.
    pub accurate: bool,
}

impl SeekRequest {
    /// Seek to an absolute position in seconds.
    pub fn seconds(value: f64) -> Self {
        Self {
            value,
            kind: SeekKind::Seconds,
            direction: SeekDirection::Any,
            accurate: false,
        }
    }

    /// Seek to a fraction of the total duration.
    pub fn fraction(value: f64) -> Self {
        Self {
            value,
            kind: SeekKind::Fraction,
            direction: SeekDirection::Any,
            accurate: false,
        }
    }

    /// Seek to a byte offset.
    pub fn bytes(value: u64) -> Self {
        Self {
            value: value as f64,
            kind: SeekKind::Bytes,
            direction: SeekDirection::Any,
            accurate: false,
        }
    }

    /// Requests exact positioning (§ accurate seek).
    pub fn accurate(mut self) -> Self {
        self.accurate = true;
        self
    }

    /// Sets the direction hint.
    pub fn direction(mut self, direction: SeekDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// The single pending seek slot plus the generation allocator.
pub struct SeekController {
    pending: Mutex<Option<(SeekRequest, u64)>>,
    next_generation: AtomicU64,
}

impl SeekController {
    /// Creates a controller; generation ids start above `initial_generation`.
    pub fn new(initial_generation: u64) -> Self {
        Self {
            pending: Mutex::new(None),
            next_generation: AtomicU64::new(initial_generation + 1),
        }
    }

    /// Files `request`, overwriting any pending one, and returns the
    /// generation id allocated for it. Callable from any thread.
    pub fn request(&self, request: SeekRequest) -> u64 {
        let generation = self.allocate_generation();
        let mut pending = self.pending.lock();
        if let Some((_, superseded)) = pending.replace((request, generation)) {
            tracing::debug!(superseded, generation, "pending seek coalesced");
        }
        generation
    }

    /// Allocates a fresh generation id without filing a request.
    ///
    /// The engine uses this to bump the generation on detected stream
    /// discontinuities so seek and discontinuity generations stay unique and
    /// monotonic.
    pub fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    /// Takes the pending request, if any, for the engine to apply.
    pub fn take(&self) -> Option<(SeekRequest, u64)> {
        self.pending.lock().take()
    }

    /// Returns true while a request is waiting to be applied.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}
