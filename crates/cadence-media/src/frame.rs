//! Decoded video frame types and the reusable frame-storage pool.
//!
//! Pixel storage for decoded frames is owned by a [`FramePool`]: a bounded
//! arena of byte buffers handed out as exclusively-owned [`PixelBufferMut`]
//! handles, frozen into shareable [`PixelBuffer`] handles once filled. When
//! the last handle clone drops, the storage returns to the pool's free list
//! instead of being deallocated, bounding peak memory. Pool exhaustion is
//! backpressure (the caller waits), never an error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::timing::MediaTimestamp;

/// Pixel format of a decoded video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common decoder output)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// RGB 24-bit
    Rgb24,
    /// RGBA 32-bit
    Rgba,
    /// BGRA 32-bit
    Bgra,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => 1,
        }
    }

    /// Returns true if this is a YUV-based format requiring conversion
    /// before display.
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }
}

/// Location of one pixel plane inside a frame's pooled storage.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    /// Byte offset of the plane within the backing buffer.
    pub offset: usize,
    /// Stride in bytes per row (may include padding).
    pub stride: usize,
    /// Number of rows in this plane.
    pub rows: usize,
}

impl PlaneLayout {
    /// Total byte length of the plane.
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    /// Returns true if the plane is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PoolInner {
    /// Recycled buffers ready for reuse.
    free: Mutex<Vec<Vec<u8>>>,
    /// Buffers currently handed out (mutable or frozen).
    in_use: AtomicUsize,
    /// Maximum number of concurrently outstanding buffers.
    capacity: usize,
}

impl PoolInner {
    fn release(&self, buffer: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock();
        // The free list never holds more than the pool can hand out.
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }
}

/// Bounded pool of reusable pixel-storage buffers.
///
/// Cloning the pool shares the same arena.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Creates a pool allowing at most `capacity` outstanding buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Acquires a writable buffer of at least `min_bytes`.
    ///
    /// Returns `None` when the pool is exhausted; the caller treats that as
    /// backpressure and retries after waiting, it is not a failure. Recycled
    /// storage is preferred over fresh allocation.
    pub fn acquire(&self, min_bytes: usize) -> Option<PixelBufferMut> {
        let inner = &self.inner;
        // Reserve a slot first so concurrent acquirers can't overshoot.
        let mut current = inner.in_use.load(Ordering::Acquire);
        loop {
            if current >= inner.capacity {
                return None;
            }
            match inner.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut bytes = inner.free.lock().pop().unwrap_or_default();
        if bytes.len() < min_bytes {
            bytes.resize(min_bytes, 0);
        }
        Some(PixelBufferMut {
            bytes: Some(bytes),
            pool: Arc::clone(inner),
        })
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Maximum number of concurrently outstanding buffers.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Exclusively-owned, writable pixel storage borrowed from a [`FramePool`].
///
/// Freeze it into a shareable [`PixelBuffer`] once filled; dropping it
/// unfrozen returns the storage to the pool.
pub struct PixelBufferMut {
    bytes: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PixelBufferMut {
    /// Mutable access to the full backing buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.bytes.as_mut().expect("buffer present until frozen")
    }

    /// Freezes the buffer into an immutable, reference-counted handle.
    pub fn freeze(mut self) -> PixelBuffer {
        let bytes = self.bytes.take().expect("buffer present until frozen");
        PixelBuffer {
            shared: Arc::new(SharedPixels {
                bytes,
                pool: Arc::clone(&self.pool),
            }),
        }
    }
}

impl Drop for PixelBufferMut {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.pool.release(bytes);
        }
    }
}

struct SharedPixels {
    bytes: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Drop for SharedPixels {
    fn drop(&mut self) {
        // Release callback: the last handle (ring slot, renderer, or the
        // decoding library's borrowed reference) returns storage to the pool.
        let bytes = std::mem::take(&mut self.bytes);
        self.pool.release(bytes);
    }
}

/// Immutable, shareable pixel storage. Cheap to clone; the backing buffer
/// returns to its pool when the last clone drops.
#[derive(Clone)]
pub struct PixelBuffer {
    shared: Arc<SharedPixels>,
}

impl PixelBuffer {
    /// Read access to the full backing buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.shared.bytes
    }
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("len", &self.shared.bytes.len())
            .finish()
    }
}

/// A decoded video frame ready for presentation.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation timestamp (pts + generation).
    pub ts: MediaTimestamp,
    /// Monotonically increasing index for neighbor lookup / peek-by-offset.
    pub frame_index: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format of the planes.
    pub format: PixelFormat,
    /// Per-plane layout into the backing buffer.
    pub planes: Vec<PlaneLayout>,
    pixels: PixelBuffer,
}

impl VideoFrame {
    /// Creates a frame over frozen pooled storage.
    pub fn new(
        ts: MediaTimestamp,
        frame_index: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<PlaneLayout>,
        pixels: PixelBuffer,
    ) -> Self {
        Self {
            ts,
            frame_index,
            width,
            height,
            format,
            planes,
            pixels,
        }
    }

    /// Returns `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Byte data of plane `index`, or `None` if out of range.
    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        let layout = self.planes.get(index)?;
        self.pixels.bytes().get(layout.offset..layout.offset + layout.len())
    }

    /// The shared pixel storage handle.
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = FramePool::new(2);
        let a = pool.acquire(16);
        let b = pool.acquire(16);
        assert!(a.is_some());
        assert!(b.is_some());
        // Exhaustion is backpressure, not an error.
        assert!(pool.acquire(16).is_none());
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_drop_returns_storage() {
        let pool = FramePool::new(1);
        let buf = pool.acquire(16).unwrap();
        drop(buf);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire(16).is_some());
    }

    #[test]
    fn test_frozen_buffer_released_on_last_clone() {
        let pool = FramePool::new(1);
        let mut buf = pool.acquire(4).unwrap();
        buf.as_mut_slice()[0] = 42;
        let frozen = buf.freeze();
        let second = frozen.clone();
        drop(frozen);
        // Still held by `second`.
        assert_eq!(pool.in_use(), 1);
        assert_eq!(second.bytes()[0], 42);
        drop(second);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_recycled_storage_is_reused() {
        let pool = FramePool::new(1);
        let mut buf = pool.acquire(1024).unwrap();
        buf.as_mut_slice().fill(7);
        drop(buf);
        // The recycled buffer keeps its allocation; contents are overwritten
        // by the next decode, so stale bytes are fine.
        let buf = pool.acquire(512).unwrap();
        assert!(buf.bytes.as_ref().unwrap().len() >= 512);
    }

    #[test]
    fn test_frame_plane_slicing() {
        let pool = FramePool::new(1);
        let mut buf = pool.acquire(12).unwrap();
        buf.as_mut_slice().copy_from_slice(&[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let frame = VideoFrame::new(
            MediaTimestamp::ZERO,
            0,
            2,
            2,
            PixelFormat::Yuv420p,
            vec![
                PlaneLayout { offset: 0, stride: 2, rows: 2 },
                PlaneLayout { offset: 4, stride: 1, rows: 1 },
                PlaneLayout { offset: 5, stride: 1, rows: 1 },
            ],
            buf.freeze(),
        );
        assert_eq!(frame.plane(0), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(frame.plane(1), Some(&[5u8][..]));
        assert_eq!(frame.plane(2), Some(&[6u8][..]));
        assert!(frame.plane(3).is_none());
    }
}
