//! Exclusive-access gate for live capture devices.
//!
//! Rapid close/reopen cycles can race two decoder instances against the same
//! hardware handle. The [`DeviceRegistry`] maps a device key to its current
//! holder; an engine acquires the key before opening a capture source and the
//! returned [`DeviceLease`] releases it automatically when the source closes.
//!
//! The registry is an injectable service passed into the engine, so tests
//! substitute their own instance; a process-wide default exists only as a
//! convenience for embedders that share one registry across players.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Bound on each individual wait so the running flag of a closing engine is
/// observed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process- or test-scoped set of device keys currently held.
pub struct DeviceRegistry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        })
    }

    /// The shared default registry.
    pub fn global() -> &'static Arc<DeviceRegistry> {
        static GLOBAL: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(DeviceRegistry::new)
    }

    /// Attempts to take exclusive ownership of `key`, waiting up to
    /// `timeout` in short slices for the current holder to release it.
    ///
    /// Returns `None` when the deadline passes; the caller turns that into
    /// an open failure.
    pub fn acquire(self: &Arc<Self>, key: &str, timeout: Duration) -> Option<DeviceLease> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        loop {
            if !held.contains(key) {
                held.insert(key.to_string());
                return Some(DeviceLease {
                    registry: Arc::clone(self),
                    key: key.to_string(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(device = key, "exclusive device access timed out");
                return None;
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            self.released.wait_for(&mut held, wait);
        }
    }

    /// Returns true while `key` is held by some lease.
    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock();
        held.remove(key);
        self.released.notify_all();
    }
}

/// Ownership of one device key. Dropping the lease releases the key and
/// wakes waiters.
pub struct DeviceLease {
    registry: Arc<DeviceRegistry>,
    key: String,
}

impl DeviceLease {
    /// The key this lease holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let registry = DeviceRegistry::new();
        let lease = registry.acquire("/dev/video0", Duration::from_millis(10));
        assert!(lease.is_some());
        assert!(registry.is_held("/dev/video0"));
        drop(lease);
        assert!(!registry.is_held("/dev/video0"));
    }

    #[test]
    fn test_second_acquire_times_out() {
        let registry = DeviceRegistry::new();
        let _lease = registry.acquire("/dev/video0", Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let second = registry.acquire("/dev/video0", Duration::from_millis(50));
        assert!(second.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_different_keys_do_not_contend() {
        let registry = DeviceRegistry::new();
        let a = registry.acquire("/dev/video0", Duration::from_millis(10));
        let b = registry.acquire("/dev/video1", Duration::from_millis(10));
        assert!(a.is_some() && b.is_some());
    }

    #[test]
    fn test_waiter_wins_after_release() {
        let registry = DeviceRegistry::new();
        let lease = registry.acquire("cam", Duration::from_millis(10)).unwrap();

        let contender = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.acquire("cam", Duration::from_secs(2)))
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(lease);
        let won = contender.join().unwrap();
        assert!(won.is_some());
    }

    #[test]
    fn test_registries_are_independent() {
        let a = DeviceRegistry::new();
        let b = DeviceRegistry::new();
        let _held = a.acquire("cam", Duration::from_millis(10)).unwrap();
        assert!(b.acquire("cam", Duration::from_millis(10)).is_some());
    }
}
