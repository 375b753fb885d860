//! Process-shared spinlock.
//!
//! The lock word lives inside the shared segment, so any process that maps the
//! segment can take it. Nothing beyond atomics is required from the OS.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

const BACKOFF_UNIT_NANOS: u64 = 100;
const MAX_BACKOFF: u64 = 1024;

#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
    state: AtomicU32,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Spins until the lock is taken. Sleeps between attempts, doubling the
    /// delay up to `MAX_BACKOFF * 100ns`.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        let mut backoff = 1u64;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Wait for the holder to release before hammering the cache line again.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                thread::sleep(Duration::from_nanos(backoff * BACKOFF_UNIT_NANOS));
                if backoff < MAX_BACKOFF {
                    backoff *= 2;
                }
            }
        }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    /// Forces the lock open. Only valid while the segment is being
    /// (re)initialized and no other process can be inside a critical section.
    pub(crate) fn force_unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

/// Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Ordering::Release);
    }
}
