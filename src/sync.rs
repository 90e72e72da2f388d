//! Process-shared lock used for buckets and statistics.
//!
//! The lock is a single `AtomicU32` so it can live inside the shared region
//! and be used from any process that maps it. Contended waiters park on a
//! futex without `FUTEX_PRIVATE_FLAG`, which is what makes wake-ups work
//! across address spaces.
//!
//! # States
//! - 0: Unlocked
//! - 1: Locked, no waiters (likely)
//! - 2: Locked, waiters exist (contended)

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "linux")]
use libc::{SYS_futex, FUTEX_WAIT, FUTEX_WAKE};

#[cfg(target_os = "linux")]
#[inline]
fn futex_wait(addr: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
#[inline]
fn futex_wake_one(addr: &AtomicU32) {
    unsafe {
        libc::syscall(SYS_futex, addr as *const AtomicU32 as *const u32, FUTEX_WAKE, 1);
    }
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn futex_wait(addr: &AtomicU32, expected: u32) {
    while addr.load(Ordering::Relaxed) == expected {
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn futex_wake_one(_addr: &AtomicU32) {}

/// A mutex without payload, safe to place in memory shared between processes.
///
/// All-zero bytes are a valid unlocked lock, so freshly mapped memory needs
/// no initialization.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct RawLock {
    state: AtomicU32,
}

impl RawLock {
    const UNLOCKED: u32 = 0;
    const LOCKED: u32 = 1;
    const CONTENDED: u32 = 2;

    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self { state: AtomicU32::new(Self::UNLOCKED) }
    }

    /// Acquires the lock, blocking until it is available.
    #[inline]
    pub fn lock(&self) -> RawLockGuard<'_> {
        if self
            .state
            .compare_exchange(Self::UNLOCKED, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        RawLockGuard { lock: self }
    }

    /// Acquires the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<RawLockGuard<'_>> {
        self.state
            .compare_exchange(Self::UNLOCKED, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RawLockGuard { lock: self })
    }

    /// Whether some holder currently owns the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != Self::UNLOCKED
    }

    #[cold]
    fn lock_contended(&self) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.state.load(Ordering::Relaxed) == Self::UNLOCKED
                && self
                    .state
                    .compare_exchange(Self::UNLOCKED, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }

        // Park. Whoever takes the lock from here on leaves it marked contended
        // so the eventual unlock wakes the next waiter.
        while self.state.swap(Self::CONTENDED, Ordering::Acquire) != Self::UNLOCKED {
            futex_wait(&self.state, Self::CONTENDED);
        }
    }

    #[inline]
    fn unlock(&self) {
        if self.state.swap(Self::UNLOCKED, Ordering::Release) == Self::CONTENDED {
            futex_wake_one(&self.state);
        }
    }
}

/// Releases the lock on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
