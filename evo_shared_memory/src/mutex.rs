//! Cross-process mutex living inside the shared segment.
//!
//! `ShmMutex` is a plain spin/yield lock over two atomics so it works
//! for every process mapping the segment, whatever its base address. The
//! holder's pid is recorded so a lock left behind by a dead process can be
//! recovered instead of wedging every other attached process.
//!
//! The guard releases on drop, so every early return unlocks.

use crate::platform::{get_current_pid, is_process_alive};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Spins before the first `yield_now`.
const SPIN_LIMIT: u32 = 64;

/// Yields between liveness checks of the current holder.
const OWNER_CHECK_INTERVAL: u32 = 4096;

/// Mutex usable across processes sharing one mapping.
#[repr(C)]
#[derive(Debug)]
pub struct ShmMutex {
    state: AtomicU32,
    owner: AtomicU32,
}

impl ShmMutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU32::new(0),
        }
    }

    /// Acquire the mutex, blocking until it is free.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            spins = spins.wrapping_add(1);
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
                if spins % OWNER_CHECK_INTERVAL == 0 {
                    self.recover_abandoned();
                }
            }
        }
    }

    /// Acquire the mutex if it is free.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.owner.store(get_current_pid(), Ordering::Relaxed);
        Some(ShmMutexGuard { mutex: self })
    }

    /// True while some process holds the mutex.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    /// Pid of the last holder.
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    fn recover_abandoned(&self) {
        let owner = self.owner.load(Ordering::Relaxed);
        if owner != 0 && owner != get_current_pid() && !is_process_alive(owner) {
            warn!("Recovering HAL mutex abandoned by dead process {}", owner);
            self.owner.store(0, Ordering::Relaxed);
            self.state.store(UNLOCKED, Ordering::Release);
        }
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard of a [`ShmMutex`].
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl ShmMutexGuard<'_> {
    /// True when this guard belongs to `mutex`.
    pub fn guards(&self, mutex: &ShmMutex) -> bool {
        std::ptr::eq(self.mutex, mutex)
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
