//! Non-reentrant shared/exclusive latch.
//!
//! The latch state lives in one atomic word. Acquisition spins a fixed
//! number of CAS attempts before descending to a queue of parked
//! threads. Writers set a waiting bit that stops the flow of new
//! readers, so a stream of readers cannot starve a writer.
//!
//! # Non-reentrancy
//!
//! Latches are NOT reentrant. A thread that re-acquires a latch it
//! already holds deadlocks against itself; callers must release and
//! reacquire instead. Upgrade from shared to exclusive is likewise not
//! supported.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

/// Exclusive holder bit.
const WRITER: u32 = 1;
/// A writer is parked waiting; new readers must queue behind it.
const WRITER_WAITING: u32 = 2;
/// One shared holder. Readers stack in units of this value.
const READER: u32 = 4;

/// CAS attempts before parking.
const SPIN_LIMIT: u32 = 64;

/// The raw latch: state word plus a park queue.
///
/// Most callers want [`Latch`], which pairs the raw latch with the data
/// it guards. The raw form exists for structures that manage their own
/// storage, such as tree nodes.
pub struct RawLatch {
    state: AtomicU32,
    queue: Mutex<()>,
    readers: Condvar,
    writers: Condvar,
}

impl Default for RawLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLatch {
    /// Creates an unlocked latch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            queue: Mutex::new(()),
            readers: Condvar::new(),
            writers: Condvar::new(),
        }
    }

    /// Tries to acquire the latch shared without blocking.
    pub fn try_acquire_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & (WRITER | WRITER_WAITING) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state + READER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Acquires the latch shared, blocking as needed.
    pub fn acquire_shared(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire_shared() {
                return;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.queue.lock().unwrap();
        loop {
            if self.try_acquire_shared() {
                return;
            }
            guard = self.readers.wait(guard).unwrap();
        }
    }

    /// Releases a shared hold.
    pub fn release_shared(&self) {
        let prev = self.state.fetch_sub(READER, Ordering::Release);
        debug_assert!(prev >= READER, "release_shared without a shared hold");
        if prev - READER == WRITER_WAITING {
            // Last reader out with a writer parked.
            let _guard = self.queue.lock().unwrap();
            self.writers.notify_one();
        }
    }

    /// Tries to acquire the latch exclusively without blocking.
    pub fn try_acquire_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the latch exclusively, blocking as needed.
    pub fn acquire_exclusive(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire_exclusive() {
                return;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.queue.lock().unwrap();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & !WRITER_WAITING == 0 {
                if self
                    .state
                    .compare_exchange(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if state & WRITER_WAITING == 0
                && self
                    .state
                    .compare_exchange(
                        state,
                        state | WRITER_WAITING,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_err()
            {
                continue;
            }
            guard = self.writers.wait(guard).unwrap();
        }
    }

    /// Releases an exclusive hold.
    pub fn release_exclusive(&self) {
        // Parked writers re-assert WRITER_WAITING themselves after waking.
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "release_exclusive without the hold");
        let _guard = self.queue.lock().unwrap();
        self.writers.notify_one();
        self.readers.notify_all();
    }

    /// Returns true if any hold is active. Racy; for assertions only.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & !WRITER_WAITING != 0
    }
}

impl fmt::Debug for RawLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawLatch")
            .field("writer", &(state & WRITER != 0))
            .field("readers", &(state / READER))
            .finish()
    }
}

/// A latch paired with the data it guards.
///
/// The guard API mirrors `parking_lot::RwLock`, but the lock itself is
/// the engine's non-reentrant latch.
pub struct Latch<T: ?Sized> {
    raw: RawLatch,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Latch<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Latch<T> {}

impl<T> Latch<T> {
    /// Creates a new latch guarding `data`.
    pub fn new(data: T) -> Self {
        Self {
            raw: RawLatch::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the latch, returning the guarded data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Latch<T> {
    /// Acquires the latch shared.
    pub fn read(&self) -> LatchReadGuard<'_, T> {
        self.raw.acquire_shared();
        LatchReadGuard { latch: self }
    }

    /// Tries to acquire the latch shared without blocking.
    pub fn try_read(&self) -> Option<LatchReadGuard<'_, T>> {
        if self.raw.try_acquire_shared() {
            Some(LatchReadGuard { latch: self })
        } else {
            None
        }
    }

    /// Acquires the latch exclusively.
    pub fn write(&self) -> LatchWriteGuard<'_, T> {
        self.raw.acquire_exclusive();
        LatchWriteGuard { latch: self }
    }

    /// Tries to acquire the latch exclusively without blocking.
    pub fn try_write(&self) -> Option<LatchWriteGuard<'_, T>> {
        if self.raw.try_acquire_exclusive() {
            Some(LatchWriteGuard { latch: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference without locking. Requires `&mut self`,
    /// which proves exclusive access statically.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for Latch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("Latch").field("data", &&*guard).finish(),
            None => f.debug_struct("Latch").field("data", &"<locked>").finish(),
        }
    }
}

/// Shared guard for a [`Latch`].
pub struct LatchReadGuard<'a, T: ?Sized> {
    latch: &'a Latch<T>,
}

impl<T: ?Sized> Deref for LatchReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.latch.data.get() }
    }
}

impl<T: ?Sized> Drop for LatchReadGuard<'_, T> {
    fn drop(&mut self) {
        self.latch.raw.release_shared();
    }
}

/// Exclusive guard for a [`Latch`].
pub struct LatchWriteGuard<'a, T: ?Sized> {
    latch: &'a Latch<T>,
}

impl<T: ?Sized> Deref for LatchWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.latch.data.get() }
    }
}

impl<T: ?Sized> DerefMut for LatchWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.latch.data.get() }
    }
}

impl<T: ?Sized> Drop for LatchWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.latch.raw.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_holds_stack() {
        let latch = RawLatch::new();
        assert!(latch.try_acquire_shared());
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn test_exclusive_excludes_all() {
        let latch = RawLatch::new();
        assert!(latch.try_acquire_exclusive());
        assert!(!latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_exclusive();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
    }

    #[test]
    fn test_guarded_counter() {
        let latch = Arc::new(Latch::new(0u64));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *latch.write() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*latch.read(), 8000);
    }

    #[test]
    fn test_writer_blocks_until_readers_leave() {
        let latch = Arc::new(Latch::new(0u32));
        let reader = latch.read();

        let latch2 = Arc::clone(&latch);
        let writer = thread::spawn(move || {
            *latch2.write() = 7;
        });

        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(*reader, 0);
        drop(reader);

        writer.join().unwrap();
        assert_eq!(*latch.read(), 7);
    }

    #[test]
    fn test_try_write_fails_under_reader() {
        let latch = Latch::new(());
        let guard = latch.read();
        assert!(latch.try_write().is_none());
        drop(guard);
        assert!(latch.try_write().is_some());
    }
}
