use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use crossbeam_utils::{Backoff, CachePadded};

const UNLOCKED: u64 = 0;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OWNER_ID: u64 = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_owner() -> u64 {
    OWNER_ID.with(|id| *id)
}

/// A non-blocking, re-entrant mutual exclusion primitive.
///
/// The lock is owned by a thread, not by a guard: a thread that already holds the lock can acquire it again without
/// blocking, and is told that it did so, so that only the outermost acquisition releases it.
///
/// Waiting threads never park. A barging acquire busy-spins with an exponential backoff, which is appropriate for
/// short, latency-sensitive critical sections such as swapping the active batch. A polite acquire yields its time slice
/// between attempts instead.
pub struct RawSpinLock {
    owner: CachePadded<AtomicU64>,
}

impl RawSpinLock {
    /// Creates a new, unlocked `RawSpinLock`.
    pub const fn new() -> Self {
        Self { owner: CachePadded::new(AtomicU64::new(UNLOCKED)) }
    }

    /// Acquires the lock, waiting as long as necessary.
    ///
    /// Returns `true` if the calling thread already held the lock, in which case the caller must not release it.
    pub fn acquire(&self, barge: bool) -> bool {
        let id = current_owner();
        if self.owner.load(Ordering::Relaxed) == id {
            return true;
        }

        let backoff = Backoff::new();
        while self
            .owner
            .compare_exchange_weak(UNLOCKED, id, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if barge {
                backoff.spin();
            } else {
                thread::yield_now();
            }
        }

        false
    }

    /// Releases the lock.
    ///
    /// Only the owning thread can release the lock. Calling this from any other thread is a no-op.
    pub fn release(&self) {
        let _ = self.owner.compare_exchange(
            current_owner(),
            UNLOCKED,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Returns `true` if any thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Returns `true` if the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_owner()
    }

    /// Runs `task` while holding the lock.
    ///
    /// The lock is released afterwards, even if `task` panics, unless the calling thread already held it on entry.
    pub fn with_lock<R>(&self, barge: bool, task: impl FnOnce() -> R) -> R {
        let _guard = RawGuard { lock: self, already_held: self.acquire(barge) };
        task()
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

struct RawGuard<'a> {
    lock: &'a RawSpinLock,
    already_held: bool,
}

impl Drop for RawGuard<'_> {
    fn drop(&mut self) {
        if !self.already_held {
            self.lock.release();
        }
    }
}

/// A value protected by a [`RawSpinLock`].
///
/// Unlike the raw lock, the guarded value can only be borrowed once at a time, so re-entering the lock from the owning
/// thread while a guard is alive panics rather than handing out a second mutable reference.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    value: UnsafeCell<T>,
}

// SAFETY: Access to `value` is serialized by `raw`, and a guard only exists on the thread that acquired the lock.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self { raw: RawSpinLock::new(), value: UnsafeCell::new(value) }
    }

    /// Acquires the lock, returning a guard that releases it when dropped.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the lock.
    pub fn lock(&self, barge: bool) -> SpinLockGuard<'_, T> {
        let already_held = self.raw.acquire(barge);
        assert!(!already_held, "spin lock re-entered while its value was already borrowed");
        SpinLockGuard { lock: self }
    }

    /// Runs `task` with exclusive access to the guarded value.
    pub fn with_lock<R>(&self, barge: bool, task: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock(barge);
        task(&mut guard)
    }

    /// Consumes the lock, returning the guarded value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Exclusive access to the value inside a [`SpinLock`].
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard exists only while the current thread holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard exists only while the current thread holds the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use super::{RawSpinLock, SpinLock};

    #[test]
    fn reentrant_acquire_reports_existing_ownership() {
        let lock = RawSpinLock::new();

        assert!(!lock.acquire(false));
        assert!(lock.acquire(true));
        assert!(lock.is_held_by_current_thread());

        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn nested_with_lock_only_releases_outermost() {
        let lock = RawSpinLock::new();

        lock.with_lock(false, || {
            lock.with_lock(true, || assert!(lock.is_held_by_current_thread()));
            assert!(lock.is_held_by_current_thread());
        });

        assert!(!lock.is_locked());
    }

    #[test]
    fn release_from_non_owner_is_ignored() {
        let lock = Arc::new(RawSpinLock::new());
        assert!(!lock.acquire(false));

        let other = Arc::clone(&lock);
        thread::spawn(move || {
            other.release();
            assert!(other.is_locked());
            assert!(!other.is_held_by_current_thread());
        })
        .join()
        .unwrap();

        assert!(lock.is_held_by_current_thread());
        lock.release();
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let lock = Arc::new(RawSpinLock::new());
        let acquired = Arc::new(AtomicBool::new(false));
        assert!(!lock.acquire(true));

        let waiter = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                lock.with_lock(false, || acquired.store(true, Ordering::SeqCst));
            })
        };

        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));

        lock.release();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!lock.is_locked());
    }

    #[test]
    fn guarded_value_is_mutually_exclusive() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 5_000;

        // A plain `Vec` would tear under concurrent pushes; the lock must serialize them.
        let lock = Arc::new(SpinLock::new(Vec::with_capacity(THREADS * ITERATIONS)));
        let handles = (0..THREADS)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for j in 0..ITERATIONS {
                        lock.with_lock(i % 2 == 0, |v| v.push(j));
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let values = Arc::try_unwrap(lock).ok().unwrap().into_inner();
        assert_eq!(values.len(), THREADS * ITERATIONS);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn reentering_guarded_value_panics() {
        let lock = SpinLock::new(0u32);
        lock.with_lock(false, |_| {
            lock.with_lock(false, |v| *v += 1);
        });
    }

    #[test]
    fn panicking_task_releases_lock() {
        let lock = Arc::new(RawSpinLock::new());

        let inner = Arc::clone(&lock);
        let result = thread::spawn(move || inner.with_lock(false, || panic!("boom"))).join();

        assert!(result.is_err());
        assert!(!lock.is_locked());
    }
}
