//! A fair reader/writer lock, per spec.md §4.1.
//!
//! A single 64-bit state word packs a writer-held flag, a writer-waiting
//! flag, a waiting-reader count, and an entered-reader count. Waiting
//! threads park on a `Semaphore` rather than spinning indefinitely: readers
//! share one semaphore woken in bulk by an exiting writer, writers share a
//! second semaphore woken one permit at a time so that writers never starve
//! behind a stream of readers once one of them is waiting ("writers have
//! priority over new readers once one is waiting").

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::event_pool::Semaphore;

const WRITER_HELD: u64 = 1 << 63;
const WRITER_WAITING: u64 = 1 << 62;

const ENTERED_READER_SHIFT: u32 = 0;
const WAITING_READER_SHIFT: u32 = 20;
const WAITING_WRITER_SHIFT: u32 = 40;
const FIELD_MASK: u64 = (1 << 20) - 1;

fn entered_readers(state: u64) -> u64 {
    (state >> ENTERED_READER_SHIFT) & FIELD_MASK
}
fn waiting_readers(state: u64) -> u64 {
    (state >> WAITING_READER_SHIFT) & FIELD_MASK
}
fn waiting_writers(state: u64) -> u64 {
    (state >> WAITING_WRITER_SHIFT) & FIELD_MASK
}

/// A fair reader/writer lock guarding a `T`.
pub struct RwLock<T> {
    state: AtomicU64,
    reader_wake: Semaphore,
    writer_wake: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            state: AtomicU64::new(0),
            reader_wake: Semaphore::new(0),
            writer_wake: Semaphore::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins briefly, then parks, until a read slot is available.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.try_enter_read_timeout(None);
        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let state = self.state.load(Ordering::Acquire);
        if state & (WRITER_HELD | WRITER_WAITING) != 0 {
            return None;
        }
        self.state
            .compare_exchange(
                state,
                state + (1 << ENTERED_READER_SHIFT),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| RwLockReadGuard { lock: self })
    }

    /// Returns `None` on timeout rather than blocking forever, per spec.md
    /// §5 "Cancellation & timeouts".
    pub fn read_timeout(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, T>> {
        if self.try_enter_read_timeout(Some(timeout)) {
            Some(RwLockReadGuard { lock: self })
        } else {
            None
        }
    }

    fn try_enter_read_timeout(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & (WRITER_HELD | WRITER_WAITING) == 0 {
                if self
                    .state
                    .compare_exchange(
                        state,
                        state + (1 << ENTERED_READER_SHIFT),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            if backoff.spin() {
                continue;
            }

            // Register as a waiting reader, then park on the shared
            // reader-wake semaphore.
            self.state
                .fetch_add(1 << WAITING_READER_SHIFT, Ordering::AcqRel);

            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || !self.wait_reader(remaining) {
                    self.state
                        .fetch_sub(1 << WAITING_READER_SHIFT, Ordering::AcqRel);
                    return false;
                }
            } else {
                self.reader_wake.acquire();
            }
            self.state
                .fetch_sub(1 << WAITING_READER_SHIFT, Ordering::AcqRel);
            backoff = Backoff::new();
        }
    }

    fn wait_reader(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.reader_wake.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.try_enter_write_timeout(None);
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER_HELD, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RwLockWriteGuard { lock: self })
    }

    pub fn write_timeout(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, T>> {
        if self.try_enter_write_timeout(Some(timeout)) {
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    fn try_enter_write_timeout(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Acquire);
            if entered_readers(state) == 0 && state & WRITER_HELD == 0 {
                let new_state = (state & !WRITER_WAITING) | WRITER_HELD;
                if self
                    .state
                    .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            if backoff.spin() {
                continue;
            }

            self.state
                .fetch_add((1 << WAITING_WRITER_SHIFT) | WRITER_WAITING, Ordering::AcqRel);

            let acquired = if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                !remaining.is_zero() && self.wait_writer(remaining)
            } else {
                self.writer_wake.acquire();
                true
            };

            let prev = self.state.fetch_sub(1 << WAITING_WRITER_SHIFT, Ordering::AcqRel);
            if waiting_writers(prev) == 1 {
                self.state.fetch_and(!WRITER_WAITING, Ordering::AcqRel);
            }

            if !acquired {
                return false;
            }
            backoff = Backoff::new();
        }
    }

    fn wait_writer(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.writer_wake.try_acquire() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    fn exit_read(&self) {
        let prev = self
            .state
            .fetch_sub(1 << ENTERED_READER_SHIFT, Ordering::AcqRel);
        let new_state = prev - (1 << ENTERED_READER_SHIFT);
        self.wake_after_exit(new_state, false);
    }

    fn exit_write(&self) {
        let prev = self.state.fetch_and(!WRITER_HELD, Ordering::AcqRel);
        let new_state = prev & !WRITER_HELD;
        self.wake_after_exit(new_state, true);
    }

    fn wake_after_exit(&self, new_state: u64, was_writer: bool) {
        if entered_readers(new_state) != 0 {
            return;
        }
        if waiting_writers(new_state) > 0 {
            self.writer_wake.release();
        } else if was_writer && waiting_readers(new_state) > 0 {
            for _ in 0..waiting_readers(new_state) {
                self.reader_wake.release();
            }
        }
    }

    /// Atomically converts a write guard into a read guard without ever
    /// exposing an unlocked window to other threads.
    pub fn downgrade(guard: RwLockWriteGuard<'_, T>) -> RwLockReadGuard<'_, T> {
        let lock = guard.lock;
        std::mem::forget(guard);
        lock.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some((s & !WRITER_HELD) + (1 << ENTERED_READER_SHIFT))
            })
            .expect("downgrade CAS never fails: closure always returns Some");
        RwLockReadGuard { lock }
    }
}

impl<'a, T> Deref for RwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.exit_read();
    }
}

impl<'a, T> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.exit_write();
    }
}

/// Exponentially increasing yield-then-sleep backoff, shared by both lock
/// kinds per spec.md §4.1's "cooperative spinning" suspension model.
struct Backoff {
    spins: u32,
}

impl Backoff {
    fn new() -> Self {
        Backoff { spins: 0 }
    }

    /// Returns `true` if the caller should retry the fast path immediately,
    /// `false` once the caller should fall back to parking.
    fn spin(&mut self) -> bool {
        const SPIN_LIMIT: u32 = 6;
        if self.spins < SPIN_LIMIT {
            for _ in 0..(1 << self.spins) {
                std::hint::spin_loop();
            }
            self.spins += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn readers_do_not_block_each_other() {
        let lock = RwLock::new(5);
        let g1 = lock.read();
        let g2 = lock.read();
        assert_eq!(*g1, 5);
        assert_eq!(*g2, 5);
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = RwLock::new(0);
        let _w = lock.write();
        assert!(lock.try_read().is_none());
    }

    #[test]
    fn write_then_read_after_drop() {
        let lock = RwLock::new(0);
        {
            let mut w = lock.write();
            *w = 42;
        }
        let r = lock.read();
        assert_eq!(*r, 42);
    }

    #[test]
    fn downgrade_preserves_value() {
        let lock = RwLock::new(1);
        let mut w = lock.write();
        *w = 7;
        let r = RwLock::downgrade(w);
        assert_eq!(*r, 7);
    }

    #[test]
    fn contended_write_eventually_succeeds() {
        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let mut g = lock.write();
                    *g += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 800);
    }

    #[test]
    fn write_timeout_returns_none_when_contended() {
        let lock = RwLock::new(0);
        let _g = lock.read();
        // A writer cannot proceed while a reader is active; with a short
        // timeout it must give up rather than block forever.
        assert!(lock.write_timeout(Duration::from_millis(20)).is_none());
    }
}
