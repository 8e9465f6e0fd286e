//! A process-wide pool of recyclable wait/wake events.
//!
//! Handles are `(slot index, generation)` pairs, mirroring the
//! generation-stamped handle idiom used for object arenas (spec.md §9): a
//! handle whose generation no longer matches the slot's current generation
//! is a stale reference rather than a dangling one, so a thread can always
//! safely try to act on a handle it's holding without racing a real
//! deallocation. Slots themselves are never freed, only recycled; a waking
//! thread therefore can never free an event a waiter still references.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A single wait/wake event: a boolean flag guarded by a condvar.
#[derive(Default)]
pub struct Event {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    fn reset(&self) {
        *self.ready.lock().unwrap() = false;
    }

    /// Blocks until `signal_one`/`signal_all` is called, or `timeout`
    /// elapses. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.ready.lock().unwrap();
        while !*guard {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return *guard;
            }
            let (g, result) = self.condvar.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && !*guard {
                return false;
            }
        }
        true
    }

    pub fn wait(&self) {
        let mut guard = self.ready.lock().unwrap();
        while !*guard {
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    pub fn signal(&self) {
        *self.ready.lock().unwrap() = true;
        self.condvar.notify_one();
    }

    pub fn signal_all(&self) {
        *self.ready.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

struct Slot {
    event: Event,
    generation: AtomicU64,
    in_use: AtomicBool,
}

/// An opaque handle into an `EventPool`. Packs a slot index and the
/// generation observed at acquisition time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHandle(u64);

impl EventHandle {
    fn new(index: u32, generation: u32) -> Self {
        EventHandle((index as u64) << 32 | generation as u64)
    }

    fn index(&self) -> usize {
        (self.0 >> 32) as usize
    }

    fn generation(&self) -> u32 {
        self.0 as u32
    }
}

/// A singleton, process-wide pool of recyclable events, indexed by small
/// integers per spec.md §4.1.
pub struct EventPool {
    slots: Mutex<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
    next_index: AtomicU32,
}

impl EventPool {
    pub fn new() -> Self {
        EventPool {
            slots: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(0),
        }
    }

    /// Checks out a slot, creating one if none are free.
    pub fn acquire(&self) -> EventHandle {
        if let Some(index) = self.free.lock().unwrap().pop() {
            let slots = self.slots.lock().unwrap();
            let slot = &slots[index as usize];
            slot.event.reset();
            slot.in_use.store(true, Ordering::Release);
            let generation = slot.generation.load(Ordering::Acquire);
            return EventHandle::new(index, generation);
        }

        let mut slots = self.slots.lock().unwrap();
        let index = slots.len() as u32;
        slots.push(Slot {
            event: Event::default(),
            generation: AtomicU64::new(1),
            in_use: AtomicBool::new(true),
        });
        EventHandle::new(index, 1)
    }

    /// Releases a handle, bumping the slot's generation so any stale
    /// handle referring to it fails `try_get` from now on.
    pub fn release(&self, handle: EventHandle) {
        let slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(handle.index()) {
            if slot.generation.load(Ordering::Acquire) as u32 == handle.generation() {
                slot.in_use.store(false, Ordering::Release);
                slot.generation.fetch_add(1, Ordering::AcqRel);
                drop(slots);
                self.free.lock().unwrap().push(handle.index() as u32);
            }
        }
    }

    /// Tries to atomically validate the handle against the slot's current
    /// generation before acting on the underlying event. Fails if the slot
    /// has already been returned to the pool and possibly reissued.
    pub fn try_get<R>(&self, handle: EventHandle, f: impl FnOnce(&Event) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(handle.index())?;
        if slot.in_use.load(Ordering::Acquire)
            && slot.generation.load(Ordering::Acquire) as u32 == handle.generation()
        {
            Some(f(&slot.event))
        } else {
            None
        }
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore built atop the event pool, used for job-queue
/// backpressure and async-commit barriers.
pub struct Semaphore {
    permits: AtomicU64,
    waiters_event: Event,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Semaphore {
            permits: AtomicU64::new(initial),
            waiters_event: Event::default(),
        }
    }

    pub fn acquire(&self) {
        loop {
            let current = self.permits.load(Ordering::Acquire);
            if current > 0
                && self
                    .permits
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
            self.waiters_event.wait_timeout(Duration::from_millis(1));
        }
    }

    pub fn try_acquire(&self) -> bool {
        let current = self.permits.load(Ordering::Acquire);
        current > 0
            && self
                .permits
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn release(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        self.waiters_event.signal_all();
    }

    pub fn available(&self) -> u64 {
        self.permits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_recycles_slot() {
        let pool = EventPool::new();
        let h1 = pool.acquire();
        pool.release(h1);
        let h2 = pool.acquire();
        // Recycled the same slot index, but the generation must differ.
        assert_ne!(h1, h2);
    }

    #[test]
    fn stale_handle_fails_after_release() {
        let pool = EventPool::new();
        let h1 = pool.acquire();
        pool.release(h1);
        assert!(pool.try_get(h1, |_| ()).is_none());
    }

    #[test]
    fn semaphore_blocks_until_release() {
        let sem = std::sync::Arc::new(Semaphore::new(0));
        assert!(!sem.try_acquire());
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            sem2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        sem.release();
        handle.join().unwrap();
    }
}
