//! The snapshot semaphore, per spec.md §4.7: externally inhibits snapshot
//! rotations during critical windows (schema updates, replication seeding).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::concurrency::event_pool::Event;

/// `block()` raises the blocker count and waits for any writer already
/// mid-rotation to finish; `enter()` is a try-read that only succeeds while
/// the blocker count is zero.
pub struct SnapshotSemaphore {
    blockers: AtomicUsize,
    writers_in_flight: AtomicUsize,
    drained: Event,
}

impl SnapshotSemaphore {
    pub fn new() -> Self {
        SnapshotSemaphore {
            blockers: AtomicUsize::new(0),
            writers_in_flight: AtomicUsize::new(0),
            drained: Event::default(),
        }
    }

    /// Try-enter used by the WAL writer before starting a rotation; fails
    /// while any blocker holds the semaphore.
    pub fn enter(&self) -> bool {
        if self.blockers.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.writers_in_flight.fetch_add(1, Ordering::AcqRel);
        if self.blockers.load(Ordering::Acquire) != 0 {
            self.exit();
            return false;
        }
        true
    }

    pub fn exit(&self) {
        if self.writers_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.signal_all();
        }
    }

    /// Blocks future `enter()` calls and waits for in-flight writers to
    /// finish. Callers must pair with `unblock()`.
    pub fn block(&self) {
        self.blockers.fetch_add(1, Ordering::AcqRel);
        while self.writers_in_flight.load(Ordering::Acquire) != 0 {
            self.drained.wait_timeout(std::time::Duration::from_millis(1));
        }
    }

    pub fn unblock(&self) {
        self.blockers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for SnapshotSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_succeeds_when_unblocked() {
        let sem = SnapshotSemaphore::new();
        assert!(sem.enter());
        sem.exit();
    }

    #[test]
    fn enter_fails_while_blocked() {
        let sem = SnapshotSemaphore::new();
        sem.block();
        assert!(!sem.enter());
        sem.unblock();
        assert!(sem.enter());
        sem.exit();
    }
}
