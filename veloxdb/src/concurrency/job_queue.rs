//! A bounded job queue feeding worker pools (spec.md §4.9 restoration
//! workers; also used by the WAL writer's append intake). Supports two
//! dequeue modes:
//!
//! - "normal": plain FIFO, any ready job.
//! - "grouped": jobs carry a `u64` group key (e.g. an object id) and the
//!   queue never hands out two jobs from the same group to two different
//!   workers concurrently, preserving per-group ordering without a worker
//!   having to coordinate with its peers.
//!
//! `drain` empties the queue without blocking, for orderly shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::event_pool::Semaphore;

/// A unit of work carrying an ordering key.
pub trait Keyed {
    fn group_key(&self) -> u64;
}

struct Inner<T> {
    ready: VecDeque<T>,
    pending_by_group: HashMap<u64, VecDeque<T>>,
    active_groups: HashSet<u64>,
    len: usize,
}

pub struct JobQueue<T: Keyed> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    occupied: Semaphore,
}

/// RAII guard returned by `dequeue_grouped`: releasing the group (on drop)
/// promotes the next pending job for that group, if any, into `ready`.
pub struct GroupedJob<'a, T: Keyed> {
    queue: &'a JobQueue<T>,
    job: Option<T>,
    group: u64,
}

impl<'a, T: Keyed> GroupedJob<'a, T> {
    pub fn job(&self) -> &T {
        self.job.as_ref().expect("job taken exactly once, on drop")
    }

    pub fn into_inner(mut self) -> T {
        self.job.take().expect("job taken exactly once, on drop")
    }
}

impl<'a, T: Keyed> Drop for GroupedJob<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock().unwrap();
        inner.active_groups.remove(&self.group);
        if let Some(pending) = inner.pending_by_group.get_mut(&self.group) {
            if let Some(next) = pending.pop_front() {
                if pending.is_empty() {
                    inner.pending_by_group.remove(&self.group);
                }
                inner.ready.push_back(next);
                drop(inner);
                self.queue.occupied.release();
            }
        }
    }
}

impl<T: Keyed> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        JobQueue {
            capacity,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                pending_by_group: HashMap::new(),
                active_groups: HashSet::new(),
                len: 0,
            }),
            occupied: Semaphore::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks if the queue is at capacity. Callers that need bounded
    /// backpressure (the WAL writer's append intake) should call this
    /// rather than a non-blocking push.
    pub fn enqueue(&self, job: T) {
        loop {
            let mut inner = self.inner.lock().unwrap();
            if inner.len < self.capacity {
                inner.ready.push_back(job);
                inner.len += 1;
                drop(inner);
                self.occupied.release();
                return;
            }
            drop(inner);
            std::thread::yield_now();
        }
    }

    /// Plain FIFO dequeue, ignoring group keys.
    pub fn dequeue(&self) -> T {
        loop {
            self.occupied.acquire();
            let mut inner = self.inner.lock().unwrap();
            if let Some(job) = inner.ready.pop_front() {
                inner.len -= 1;
                return job;
            }
            // Spurious: a grouped dequeuer already consumed it elsewhere.
        }
    }

    /// Dequeues the first ready job whose group is not already checked out
    /// by another worker, blocking until one is available. Other ready jobs
    /// belonging to an active group are set aside under `pending_by_group`
    /// until the active job's `GroupedJob` guard is dropped.
    pub fn dequeue_grouped(&self) -> GroupedJob<'_, T> {
        loop {
            self.occupied.acquire();
            let mut inner = self.inner.lock().unwrap();
            let mut set_aside = Vec::new();
            let mut found = None;
            while let Some(job) = inner.ready.pop_front() {
                let group = job.group_key();
                if inner.active_groups.contains(&group) {
                    set_aside.push(job);
                    continue;
                }
                found = Some(job);
                break;
            }
            for job in set_aside {
                let group = job.group_key();
                inner.pending_by_group.entry(group).or_default().push_back(job);
            }
            if let Some(job) = found {
                let group = job.group_key();
                inner.active_groups.insert(group);
                inner.len -= 1;
                return GroupedJob {
                    queue: self,
                    job: Some(job),
                    group,
                };
            }
            // Every ready job's group is currently active; release the
            // permit we consumed and wait for one to free up.
            drop(inner);
            self.occupied.release();
            std::thread::yield_now();
        }
    }

    /// Empties the queue without blocking, for graceful shutdown. Jobs set
    /// aside under `pending_by_group` are included.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let mut out: Vec<T> = inner.ready.drain(..).collect();
        for (_, mut pending) in inner.pending_by_group.drain() {
            out.extend(pending.drain(..));
        }
        inner.len = 0;
        inner.active_groups.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Job {
        group: u64,
        seq: u32,
    }

    impl Keyed for Job {
        fn group_key(&self) -> u64 {
            self.group
        }
    }

    #[test]
    fn fifo_dequeue_preserves_order() {
        let q: JobQueue<Job> = JobQueue::new(8);
        q.enqueue(Job { group: 1, seq: 0 });
        q.enqueue(Job { group: 1, seq: 1 });
        assert_eq!(q.dequeue().seq, 0);
        assert_eq!(q.dequeue().seq, 1);
    }

    #[test]
    fn grouped_dequeue_skips_active_group() {
        let q: JobQueue<Job> = JobQueue::new(8);
        q.enqueue(Job { group: 1, seq: 0 });
        q.enqueue(Job { group: 1, seq: 1 });
        q.enqueue(Job { group: 2, seq: 0 });

        let first = q.dequeue_grouped();
        assert_eq!(first.job().group, 1);

        // The second group-1 job must not be handed out while the first is
        // still checked out; group 2's job should come through instead.
        let second = q.dequeue_grouped();
        assert_eq!(second.job().group, 2);

        drop(first);
        let third = q.dequeue_grouped();
        assert_eq!(third.job().group, 1);
        assert_eq!(third.job().seq, 1);
    }

    #[test]
    fn drain_empties_both_ready_and_pending() {
        let q: JobQueue<Job> = JobQueue::new(8);
        q.enqueue(Job { group: 1, seq: 0 });
        q.enqueue(Job { group: 1, seq: 1 });
        let _held = q.dequeue_grouped();
        let rest = q.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(q.len(), 0);
    }
}
