//! Concurrency primitives backing the engine: a fair reader/writer lock, a
//! CPU-partitioned variant of it, process-wide event/semaphore pools, a
//! bounded job queue with worker pools, and a cache-line aligned allocator.
//! See spec.md §4.1 and §5.

pub mod align_alloc;
pub mod cpu_lock;
pub mod event_pool;
pub mod job_queue;
pub mod rwlock;

pub use cpu_lock::CpuRwLock;
pub use rwlock::RwLock;
