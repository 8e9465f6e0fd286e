//! Crash recovery: replays WAL + snapshot state back into an `ObjectStore`
//! (spec.md §4.6, §4.9).

pub mod restorer;
pub mod worker;

pub use restorer::{rebuild_derived_state, restore};
pub use worker::{ApplyJob, RestoreWorkerPool};
