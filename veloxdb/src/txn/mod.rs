//! Transaction lifecycle: version/LSN counters, transaction state, and the
//! commit protocol (spec.md §4.2, §4.5).

pub mod manager;
pub mod transaction;
pub mod version;

pub use manager::{CommitBarrier, Persister, SynchronousPersister, TransactionManager};
pub use transaction::{Transaction, TransactionId, TransactionState, TransactionType};
pub use version::{LsnAllocator, VersionCounter};
