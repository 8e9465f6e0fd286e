//! Transaction state and its pending write set, per spec.md §3 "Transaction"
//! and §4.5.

use std::collections::HashMap;

use crate::changeset::{ChangesetWriter, OpType};
use crate::model::{ClassId, LogGroupId, PropertyId};
use crate::store::arena::Handle;
use crate::store::object::{CommitVersion, ObjectId};

pub type TransactionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionType {
    /// Snapshot-only: never conflicts, produces no changeset.
    Read,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Prepared,
    Committed,
    Aborted,
}

/// One pending write: the object touched, the predecessor the writer
/// observed (for conflict detection), and the new (unpublished) version
/// node's handle.
#[derive(Clone, Debug)]
pub struct PendingWrite {
    pub class_id: ClassId,
    pub object_id: ObjectId,
    pub observed_head: Option<Handle>,
    pub new_node: Handle,
    pub op: OpType,
}

/// `(old_target, new_target)` for a single reference property change,
/// queued so the inverse-ref graph can be updated atomically at commit
/// (spec.md §4.2 "Inverse-reference maintenance").
#[derive(Clone, Debug)]
pub struct InverseRefChange {
    pub source_class: ClassId,
    pub source_id: ObjectId,
    pub source_property: PropertyId,
    pub target_class: ClassId,
    pub old_target: Option<ObjectId>,
    pub new_target: Option<ObjectId>,
}

pub struct Transaction {
    pub id: TransactionId,
    pub txn_type: TransactionType,
    pub read_version: CommitVersion,
    pub state: TransactionState,
    pub writes: Vec<PendingWrite>,
    pub changesets: HashMap<LogGroupId, ChangesetWriter>,
    pub inverse_ref_changes: Vec<InverseRefChange>,
    pub commit_version: Option<CommitVersion>,
}

impl Transaction {
    pub fn new(id: TransactionId, txn_type: TransactionType, read_version: CommitVersion) -> Self {
        Transaction {
            id,
            txn_type,
            read_version,
            state: TransactionState::Active,
            writes: Vec::new(),
            changesets: HashMap::new(),
            inverse_ref_changes: Vec::new(),
            commit_version: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.txn_type == TransactionType::Read
    }

    /// The `AffectedLogGroups` bitmask computed from the log groups of the
    /// classes this transaction touched (spec.md §4.5 step 3).
    pub fn affected_log_groups(&self, class_log_group: impl Fn(ClassId) -> LogGroupId) -> u64 {
        let mut mask = 0u64;
        for write in &self.writes {
            mask |= 1 << class_log_group(write.class_id);
        }
        mask
    }
}
