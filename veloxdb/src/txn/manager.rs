//! The transaction manager: version/LSN assignment and the commit protocol,
//! per spec.md §4.5.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::changeset::{Block, BlockProperty, ChangesetWriter, FieldValue, OpType, Row};
use crate::concurrency::event_pool::Event;
use crate::error::{CResult, Error};
use crate::model::{ClassId, DeleteAction, LogGroupId, PropertyId, PropertyType};
use crate::store::arena::Handle;
use crate::store::class_store::ClassStore;
use crate::store::object::{CommitVersion, InverseRefEntry, ObjectId, ObjectVersion, Value, PENDING_VERSION};
use crate::store::ObjectStore;
use crate::txn::transaction::{InverseRefChange, PendingWrite, Transaction, TransactionId, TransactionType};
use crate::txn::version::{LsnAllocator, VersionCounter};

/// An async-commit completion barrier: a transaction registers one
/// outstanding count per affected log group and is resolved once every
/// group's persister confirms durability (spec.md §4.5 step 6).
pub struct CommitBarrier {
    remaining: AtomicUsize,
    done: Event,
}

impl CommitBarrier {
    pub fn new(count: usize) -> Arc<Self> {
        let done = Event::default();
        if count == 0 {
            done.signal_all();
        }
        Arc::new(CommitBarrier {
            remaining: AtomicUsize::new(count),
            done,
        })
    }

    pub fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.signal_all();
        }
    }

    pub fn wait(&self) {
        self.done.wait();
    }
}

/// The durability sink for a committed transaction's per-log-group
/// changesets. Implemented by the WAL writer; a test double can complete
/// the barrier synchronously.
pub trait Persister: Send + Sync {
    fn append(
        &self,
        log_group: LogGroupId,
        commit_version: CommitVersion,
        lsn: u64,
        changeset: Vec<u8>,
        barrier: Arc<CommitBarrier>,
    );
}

/// A persister that completes the barrier immediately; used in tests and as
/// a placeholder before the WAL writer is wired in.
pub struct SynchronousPersister;

impl Persister for SynchronousPersister {
    fn append(&self, _log_group: LogGroupId, _commit_version: CommitVersion, _lsn: u64, _changeset: Vec<u8>, barrier: Arc<CommitBarrier>) {
        barrier.complete_one();
    }
}

pub struct TransactionManager {
    pub store: ObjectStore,
    version: VersionCounter,
    lsn: LsnAllocator,
    next_txn_id: AtomicU64,
    persister: Arc<dyn Persister>,
}

impl TransactionManager {
    pub fn new(store: ObjectStore, initial_version: CommitVersion, log_group_count: usize, persister: Arc<dyn Persister>) -> Self {
        TransactionManager {
            store,
            version: VersionCounter::new(initial_version),
            lsn: LsnAllocator::new(log_group_count.max(1)),
            next_txn_id: AtomicU64::new(1),
            persister,
        }
    }

    pub fn current_version(&self) -> CommitVersion {
        self.version.current()
    }

    pub fn begin(&self, txn_type: TransactionType) -> Transaction {
        let id: TransactionId = self.next_txn_id.fetch_add(1, Ordering::AcqRel);
        Transaction::new(id, txn_type, self.version.current())
    }

    fn class_of(&self, class_id: ClassId) -> CResult<&ClassStore> {
        self.store.class(class_id)
    }

    /// Reads the object as this transaction sees it: its own uncommitted
    /// write, if any, otherwise the newest version visible at its
    /// read-version.
    pub fn read(&self, txn: &Transaction, class_id: ClassId, id: ObjectId) -> CResult<Option<ObjectVersion>> {
        if let Some(write) = txn.writes.iter().rev().find(|w| w.class_id == class_id && w.object_id == id) {
            let store = self.class_of(class_id)?;
            let node = store.node(write.new_node);
            return Ok(node.filter(|n| !n.tombstone));
        }
        let store = self.class_of(class_id)?;
        Ok(store.get_visible(id, txn.read_version))
    }

    pub fn create(&self, txn: &mut Transaction, class_id: ClassId, properties: Vec<Value>) -> CResult<ObjectId> {
        self.require_read_write(txn)?;
        let store = self.class_of(class_id)?;
        let id = store.allocate_object_id();
        let handle = store.push_node(ObjectVersion {
            id,
            version: PENDING_VERSION,
            prev: None,
            tombstone: false,
            properties,
            inverse_refs_head: None,
        });
        self.stage_inverse_ref_changes(txn, class_id, id, None, handle)?;
        txn.writes.push(PendingWrite {
            class_id,
            object_id: id,
            observed_head: None,
            new_node: handle,
            op: OpType::Insert,
        });
        Ok(id)
    }

    pub fn update(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId, mutate: impl FnOnce(&mut Vec<Value>)) -> CResult<()> {
        self.require_read_write(txn)?;
        let store = self.class_of(class_id)?;
        let observed_head = store.head(id);
        let current = self
            .read(txn, class_id, id)?
            .ok_or_else(|| Error::Internal(format!("update of missing object {id} in class {class_id}")))?;
        if let Some(h) = observed_head {
            if let Some(n) = store.node(h) {
                if n.version != PENDING_VERSION && n.version > txn.read_version {
                    return Err(Error::Conflict);
                }
            }
        }
        let mut properties = current.properties.clone();
        mutate(&mut properties);
        let handle = store.push_node(ObjectVersion {
            id,
            version: PENDING_VERSION,
            prev: observed_head,
            tombstone: false,
            properties,
            inverse_refs_head: current.inverse_refs_head,
        });
        self.stage_inverse_ref_changes(txn, class_id, id, Some(&current), handle)?;
        txn.writes.push(PendingWrite {
            class_id,
            object_id: id,
            observed_head,
            new_node: handle,
            op: OpType::Update,
        });
        Ok(())
    }

    /// Deletes an object, enforcing PreventDelete and propagating
    /// CascadeDelete/SetToNull to referencing objects (spec.md §3, §8
    /// scenario 4).
    pub fn delete(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId) -> CResult<()> {
        self.require_read_write(txn)?;
        // Must see this transaction's own not-yet-applied staged inverse-ref
        // changes too: an earlier statement in the same transaction may have
        // added or removed a reference to `id` before this delete runs.
        let refs = self.effective_inverse_refs(txn, class_id, id)?;
        let cascades = self.store.resolve_delete_actions(class_id, id, refs)?;

        let store = self.class_of(class_id)?;
        let observed_head = store.head(id);
        let current = self.read(txn, class_id, id)?;
        let handle = store.push_node(ObjectVersion {
            id,
            version: PENDING_VERSION,
            prev: observed_head,
            tombstone: true,
            properties: Vec::new(),
            inverse_refs_head: current.as_ref().and_then(|c| c.inverse_refs_head),
        });
        if let Some(current) = &current {
            self.stage_inverse_ref_changes(txn, class_id, id, Some(current), Handle::NULL)?;
            let _ = current;
        }
        txn.writes.push(PendingWrite {
            class_id,
            object_id: id,
            observed_head,
            new_node: handle,
            op: OpType::Delete,
        });

        for entry in cascades {
            let source_store = self.class_of(entry.source_class)?;
            let action = source_store
                .descriptor
                .property(entry.source_property)
                .and_then(|p| p.delete_action)
                .unwrap_or(DeleteAction::SetToNull);
            match action {
                DeleteAction::CascadeDelete => self.delete(txn, entry.source_class, entry.source_id)?,
                DeleteAction::SetToNull => self.clear_reference(txn, entry.source_class, entry.source_id, entry.source_property)?,
                DeleteAction::PreventDelete => unreachable!("PreventDelete already rejected by resolve_delete_actions"),
            }
        }
        Ok(())
    }

    fn clear_reference(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId, property_id: PropertyId) -> CResult<()> {
        let store = self.class_of(class_id)?;
        let position = store
            .descriptor
            .properties
            .iter()
            .position(|p| p.id == property_id)
            .ok_or_else(|| Error::SchemaMismatch(format!("property {property_id} not found on class {class_id}")))?;
        self.update(txn, class_id, id, |props| {
            if let Some(slot) = props.get_mut(position) {
                *slot = match slot {
                    Value::ReferenceArray(_) => Value::ReferenceArray(Vec::new()),
                    _ => Value::Reference(None),
                };
            }
        })
    }

    /// Diffs every inverse-tracked reference property between `old` and the
    /// version at `new_handle`, queuing one `InverseRefChange` per property
    /// whose target changed onto `txn.inverse_ref_changes` (spec.md §4.2
    /// "Inverse-reference maintenance": changes are enqueued as pending
    /// inverse changes here and applied atomically against the target
    /// objects' inverse-ref lists, under their per-class locks, only once
    /// this transaction commits — see `commit`). `new_handle ==
    /// Handle::NULL` models a delete: every forward reference the object
    /// held is torn down.
    fn stage_inverse_ref_changes(
        &self,
        txn: &mut Transaction,
        class_id: ClassId,
        object_id: ObjectId,
        old: Option<&ObjectVersion>,
        new_handle: Handle,
    ) -> CResult<()> {
        let store = self.class_of(class_id)?;
        let new = if new_handle.is_null() { None } else { store.node(new_handle) };
        for (index, prop) in store.descriptor.properties.iter().enumerate() {
            if !prop.prop_type.is_reference() || !prop.inverse_tracked {
                continue;
            }
            let Some(target_class) = prop.target_class else { continue };
            let old_target = old.and_then(|o| o.properties.get(index)).and_then(value_as_reference);
            let new_target = new.as_ref().and_then(|n| n.properties.get(index)).and_then(value_as_reference);
            if old_target == new_target {
                continue;
            }
            txn.inverse_ref_changes.push(InverseRefChange {
                source_class: class_id,
                source_id: object_id,
                source_property: prop.id,
                target_class,
                old_target,
                new_target,
            });
        }
        Ok(())
    }

    /// The inverse-ref entries `target_id` would have if every change this
    /// transaction has staged so far were already applied, without actually
    /// mutating the live store. Used so a later `delete` in the same
    /// transaction resolves cascades/`PreventDelete` correctly even when an
    /// earlier statement in that same transaction changed a reference to
    /// `target_id` (spec.md §4.2).
    fn effective_inverse_refs(&self, txn: &Transaction, target_class: ClassId, target_id: ObjectId) -> CResult<Vec<InverseRefEntry>> {
        let mut refs = self.store.inverse_refs(target_class, target_id)?;
        for change in &txn.inverse_ref_changes {
            if change.target_class != target_class {
                continue;
            }
            if change.old_target == Some(target_id) {
                refs.retain(|e| !(e.source_class == change.source_class && e.source_id == change.source_id && e.source_property == change.source_property));
            }
            if change.new_target == Some(target_id) {
                let already_present = refs
                    .iter()
                    .any(|e| e.source_class == change.source_class && e.source_id == change.source_id && e.source_property == change.source_property);
                if !already_present {
                    refs.push(InverseRefEntry {
                        source_class: change.source_class,
                        source_id: change.source_id,
                        source_property: change.source_property,
                        next: None,
                    });
                }
            }
        }
        Ok(refs)
    }

    fn require_read_write(&self, txn: &Transaction) -> CResult<()> {
        if txn.is_read_only() {
            return Err(Error::DatabaseBusy("read-only transaction cannot write".into()));
        }
        Ok(())
    }

    /// Runs the commit protocol (spec.md §4.5). Consumes the transaction;
    /// on `Conflict`/`UniqueConstraintViolation`/`ReferentialIntegrity` the
    /// transaction's writes are simply left unpublished (they become
    /// unreachable garbage, per §4.5 "Rollback").
    pub fn commit(&self, mut txn: Transaction) -> CResult<CommitVersion> {
        if txn.is_read_only() || txn.writes.is_empty() {
            return self.commit_empty(txn);
        }

        // Validate every write's observed predecessor is still current
        // before mutating anything (spec.md §4.2 "Conflict detection").
        for write in &txn.writes {
            let store = self.class_of(write.class_id)?;
            if store.head(write.object_id) != write.observed_head {
                return Err(Error::Conflict);
            }
        }

        self.validate_unique_indexes(&txn)?;

        // Apply this commit's staged inverse-ref changes for real now that
        // conflict detection and uniqueness validation have both passed
        // (spec.md §4.2: applied atomically under the target class's lock).
        for change in &txn.inverse_ref_changes {
            self.store.apply_inverse_ref_change(change)?;
        }

        let commit_version = self.version.advance();
        for write in &txn.writes {
            let store = self.class_of(write.class_id)?;
            store.with_node_mut(write.new_node, |n| n.version = commit_version);
            store.force_publish_head(write.object_id, write.new_node);
            self.maintain_indexes(write)?;
        }

        let mut affected: u64 = 0;
        for write in &txn.writes {
            let group = self.class_of(write.class_id)?.descriptor.log_group;
            affected |= 1 << group;
        }

        let mut writers: std::collections::HashMap<LogGroupId, ChangesetWriter> = std::collections::HashMap::new();
        for write in &txn.writes {
            let store = self.class_of(write.class_id)?;
            let group = store.descriptor.log_group;
            let node = store.node(write.new_node).expect("just-published node is present");
            let block_properties = block_properties_for(store);
            let row = row_from_node(store, &node, write.op);
            writers.entry(group).or_default().write_row(write.class_id, write.op, &block_properties, row);
        }

        let affected_groups: Vec<LogGroupId> = (0..64u8).filter(|g| affected & (1 << *g) != 0).collect();
        let barrier = CommitBarrier::new(affected_groups.len());
        for group in affected_groups {
            let blocks: Vec<Block> = writers.remove(&group).map(|w| w.finish()).unwrap_or_default();
            let bytes = crate::changeset::encode_changeset(&blocks);
            let lsn = self.lsn.advance(group);
            self.persister.append(group, commit_version, lsn, bytes, barrier.clone());
        }
        barrier.wait();

        txn.commit_version = Some(commit_version);
        txn.state = crate::txn::transaction::TransactionState::Committed;
        Ok(commit_version)
    }

    fn commit_empty(&self, mut txn: Transaction) -> CResult<CommitVersion> {
        let commit_version = if txn.is_read_only() {
            txn.read_version
        } else {
            self.version.advance()
        };
        if !txn.is_read_only() {
            // An empty write transaction is still durable and advances the
            // master group's LSN by one (spec.md §8 "Empty commit").
            let lsn = self.lsn.advance(crate::model::MASTER_LOG_GROUP);
            let barrier = CommitBarrier::new(1);
            self.persister.append(crate::model::MASTER_LOG_GROUP, commit_version, lsn, Vec::new(), barrier.clone());
            barrier.wait();
        }
        txn.commit_version = Some(commit_version);
        txn.state = crate::txn::transaction::TransactionState::Committed;
        Ok(commit_version)
    }

    fn validate_unique_indexes(&self, txn: &Transaction) -> CResult<()> {
        for write in &txn.writes {
            if write.op == OpType::Delete {
                continue;
            }
            let store = self.class_of(write.class_id)?;
            let node = store.node(write.new_node).expect("pending node is present");
            store.with_indexes(|indexes| -> CResult<()> {
                for (descriptor, index) in indexes {
                    if !descriptor.unique {
                        continue;
                    }
                    if let crate::index::Index::Hash(hash) = index {
                        let key = build_key(store, &node, descriptor);
                        if let Some(existing) = hash.find(&crate::index::IndexKey(key)) {
                            if existing != node.id {
                                return Err(Error::UniqueConstraintViolation {
                                    index: descriptor.name.clone(),
                                });
                            }
                        }
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn maintain_indexes(&self, write: &PendingWrite) -> CResult<()> {
        let store = self.class_of(write.class_id)?;
        let node = store.node(write.new_node);
        store.with_indexes(|indexes| {
            for (descriptor, index) in indexes {
                let key = node.as_ref().map(|n| build_key(store, n, descriptor));
                match index {
                    crate::index::Index::Hash(hash) => {
                        if write.op == OpType::Delete {
                            if let Some(key) = key {
                                hash.remove(&crate::index::IndexKey(key));
                            }
                        } else if let Some(key) = key {
                            hash.insert(crate::index::IndexKey(key), write.object_id);
                        }
                    }
                    crate::index::Index::Sorted(sorted) => {
                        if write.op == OpType::Delete {
                            if let Some(key) = key {
                                sorted.remove(&key, write.object_id);
                            }
                        } else if let Some(key) = key {
                            sorted.add(&key, write.object_id);
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

fn value_as_reference(value: &Value) -> Option<ObjectId> {
    match value {
        Value::Reference(v) => *v,
        _ => None,
    }
}

pub(crate) fn build_key(store: &ClassStore, node: &ObjectVersion, descriptor: &crate::model::IndexDescriptor) -> Vec<u8> {
    let property_ids: Vec<PropertyId> = match &descriptor.kind {
        crate::model::IndexKind::Hash { properties } => properties.clone(),
        crate::model::IndexKind::Sorted { properties, .. } => properties.iter().map(|p| p.property).collect(),
    };
    let mut parts = Vec::new();
    for property_id in property_ids {
        let Some(position) = store.descriptor.properties.iter().position(|p| p.id == property_id) else {
            continue;
        };
        let value = node.properties.get(position).cloned().unwrap_or(Value::Null);
        parts.push(resolve_value_bytes(store, &value));
    }
    crate::index::concat_key_parts(&parts)
}

fn resolve_value_bytes(store: &ClassStore, value: &Value) -> Vec<u8> {
    match value {
        Value::Byte(v) => vec![*v],
        Value::Short(v) => v.to_le_bytes().to_vec(),
        Value::Int(v) => v.to_le_bytes().to_vec(),
        Value::Long(v) => v.to_le_bytes().to_vec(),
        Value::Float(v) => v.to_le_bytes().to_vec(),
        Value::Double(v) => v.to_le_bytes().to_vec(),
        Value::Bool(v) => vec![*v as u8],
        Value::DateTime(v) => v.to_le_bytes().to_vec(),
        Value::String(handle) => store.strings.get(*handle).unwrap_or_default(),
        Value::Reference(Some(id)) => {
            let mut b = vec![1u8];
            b.extend_from_slice(&id.to_le_bytes());
            b
        }
        Value::Reference(None) | Value::Null => vec![0u8],
        other => format!("{other:?}").into_bytes(),
    }
}

pub(crate) fn block_properties_for(store: &ClassStore) -> Vec<BlockProperty> {
    store
        .descriptor
        .properties
        .iter()
        .map(|p| BlockProperty {
            property_id: p.id,
            prop_type: p.prop_type,
        })
        .collect()
}

pub(crate) fn row_from_node(store: &ClassStore, node: &ObjectVersion, _op: OpType) -> Row {
    let values = store
        .descriptor
        .properties
        .iter()
        .enumerate()
        .map(|(i, p)| field_value_from(store, node.properties.get(i), p.prop_type))
        .collect();
    Row {
        object_id: node.id,
        version: node.version,
        values,
    }
}

fn field_value_from(store: &ClassStore, value: Option<&Value>, prop_type: PropertyType) -> FieldValue {
    match (value, prop_type) {
        (Some(Value::Byte(v)), _) => FieldValue::Byte(*v),
        (Some(Value::Short(v)), _) => FieldValue::Short(*v),
        (Some(Value::Int(v)), _) => FieldValue::Int(*v),
        (Some(Value::Long(v)), _) => FieldValue::Long(*v),
        (Some(Value::Float(v)), _) => FieldValue::Float(*v),
        (Some(Value::Double(v)), _) => FieldValue::Double(*v),
        (Some(Value::Bool(v)), _) => FieldValue::Bool(*v),
        (Some(Value::DateTime(v)), _) => FieldValue::DateTime(*v),
        (Some(Value::String(h)), _) => FieldValue::String(store.strings.get(*h).map(|b| String::from_utf8_lossy(&b).into_owned())),
        (Some(Value::Reference(r)), _) => FieldValue::Reference(*r),
        (Some(Value::ReferenceArray(a)), _) => FieldValue::ReferenceArray(Some(a.clone())),
        (Some(Value::ByteArray(a)), _) => FieldValue::ByteArray(Some(a.clone())),
        (Some(Value::ShortArray(a)), _) => FieldValue::ShortArray(Some(a.clone())),
        (Some(Value::IntArray(a)), _) => FieldValue::IntArray(Some(a.clone())),
        (Some(Value::LongArray(a)), _) => FieldValue::LongArray(Some(a.clone())),
        (Some(Value::FloatArray(a)), _) => FieldValue::FloatArray(Some(a.clone())),
        (Some(Value::DoubleArray(a)), _) => FieldValue::DoubleArray(Some(a.clone())),
        (Some(Value::BoolArray(a)), _) => FieldValue::BoolArray(Some(a.clone())),
        (Some(Value::DateTimeArray(a)), _) => FieldValue::DateTimeArray(Some(a.clone())),
        (Some(Value::StringArray(handles)), _) => {
            let strings = handles.iter().filter_map(|h| store.strings.get(*h)).map(|b| String::from_utf8_lossy(&b).into_owned()).collect();
            FieldValue::StringArray(Some(strings))
        }
        (Some(Value::Null), _) | (None, _) => default_field_for(prop_type),
    }
}

/// Reverses `field_value_from`: interns string payloads into the class's
/// side store, for restore replay building version nodes from decoded
/// changeset rows.
pub(crate) fn value_from_field(store: &ClassStore, field: &FieldValue) -> Value {
    match field {
        FieldValue::Byte(v) => Value::Byte(*v),
        FieldValue::Short(v) => Value::Short(*v),
        FieldValue::Int(v) => Value::Int(*v),
        FieldValue::Long(v) => Value::Long(*v),
        FieldValue::Float(v) => Value::Float(*v),
        FieldValue::Double(v) => Value::Double(*v),
        FieldValue::Bool(v) => Value::Bool(*v),
        FieldValue::DateTime(v) => Value::DateTime(*v),
        FieldValue::String(s) => match s {
            Some(s) => Value::String(store.strings.intern(s.as_bytes())),
            None => Value::Null,
        },
        FieldValue::StringArray(a) => match a {
            Some(strings) => Value::StringArray(strings.iter().map(|s| store.strings.intern(s.as_bytes())).collect()),
            None => Value::Null,
        },
        FieldValue::Reference(r) => Value::Reference(*r),
        FieldValue::ReferenceArray(a) => a.clone().map(Value::ReferenceArray).unwrap_or(Value::Null),
        FieldValue::ByteArray(a) => a.clone().map(Value::ByteArray).unwrap_or(Value::Null),
        FieldValue::ShortArray(a) => a.clone().map(Value::ShortArray).unwrap_or(Value::Null),
        FieldValue::IntArray(a) => a.clone().map(Value::IntArray).unwrap_or(Value::Null),
        FieldValue::LongArray(a) => a.clone().map(Value::LongArray).unwrap_or(Value::Null),
        FieldValue::FloatArray(a) => a.clone().map(Value::FloatArray).unwrap_or(Value::Null),
        FieldValue::DoubleArray(a) => a.clone().map(Value::DoubleArray).unwrap_or(Value::Null),
        FieldValue::BoolArray(a) => a.clone().map(Value::BoolArray).unwrap_or(Value::Null),
        FieldValue::DateTimeArray(a) => a.clone().map(Value::DateTimeArray).unwrap_or(Value::Null),
    }
}

fn default_field_for(prop_type: PropertyType) -> FieldValue {
    match prop_type {
        PropertyType::Byte => FieldValue::Byte(0),
        PropertyType::Short => FieldValue::Short(0),
        PropertyType::Int => FieldValue::Int(0),
        PropertyType::Long => FieldValue::Long(0),
        PropertyType::Float => FieldValue::Float(0.0),
        PropertyType::Double => FieldValue::Double(0.0),
        PropertyType::Bool => FieldValue::Bool(false),
        PropertyType::DateTime => FieldValue::DateTime(0),
        PropertyType::String => FieldValue::String(None),
        PropertyType::ByteArray => FieldValue::ByteArray(None),
        PropertyType::ShortArray => FieldValue::ShortArray(None),
        PropertyType::IntArray => FieldValue::IntArray(None),
        PropertyType::LongArray => FieldValue::LongArray(None),
        PropertyType::FloatArray => FieldValue::FloatArray(None),
        PropertyType::DoubleArray => FieldValue::DoubleArray(None),
        PropertyType::BoolArray => FieldValue::BoolArray(None),
        PropertyType::DateTimeArray => FieldValue::DateTimeArray(None),
        PropertyType::StringArray => FieldValue::StringArray(None),
        PropertyType::Reference => FieldValue::Reference(None),
        PropertyType::ReferenceArray => FieldValue::ReferenceArray(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassDescriptor, PropertyDescriptor, MASTER_LOG_GROUP};

    fn class(id: ClassId) -> ClassDescriptor {
        ClassDescriptor {
            id,
            name: format!("C{id}"),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![PropertyDescriptor {
                id: 0,
                name: "v".into(),
                prop_type: PropertyType::Int,
                target_class: None,
                delete_action: None,
                inverse_tracked: false,
            }],
        }
    }

    fn manager() -> TransactionManager {
        let mut store = ObjectStore::new();
        store.register_class(class(1)).unwrap();
        TransactionManager::new(store, 0, 1, Arc::new(SynchronousPersister))
    }

    #[test]
    fn mvcc_visibility_scenario() {
        let mgr = manager();
        let mut t1 = mgr.begin(TransactionType::ReadWrite);
        let id = mgr.create(&mut t1, 1, vec![Value::Int(1)]).unwrap();
        let c1 = mgr.commit(t1).unwrap();

        let t3 = mgr.begin(TransactionType::Read);
        assert!(t3.read_version >= c1);
        let visible = mgr.read(&t3, 1, id).unwrap().unwrap();
        assert_eq!(visible.properties[0], Value::Int(1));
    }

    #[test]
    fn write_write_conflict_scenario() {
        let mgr = manager();
        let mut setup = mgr.begin(TransactionType::ReadWrite);
        let id = mgr.create(&mut setup, 1, vec![Value::Int(1)]).unwrap();
        mgr.commit(setup).unwrap();

        let mut t1 = mgr.begin(TransactionType::ReadWrite);
        let mut t2 = mgr.begin(TransactionType::ReadWrite);
        mgr.update(&mut t1, 1, id, |p| p[0] = Value::Int(2)).unwrap();
        mgr.update(&mut t2, 1, id, |p| p[0] = Value::Int(3)).unwrap();
        assert!(mgr.commit(t1).is_ok());
        assert!(matches!(mgr.commit(t2), Err(Error::Conflict)));
    }

    #[test]
    fn empty_commit_advances_version() {
        let mgr = manager();
        let before = mgr.current_version();
        let txn = mgr.begin(TransactionType::ReadWrite);
        let commit_version = mgr.commit(txn).unwrap();
        assert_eq!(commit_version, before + 1);
    }

    fn class_with_ref(id: ClassId, target_class: ClassId, delete_action: DeleteAction) -> ClassDescriptor {
        ClassDescriptor {
            id,
            name: format!("C{id}"),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![PropertyDescriptor {
                id: 0,
                name: "target".into(),
                prop_type: PropertyType::Reference,
                target_class: Some(target_class),
                delete_action: Some(delete_action),
                inverse_tracked: true,
            }],
        }
    }

    fn manager_with_ref(delete_action: DeleteAction) -> TransactionManager {
        let mut store = ObjectStore::new();
        store.register_class(class(1)).unwrap();
        store.register_class(class_with_ref(2, 1, delete_action)).unwrap();
        TransactionManager::new(store, 0, 1, Arc::new(SynchronousPersister))
    }

    /// A transaction that stages an inverse-ref change but then loses a
    /// write-write conflict at commit must leave the target's inverse-ref
    /// list untouched: staged changes are never applied outside `commit`.
    #[test]
    fn aborted_commit_never_applies_staged_inverse_ref_changes() {
        let mgr = manager_with_ref(DeleteAction::SetToNull);
        let mut setup = mgr.begin(TransactionType::ReadWrite);
        let target = mgr.create(&mut setup, 1, vec![Value::Int(1)]).unwrap();
        mgr.commit(setup).unwrap();

        let mut loser = mgr.begin(TransactionType::ReadWrite);
        let winner_source = {
            let mut winner = mgr.begin(TransactionType::ReadWrite);
            let source = mgr.create(&mut winner, 2, vec![Value::Reference(Some(target))]).unwrap();
            mgr.commit(winner).unwrap();
            source
        };

        // `loser` also creates a referencing object against the same
        // target, staging an InverseRefChange, but then conflicts at
        // commit because it raced the winner's write above in a shared
        // object it also touched.
        let racing_target_write = mgr.update(&mut loser, 1, target, |p| p[0] = Value::Int(99));
        assert!(racing_target_write.is_ok());
        let _loser_source = mgr.create(&mut loser, 2, vec![Value::Reference(Some(target))]).unwrap();
        assert!(!loser.inverse_ref_changes.is_empty());

        // Force a conflict: another committed write to `target` after
        // `loser` observed its head.
        let mut interloper = mgr.begin(TransactionType::ReadWrite);
        mgr.update(&mut interloper, 1, target, |p| p[0] = Value::Int(7)).unwrap();
        mgr.commit(interloper).unwrap();

        assert!(matches!(mgr.commit(loser), Err(Error::Conflict)));

        let refs = mgr.store.inverse_refs(1, target).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].source_id, winner_source);
    }

    /// Within a single transaction, a delete that follows an earlier
    /// create of a PreventDelete-guarded reference must see that reference
    /// even though the earlier create's InverseRefChange hasn't been
    /// applied to the live store yet.
    #[test]
    fn delete_sees_same_transaction_staged_prevent_delete_reference() {
        let mgr = manager_with_ref(DeleteAction::PreventDelete);
        let mut setup = mgr.begin(TransactionType::ReadWrite);
        let target = mgr.create(&mut setup, 1, vec![Value::Int(1)]).unwrap();
        mgr.commit(setup).unwrap();

        let mut txn = mgr.begin(TransactionType::ReadWrite);
        mgr.create(&mut txn, 2, vec![Value::Reference(Some(target))]).unwrap();
        let result = mgr.delete(&mut txn, 1, target);
        assert!(matches!(result, Err(Error::ReferentialIntegrity(_))));
    }
}
