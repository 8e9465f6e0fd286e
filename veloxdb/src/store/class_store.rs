//! Per-class storage: a primary object map, the object-version arena, and
//! the string/blob side store, per spec.md §4.2 "Object store".
//!
//! The primary map is guarded by a `CpuRwLock` (spec.md §5: "class primary
//! maps use CPU-partitioned RW locks") since reads (scans, point lookups)
//! vastly outnumber the writes that replace a head pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::concurrency::CpuRwLock;
use crate::error::{CResult, Error};
use crate::index::Index;
use crate::model::{ClassDescriptor, IndexDescriptor};
use crate::store::arena::{Arena, Handle};
use crate::store::object::{ObjectId, ObjectVersion, SideStore};

pub struct ClassStore {
    pub descriptor: ClassDescriptor,
    nodes: Arena<ObjectVersion>,
    primary: CpuRwLock<HashMap<ObjectId, Handle>>,
    pub strings: SideStore,
    pub blobs: SideStore,
    inverse_refs_arena: Arena<crate::store::object::InverseRefEntry>,
    next_object_id: AtomicU64,
    indexes: Mutex<Vec<(IndexDescriptor, Index)>>,
}

impl ClassStore {
    pub fn new(descriptor: ClassDescriptor) -> Self {
        ClassStore {
            descriptor,
            nodes: Arena::new(),
            primary: CpuRwLock::new(HashMap::new()),
            strings: SideStore::new(),
            blobs: SideStore::new(),
            inverse_refs_arena: Arena::new(),
            next_object_id: AtomicU64::new(1),
            indexes: Mutex::new(Vec::new()),
        }
    }

    pub fn add_index(&self, descriptor: IndexDescriptor) {
        let index = Index::build(&descriptor);
        self.indexes.lock().unwrap().push((descriptor, index));
    }

    pub fn with_indexes<R>(&self, f: impl FnOnce(&[(IndexDescriptor, Index)]) -> R) -> R {
        let indexes = self.indexes.lock().unwrap();
        f(&indexes)
    }

    pub fn allocate_object_id(&self) -> ObjectId {
        self.next_object_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Pushes a new (not-yet-linked) version node into the arena without
    /// publishing it to the primary map. Used for the pending node of a
    /// create/update/delete within an in-flight transaction.
    pub fn push_node(&self, node: ObjectVersion) -> Handle {
        self.nodes.insert(node)
    }

    pub fn node(&self, handle: Handle) -> Option<ObjectVersion> {
        self.nodes.with(handle, |n| n.clone())
    }

    pub fn with_node_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut ObjectVersion) -> R) -> Option<R> {
        self.nodes.with_mut(handle, f)
    }

    pub fn head(&self, id: ObjectId) -> Option<Handle> {
        self.primary.read().get(&id).copied()
    }

    /// Returns the clone of the newest version visible at `read_version`,
    /// walking the chain backward (spec.md §8 universal invariant).
    pub fn get_visible(&self, id: ObjectId, read_version: u64) -> Option<ObjectVersion> {
        let mut cursor = self.head(id)?;
        loop {
            let node = self.nodes.with(cursor, |n| n.clone())?;
            if node.is_visible_at(read_version) {
                return if node.tombstone { None } else { Some(node) };
            }
            cursor = node.prev?;
        }
    }

    /// Publishes `new_head` as the object's current head, validating that
    /// the writer's observed predecessor is still the current head
    /// (spec.md §4.2 "Conflict detection"). `observed` is `None` for a
    /// fresh create.
    pub fn publish_head(&self, id: ObjectId, observed: Option<Handle>, new_head: Handle) -> CResult<()> {
        let mut primary = self.primary.write();
        let current = primary.get(&id).copied();
        if current != observed {
            return Err(Error::Conflict);
        }
        primary.insert(id, new_head);
        Ok(())
    }

    /// Publishes `new_head` unconditionally, bypassing the conflict check.
    /// Used by the transaction manager once it has already validated every
    /// write in a commit against the heads it observed.
    pub fn force_publish_head(&self, id: ObjectId, new_head: Handle) {
        self.primary.write().insert(id, new_head);
    }

    /// Object ids currently present in the primary map, partitioned into
    /// roughly equal chunks for parallel scanning (spec.md §4.2 "Scans").
    pub fn scan_chunks(&self, chunk_size: usize) -> Vec<Vec<ObjectId>> {
        let ids: Vec<ObjectId> = self.primary.read().keys().copied().collect();
        let chunk_size = chunk_size.max(1);
        ids.chunks(chunk_size).map(|c| c.to_vec()).collect()
    }

    pub fn object_count(&self) -> usize {
        self.primary.read().len()
    }

    pub fn inverse_refs(&self) -> &Arena<crate::store::object::InverseRefEntry> {
        &self.inverse_refs_arena
    }

    /// Holds this class's primary-map lock exclusively for the duration of
    /// `f`. The transaction manager uses this to apply a commit's batch of
    /// inverse-ref changes atomically (spec.md §4.2: "applied atomically
    /// against the target objects' inverse-ref lists under their per-class
    /// locks").
    pub fn with_inverse_ref_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.primary.write();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassDescriptor, MASTER_LOG_GROUP};
    use crate::store::object::{ObjectVersion, Value};

    fn descriptor() -> ClassDescriptor {
        ClassDescriptor {
            id: 1,
            name: "A".into(),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![],
        }
    }

    #[test]
    fn publish_then_read_visible() {
        let store = ClassStore::new(descriptor());
        let id = store.allocate_object_id();
        let handle = store.push_node(ObjectVersion {
            id,
            version: 5,
            prev: None,
            tombstone: false,
            properties: vec![Value::Int(1)],
            inverse_refs_head: None,
        });
        store.publish_head(id, None, handle).unwrap();
        let visible = store.get_visible(id, 10).unwrap();
        assert_eq!(visible.properties[0], Value::Int(1));
        assert!(store.get_visible(id, 4).is_none());
    }

    #[test]
    fn publish_conflict_on_stale_observed() {
        let store = ClassStore::new(descriptor());
        let id = store.allocate_object_id();
        let h1 = store.push_node(ObjectVersion {
            id,
            version: 1,
            prev: None,
            tombstone: false,
            properties: vec![],
            inverse_refs_head: None,
        });
        store.publish_head(id, None, h1).unwrap();

        let h2 = store.push_node(ObjectVersion {
            id,
            version: 2,
            prev: Some(h1),
            tombstone: false,
            properties: vec![],
            inverse_refs_head: None,
        });
        // Simulate a stale observer: claims the predecessor was None.
        assert!(matches!(store.publish_head(id, None, h2), Err(Error::Conflict)));
    }
}
