//! In-memory object records and their version chains, per spec.md §3.
//!
//! Each class keeps a primary map from object id to the head of a singly
//! linked, newest-first version chain. A version is visible to a reader at
//! read-version `R` iff `commit_version <= R` and no newer version with
//! `commit_version <= R` exists in the chain.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::model::PropertyId;
use crate::store::arena::Handle;

pub type ObjectId = u64;
pub type CommitVersion = u64;

/// A version not yet finalized at commit; `write_path` publishes a pending
/// node with this sentinel, then rewrites it in place once the commit
/// version is assigned (spec.md §4.2 "write path").
pub const PENDING_VERSION: CommitVersion = u64::MAX;

/// A single property's value, tagged the same way as `PropertyType`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    DateTime(i64),
    /// Handle into the class store's string side-store.
    String(Handle),
    ByteArray(Vec<u8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    BoolArray(Vec<bool>),
    DateTimeArray(Vec<i64>),
    /// Handles into the class store's string side-store, one per element.
    StringArray(Vec<Handle>),
    Reference(Option<ObjectId>),
    ReferenceArray(Vec<ObjectId>),
    Null,
}

/// One version of one object: the payload plus version-chain linkage.
#[derive(Clone, Debug)]
pub struct ObjectVersion {
    pub id: ObjectId,
    pub version: CommitVersion,
    pub prev: Option<Handle>,
    pub tombstone: bool,
    /// Values in the class's declared property order.
    pub properties: Vec<Value>,
    pub inverse_refs_head: Option<Handle>,
}

impl ObjectVersion {
    pub fn property(&self, properties_index: usize) -> Option<&Value> {
        self.properties.get(properties_index)
    }

    pub fn is_visible_at(&self, read_version: CommitVersion) -> bool {
        self.version != PENDING_VERSION && self.version <= read_version
    }
}

/// One entry in a target object's inverse-reference list: identifies a
/// (source class, source object, property) edge pointing at it (spec.md §3
/// "Inverse-reference entity").
#[derive(Clone, Debug)]
pub struct InverseRefEntry {
    pub source_class: crate::model::ClassId,
    pub source_id: ObjectId,
    pub source_property: PropertyId,
    pub next: Option<Handle>,
}

/// A ref-counted string/blob side store entry; a handle stays valid as long
/// as any reachable version still references it (spec.md §3, §8 invariant
/// "refcount(H) >= 1").
struct SideEntry {
    bytes: Vec<u8>,
    refcount: AtomicI64,
}

/// Side store for variable-length string and blob payloads, shared across
/// all versions of a class's objects.
pub struct SideStore {
    arena: super::arena::Arena<SideEntry>,
    dedupe: Mutex<std::collections::HashMap<Vec<u8>, Handle>>,
}

impl SideStore {
    pub fn new() -> Self {
        SideStore {
            arena: super::arena::Arena::new(),
            dedupe: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Interns `bytes`, incrementing the refcount of an existing entry with
    /// identical content rather than duplicating storage.
    pub fn intern(&self, bytes: &[u8]) -> Handle {
        let mut dedupe = self.dedupe.lock().unwrap();
        if let Some(&handle) = dedupe.get(bytes) {
            self.arena.with(handle, |e| e.refcount.fetch_add(1, Ordering::AcqRel));
            return handle;
        }
        let handle = self.arena.insert(SideEntry {
            bytes: bytes.to_vec(),
            refcount: AtomicI64::new(1),
        });
        dedupe.insert(bytes.to_vec(), handle);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<Vec<u8>> {
        self.arena.with(handle, |e| e.bytes.clone())
    }

    pub fn incref(&self, handle: Handle) {
        self.arena.with(handle, |e| e.refcount.fetch_add(1, Ordering::AcqRel));
    }

    /// Decrements the refcount, freeing the entry (and its dedupe mapping)
    /// once it reaches zero.
    pub fn decref(&self, handle: Handle) {
        let freed = self.arena.with(handle, |e| {
            e.refcount.fetch_sub(1, Ordering::AcqRel) == 1
        });
        if freed == Some(true) {
            if let Some(bytes) = self.arena.with(handle, |e| e.bytes.clone()) {
                self.dedupe.lock().unwrap().remove(&bytes);
            }
            self.arena.remove(handle);
        }
    }

    pub fn refcount(&self, handle: Handle) -> i64 {
        self.arena
            .with(handle, |e| e.refcount.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

impl Default for SideStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedupes_identical_bytes() {
        let store = SideStore::new();
        let h1 = store.intern(b"hello");
        let h2 = store.intern(b"hello");
        assert_eq!(h1, h2);
        assert_eq!(store.refcount(h1), 2);
    }

    #[test]
    fn decref_to_zero_frees_entry() {
        let store = SideStore::new();
        let h = store.intern(b"hello");
        store.decref(h);
        assert_eq!(store.get(h), None);
    }
}
