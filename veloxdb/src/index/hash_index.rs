//! Open-addressed hash index over one to four properties, per spec.md
//! §4.3: power-of-two capacity, load factor 0.7, linear probing with
//! tombstones for deletion.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::concurrency::RwLock;
use crate::error::{CResult, Error};
use crate::store::object::ObjectId;

const MAX_LOAD_FACTOR_NUM: usize = 7;
const MAX_LOAD_FACTOR_DEN: usize = 10;

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct IndexKey(pub Vec<u8>);

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(IndexKey, ObjectId),
}

struct Table {
    slots: Vec<Slot>,
    occupied: usize,
    tombstones: usize,
}

impl Table {
    fn with_capacity(capacity: usize) -> Self {
        Table {
            slots: vec![Slot::Empty; capacity.next_power_of_two().max(8)],
            occupied: 0,
            tombstones: 0,
        }
    }
}

impl Clone for Slot {
    fn clone(&self) -> Self {
        match self {
            Slot::Empty => Slot::Empty,
            Slot::Tombstone => Slot::Tombstone,
            Slot::Occupied(k, id) => Slot::Occupied(k.clone(), *id),
        }
    }
}

fn hash_key(key: &IndexKey) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// A hash index over a class's objects. `unique` classes reject a second
/// live insert under the same key (enforced by the transaction manager at
/// commit via `insert_unique`).
pub struct HashIndex {
    pub name: String,
    pub unique: bool,
    table: RwLock<Table>,
    len: AtomicUsize,
}

impl HashIndex {
    pub fn new(name: impl Into<String>, unique: bool) -> Self {
        HashIndex {
            name: name.into(),
            unique,
            table: RwLock::new(Table::with_capacity(16)),
            len: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, key: &IndexKey) -> Option<ObjectId> {
        let table = self.table.read();
        find_in_table(&table, key)
    }

    /// Unconditional insert (non-unique indexes, or restoration replay).
    pub fn insert(&self, key: IndexKey, id: ObjectId) {
        let mut table = self.table.write();
        maybe_grow(&mut table);
        insert_into_table(&mut table, key, id);
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Conditional insert used when `unique` is set: fails with
    /// `UniqueConstraintViolation` if a live entry already holds this key
    /// (spec.md §4.3 "conditional insert").
    pub fn insert_unique(&self, key: IndexKey, id: ObjectId) -> CResult<()> {
        let mut table = self.table.write();
        if find_in_table(&table, &key).is_some() {
            return Err(Error::UniqueConstraintViolation {
                index: self.name.clone(),
            });
        }
        maybe_grow(&mut table);
        insert_into_table(&mut table, key, id);
        drop(table);
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn remove(&self, key: &IndexKey) -> bool {
        let mut table = self.table.write();
        let cap = table.slots.len();
        let mut index = (hash_key(key) as usize) & (cap - 1);
        for _ in 0..cap {
            match &table.slots[index] {
                Slot::Empty => return false,
                Slot::Occupied(k, _) if k == key => {
                    table.slots[index] = Slot::Tombstone;
                    table.occupied -= 1;
                    table.tombstones += 1;
                    drop(table);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return true;
                }
                _ => {}
            }
            index = (index + 1) & (cap - 1);
        }
        false
    }
}

fn find_in_table(table: &Table, key: &IndexKey) -> Option<ObjectId> {
    let cap = table.slots.len();
    let mut index = (hash_key(key) as usize) & (cap - 1);
    for _ in 0..cap {
        match &table.slots[index] {
            Slot::Empty => return None,
            Slot::Occupied(k, id) if k == key => return Some(*id),
            _ => {}
        }
        index = (index + 1) & (cap - 1);
    }
    None
}

fn insert_into_table(table: &mut Table, key: IndexKey, id: ObjectId) {
    let cap = table.slots.len();
    let mut index = (hash_key(&key) as usize) & (cap - 1);
    loop {
        match &table.slots[index] {
            Slot::Empty | Slot::Tombstone => {
                let was_tombstone = matches!(table.slots[index], Slot::Tombstone);
                table.slots[index] = Slot::Occupied(key, id);
                table.occupied += 1;
                if was_tombstone {
                    table.tombstones -= 1;
                }
                return;
            }
            Slot::Occupied(k, _) if *k == key => {
                table.slots[index] = Slot::Occupied(key, id);
                return;
            }
            _ => {}
        }
        index = (index + 1) & (cap - 1);
    }
}

fn maybe_grow(table: &mut Table) {
    let used = table.occupied + table.tombstones;
    if used * MAX_LOAD_FACTOR_DEN < table.slots.len() * MAX_LOAD_FACTOR_NUM {
        return;
    }
    let new_capacity = (table.slots.len() * 2).max(16);
    let mut new_table = Table::with_capacity(new_capacity);
    for slot in table.slots.drain(..) {
        if let Slot::Occupied(k, id) = slot {
            insert_into_table(&mut new_table, k, id);
        }
    }
    *table = new_table;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> IndexKey {
        IndexKey(n.to_le_bytes().to_vec())
    }

    #[test]
    fn insert_and_find() {
        let idx = HashIndex::new("by_n", false);
        idx.insert(key(1), 100);
        idx.insert(key(2), 200);
        assert_eq!(idx.find(&key(1)), Some(100));
        assert_eq!(idx.find(&key(2)), Some(200));
        assert_eq!(idx.find(&key(3)), None);
    }

    #[test]
    fn unique_insert_rejects_duplicate() {
        let idx = HashIndex::new("by_n", true);
        idx.insert_unique(key(1), 100).unwrap();
        assert!(matches!(
            idx.insert_unique(key(1), 200),
            Err(Error::UniqueConstraintViolation { .. })
        ));
    }

    #[test]
    fn remove_then_reinsert() {
        let idx = HashIndex::new("by_n", false);
        idx.insert(key(1), 100);
        assert!(idx.remove(&key(1)));
        assert_eq!(idx.find(&key(1)), None);
        idx.insert(key(1), 200);
        assert_eq!(idx.find(&key(1)), Some(200));
    }

    #[test]
    fn grows_past_load_factor() {
        let idx = HashIndex::new("by_n", false);
        for i in 0..100 {
            idx.insert(key(i), i as u64);
        }
        assert_eq!(idx.len(), 100);
        for i in 0..100 {
            assert_eq!(idx.find(&key(i)), Some(i as u64));
        }
    }
}
