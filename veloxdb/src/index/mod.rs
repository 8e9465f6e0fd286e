//! Hash and sorted index structures over class properties, per spec.md
//! §4.3, and the encoding of an index key from property values.

pub mod hash_index;
pub mod sorted_index;

use crate::model::{IndexDescriptor, IndexKind};

pub use hash_index::{HashIndex, IndexKey};
pub use sorted_index::SortedIndex;

/// A runtime index instance built from an `IndexDescriptor`.
pub enum Index {
    Hash(HashIndex),
    Sorted(SortedIndex),
}

impl Index {
    pub fn build(descriptor: &IndexDescriptor) -> Self {
        match &descriptor.kind {
            IndexKind::Hash { .. } => Index::Hash(HashIndex::new(&descriptor.name, descriptor.unique)),
            IndexKind::Sorted { case_sensitivity, .. } => {
                Index::Sorted(SortedIndex::with_case_sensitivity(
                    &descriptor.name,
                    descriptor.unique,
                    *case_sensitivity,
                ))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Index::Hash(h) => &h.name,
            Index::Sorted(s) => &s.name,
        }
    }

    pub fn is_unique(&self) -> bool {
        match self {
            Index::Hash(h) => h.unique,
            Index::Sorted(s) => s.unique,
        }
    }
}

/// Concatenates per-property key fragments (each already length-prefixed by
/// the caller when variable-width) into one index key. Callers resolve
/// `Value::String`/array side-store handles to raw bytes themselves, since
/// that resolution needs the owning class store.
pub fn concat_key_parts(parts: &[Vec<u8>]) -> Vec<u8> {
    parts.concat()
}
