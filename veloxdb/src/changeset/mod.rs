//! The changeset protocol: a compact binary format encoding transactional
//! mutations, used as the unit of both durability and replication
//! (spec.md §4.4).

pub mod block;
pub mod codec;

pub use block::{Block, BlockProperty, FieldValue, OpType, Row};
pub use codec::{decode_changeset, encode_changeset, ChangesetReader, ChangesetWriter};
