//! Snapshot file reader/writer, per spec.md §4.8 and the byte layout in §6.
//!
//! A snapshot captures all live objects per class at a given commit version.
//! Each class's rows are encoded with the same `Block`/`Row` codec used for
//! changesets (an Insert block), length-prefixed so the reader can stop at
//! a class boundary without parsing every row first.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::changeset::{decode_changeset, encode_changeset, Block, OpType};
use crate::error::{CResult, Error};
use crate::model::LogGroupId;
use crate::store::object::CommitVersion;
use crate::store::ObjectStore;
use crate::txn::manager::{block_properties_for, row_from_node};

const SNAPSHOT_FORMAT_VERSION: u16 = 1;

pub struct SnapshotContents {
    pub version: CommitVersion,
    pub blocks: Vec<Block>,
}

/// Writes a snapshot of every live object in classes assigned to `group`,
/// visible at `version` (spec.md §4.8 "writer path"). Each log group's
/// snapshot only ever needs to cover its own classes, since restoration
/// replays each group independently.
pub fn write_snapshot(store: &ObjectStore, group: LogGroupId, version: CommitVersion, path: &Path) -> CResult<()> {
    let mut out = Vec::new();
    out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());

    let classes: Vec<_> = store.classes().filter(|c| c.descriptor.log_group == group).collect();
    out.extend_from_slice(&(classes.len() as u32).to_le_bytes());
    for class_store in classes {
        let ids: Vec<_> = class_store.scan_chunks(usize::MAX).into_iter().flatten().collect();
        let mut rows = Vec::new();
        for id in ids {
            if let Some(node) = class_store.get_visible(id, version) {
                rows.push(row_from_node(class_store, &node, OpType::Insert));
            }
        }
        let block = Block {
            class_id: class_store.descriptor.id,
            op_type: OpType::Insert,
            properties: block_properties_for(class_store),
            rows,
        };
        let block_bytes = encode_changeset(std::slice::from_ref(&block));
        out.extend_from_slice(&(block_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&block_bytes);
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, &out)?;
    Ok(())
}

/// Reads a snapshot back into its per-class Insert blocks, for the restorer
/// to dispatch to restore workers (spec.md §4.8 "reader path").
pub fn read_snapshot(path: &Path) -> CResult<SnapshotContents> {
    let buf = std::fs::read(path)?;
    let mut offset = 0usize;
    let need = |offset: usize, n: usize| -> CResult<()> {
        if offset + n > buf.len() {
            Err(Error::Corruption("snapshot file truncated".into()))
        } else {
            Ok(())
        }
    };

    need(offset, 2)?;
    let format_version = LittleEndian::read_u16(&buf[offset..offset + 2]);
    offset += 2;
    if format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::UnsupportedFormat {
            found: format_version as u64,
            max: SNAPSHOT_FORMAT_VERSION as u64,
        });
    }

    need(offset, 8)?;
    let version = LittleEndian::read_u64(&buf[offset..offset + 8]);
    offset += 8;

    need(offset, 4)?;
    let class_count = LittleEndian::read_u32(&buf[offset..offset + 4]);
    offset += 4;

    let mut blocks = Vec::with_capacity(class_count as usize);
    for _ in 0..class_count {
        need(offset, 8)?;
        let len = LittleEndian::read_u64(&buf[offset..offset + 8]) as usize;
        offset += 8;
        need(offset, len)?;
        let mut class_blocks = decode_changeset(&buf[offset..offset + len])
            .map_err(|_| Error::Corruption("snapshot class block malformed".into()))?;
        offset += len;
        blocks.append(&mut class_blocks);
    }

    Ok(SnapshotContents { version, blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassDescriptor, PropertyDescriptor, PropertyType, MASTER_LOG_GROUP};
    use crate::store::object::Value;
    use crate::txn::manager::{SynchronousPersister, TransactionManager};
    use crate::txn::transaction::TransactionType;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn round_trips_live_objects() {
        let mut store = ObjectStore::new();
        store
            .register_class(ClassDescriptor {
                id: 1,
                name: "A".into(),
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
            })
            .unwrap();
        let manager = TransactionManager::new(store, 0, 1, Arc::new(SynchronousPersister));
        let mut txn = manager.begin(TransactionType::ReadWrite);
        manager.create(&mut txn, 1, vec![Value::Int(7)]).unwrap();
        let version = manager.commit(txn).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("master_0.vxs");
        write_snapshot(&manager.store, MASTER_LOG_GROUP, version, &path).unwrap();

        let contents = read_snapshot(&path).unwrap();
        assert_eq!(contents.version, version);
        assert_eq!(contents.blocks.len(), 1);
        assert_eq!(contents.blocks[0].rows.len(), 1);
    }
}
