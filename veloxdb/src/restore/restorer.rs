//! Top-level database restorer, per spec.md §4.9.
//!
//! For each log group: pick the newer of its two files by timestamp, decide
//! whether its own snapshot is usable or the older file's snapshot plus
//! both logs must be replayed, then hand every row to the worker pool in
//! commit-version order. Transactions whose `AffectedLogGroups` bitmask
//! names a group that never recorded a matching commit version are treated
//! as not durably committed and are dropped from every group they touched.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::changeset::{decode_changeset, OpType};
use crate::error::CResult;
use crate::index::{Index, IndexKey};
use crate::model::LogGroupId;
use crate::store::object::{CommitVersion, Value};
use crate::store::ObjectStore;
use crate::txn::manager::build_key;
use crate::wal::file::{FileHeader, LogItem, HEADER_PAD};
use crate::wal::snapshot::{read_snapshot, SnapshotContents};
use crate::wal::writer::{log_path, read_file_items, snapshot_path};

use super::worker::{apply_row, ApplyJob, RestoreWorkerPool};

struct GroupPlan {
    group: LogGroupId,
    snapshot: Option<SnapshotContents>,
    items: Vec<LogItem>,
}

fn read_header_if_exists(path: &Path) -> CResult<Option<FileHeader>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; HEADER_PAD];
    file.read_exact(&mut buf)?;
    Ok(Some(FileHeader::decode(&buf)?))
}

fn plan_group(dir: &Path, name: &str, group: LogGroupId) -> CResult<Option<GroupPlan>> {
    let path0 = log_path(dir, name, 0);
    let path1 = log_path(dir, name, 1);
    let h0 = read_header_if_exists(&path0)?;
    let h1 = read_header_if_exists(&path1)?;

    let (newer_index, newer_header, older_index, older_header) = match (h0, h1) {
        (None, None) => return Ok(None),
        (Some(h0), None) => (0u8, h0, 1u8, None),
        (None, Some(h1)) => (1u8, h1, 0u8, None),
        (Some(h0), Some(h1)) => {
            if h1.timestamp >= h0.timestamp {
                (1u8, h1, 0u8, Some(h0))
            } else {
                (0u8, h0, 1u8, Some(h1))
            }
        }
    };

    if newer_header.has_snapshot {
        let snap_path = snapshot_path(dir, name, newer_index);
        let snapshot = if snap_path.exists() { Some(read_snapshot(&snap_path)?) } else { None };
        let items = read_file_items(&log_path(dir, name, newer_index))?;
        return Ok(Some(GroupPlan { group, snapshot, items }));
    }

    // The active file never completed a rotation's snapshot step: recover
    // from the older file's snapshot, then replay both logs in file order
    // (spec.md §4.9 step 4).
    let mut items = Vec::new();
    let mut snapshot = None;
    if older_header.is_some() {
        let older_snap_path = snapshot_path(dir, name, older_index);
        if older_snap_path.exists() {
            snapshot = Some(read_snapshot(&older_snap_path)?);
        }
        items.extend(read_file_items(&log_path(dir, name, older_index))?);
    }
    items.extend(read_file_items(&log_path(dir, name, newer_index))?);
    Ok(Some(GroupPlan { group, snapshot, items }))
}

/// Runs the restoration algorithm and hands `store` (with its classes
/// already registered by the caller) back populated, along with the
/// highest commit version observed.
pub fn restore(store: ObjectStore, log_dir: &Path, groups: &[LogGroupId], worker_count: usize) -> CResult<(ObjectStore, CommitVersion)> {
    let mut plans = Vec::new();
    for &group in groups {
        let name = format!("group_{group}");
        if let Some(plan) = plan_group(log_dir, &name, group)? {
            plans.push(plan);
        }
    }
    log::debug!("restore: {} of {} log groups have on-disk state", plans.len(), groups.len());

    let store = Arc::new(store);
    let mut highest_version: CommitVersion = 0;

    for plan in &plans {
        if let Some(snapshot) = &plan.snapshot {
            highest_version = highest_version.max(snapshot.version);
            log::debug!("restore: group {} applying snapshot at version {}", plan.group, snapshot.version);
            for block in &snapshot.blocks {
                for row in &block.rows {
                    apply_row(&store, block.class_id, OpType::Insert, &block.properties, row);
                }
            }
        }
    }

    // `(affected_log_groups bitmask, groups that recorded this commit version)`.
    let mut seen_by_version: HashMap<CommitVersion, (u64, HashSet<LogGroupId>)> = HashMap::new();
    // The LSN each commit version was recorded at, per group it reached.
    // Needed below to compute the stopping LSN for any transaction still
    // split at end of recovery (spec.md §4.9 step 6).
    let mut lsn_by_version_group: HashMap<(CommitVersion, LogGroupId), u64> = HashMap::new();
    for plan in &plans {
        for item in &plan.items {
            let entry = seen_by_version
                .entry(item.commit_version)
                .or_insert((item.affected_log_groups as u64, HashSet::new()));
            entry.1.insert(plan.group);
            lsn_by_version_group.insert((item.commit_version, plan.group), item.lsn);
        }
    }
    let is_complete = |cv: CommitVersion| -> bool {
        match seen_by_version.get(&cv) {
            None => false,
            Some((mask, seen)) => (0..64u8).all(|g| mask & (1 << g) == 0 || seen.contains(&g)),
        }
    };

    // Any commit version still incomplete here spans a transaction that
    // never finished reaching every log group it affected (a split
    // transaction). Its stopping LSN, per group it did reach, is the
    // lowest LSN at which it appears; nothing at or past that LSN in that
    // group is trusted, even an entry that is independently "complete" on
    // its own, since the log past a torn write can't be relied on.
    let mut stopping_lsn: HashMap<LogGroupId, u64> = HashMap::new();
    for (&cv, (_, seen)) in &seen_by_version {
        if is_complete(cv) {
            continue;
        }
        for &group in seen {
            if let Some(&lsn) = lsn_by_version_group.get(&(cv, group)) {
                stopping_lsn
                    .entry(group)
                    .and_modify(|s| *s = (*s).min(lsn))
                    .or_insert(lsn);
            }
        }
    }
    if !stopping_lsn.is_empty() {
        log::warn!("split transaction(s) detected at recovery, capping replay at: {stopping_lsn:?}");
    }

    let mut all_items: Vec<(LogGroupId, LogItem)> = plans
        .into_iter()
        .flat_map(|p| {
            let group = p.group;
            p.items.into_iter().map(move |i| (group, i))
        })
        .collect();
    all_items.sort_by_key(|(_, item)| item.commit_version);

    let pool = RestoreWorkerPool::new(store.clone(), worker_count, 4096);
    for (group, item) in all_items {
        if !is_complete(item.commit_version) {
            continue;
        }
        if let Some(&cap) = stopping_lsn.get(&group) {
            if item.lsn >= cap {
                continue;
            }
        }
        highest_version = highest_version.max(item.commit_version);
        let Some(bytes) = item.changeset else { continue };
        let blocks = decode_changeset(&bytes)?;
        for block in blocks {
            if block.is_alignment() {
                continue;
            }
            let properties = Arc::new(block.properties);
            for row in block.rows {
                pool.submit(ApplyJob::new(block.class_id, block.op_type, item.commit_version, properties.clone(), row));
            }
        }
    }
    pool.join();

    let store = Arc::try_unwrap(store).unwrap_or_else(|_| panic!("restore pool outlived its join"));
    log::info!("restore finished at commit version {highest_version}");
    Ok((store, highest_version))
}

/// Repopulates every class's indexes and inverse-reference graph from its
/// live objects, after `restore` has replayed the log/snapshot state. Index
/// contents and inverse-ref lists aren't themselves persisted; they're
/// cheap to rebuild by scanning (spec.md §4.9 step 7).
pub fn rebuild_derived_state(store: &ObjectStore) -> CResult<()> {
    for class_store in store.classes() {
        let ids: Vec<_> = class_store.scan_chunks(usize::MAX).into_iter().flatten().collect();
        for id in ids {
            let Some(node) = class_store.get_visible(id, u64::MAX) else {
                continue;
            };
            class_store.with_indexes(|indexes| {
                for (descriptor, index) in indexes {
                    let key = build_key(class_store, &node, descriptor);
                    match index {
                        Index::Hash(hash) => hash.insert(IndexKey(key), id),
                        Index::Sorted(sorted) => sorted.add(&key, id),
                    }
                }
            });
        }
    }

    for class_store in store.classes() {
        let class_id = class_store.descriptor.id;
        let ids: Vec<_> = class_store.scan_chunks(usize::MAX).into_iter().flatten().collect();
        for (position, prop) in class_store.descriptor.properties.iter().enumerate() {
            if !prop.prop_type.is_reference() || !prop.inverse_tracked {
                continue;
            }
            let Some(target_class) = prop.target_class else { continue };
            for &id in &ids {
                let Some(node) = class_store.get_visible(id, u64::MAX) else {
                    continue;
                };
                match node.properties.get(position) {
                    Some(Value::Reference(Some(target))) => {
                        store.add_inverse_ref(target_class, *target, class_id, id, prop.id)?;
                    }
                    Some(Value::ReferenceArray(targets)) => {
                        for target in targets {
                            store.add_inverse_ref(target_class, *target, class_id, id, prop.id)?;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
