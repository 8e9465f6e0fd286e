//! The embedding API: `Database::open` wires schema registration, crash
//! recovery, and the WAL persister together, then exposes the transaction
//! and object/index operations an embedder drives (spec.md §6 "Public API").

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{CResult, Error};
use crate::index::{Index, IndexKey};
use crate::model::{ClassDescriptor, ClassId, IndexDescriptor, LogGroupId, PropertyId, MASTER_LOG_GROUP};
use crate::restore;
use crate::store::arena::Handle;
use crate::store::object::{CommitVersion, InverseRefEntry, ObjectId, ObjectVersion, Value};
use crate::store::ObjectStore;
use crate::txn::manager::{Persister, TransactionManager};
use crate::txn::transaction::{Transaction, TransactionType};
use crate::wal::{write_snapshot, WalPersister};

/// The schema an embedder registers at `Database::open`: every class the
/// engine will store objects for, plus the indexes declared over them.
pub struct Schema {
    pub classes: Vec<ClassDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
}

/// A lightweight snapshot of engine state for introspection/monitoring.
#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub current_version: CommitVersion,
    pub class_object_counts: Vec<(ClassId, usize)>,
}

struct Engine {
    manager: TransactionManager,
    wal: Arc<WalPersister>,
    groups: Vec<LogGroupId>,
    disposed: AtomicBool,
}

/// A handle to an open database. Cheap to clone; every clone shares the
/// same underlying engine and storage.
#[derive(Clone)]
pub struct Database {
    engine: Arc<Engine>,
}

impl Database {
    /// Opens the database rooted at `config`'s (expanded) log directory,
    /// replaying its WAL and snapshot state before accepting transactions
    /// (spec.md §4.9). Creates the directory and an empty database on
    /// first use.
    pub fn open(config: EngineConfig, sys_dir: &str, node_name: &str, schema: Schema) -> CResult<Self> {
        let paths = config.expand_paths(sys_dir, node_name);
        std::fs::create_dir_all(&paths.log_dir)?;

        let mut store = ObjectStore::new();
        for class in &schema.classes {
            store.register_class(class.clone())?;
        }
        for index in &schema.indexes {
            index.validate()?;
            let class_store = store.class(index.class_id)?;
            class_store.add_index(index.clone());
        }

        let mut groups: Vec<LogGroupId> = schema.classes.iter().map(|c| c.log_group).collect();
        groups.push(MASTER_LOG_GROUP);
        groups.sort_unstable();
        groups.dedup();

        log::info!("opening database at {} ({} log groups)", paths.log_dir.display(), groups.len());
        let worker_count = config.restore_worker_count();
        let (store, restored_version) = restore::restore(store, &paths.log_dir, &groups, worker_count).map_err(|err| {
            if err.is_fatal() {
                log::error!("fatal error during restore, database will not open: {err}");
            }
            err
        })?;
        restore::rebuild_derived_state(&store)?;
        log::info!("restore complete, resuming at commit version {restored_version}");

        let wal = Arc::new(WalPersister::open(&config, paths.log_dir.clone(), &groups)?);
        let manager = TransactionManager::new(store, restored_version, groups.len(), wal.clone() as Arc<dyn Persister>);

        Ok(Database {
            engine: Arc::new(Engine {
                manager,
                wal,
                groups,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    fn require_open(&self) -> CResult<()> {
        if self.engine.disposed.load(Ordering::Acquire) {
            return Err(Error::DatabaseDisposed);
        }
        Ok(())
    }

    /// Flushes every log group's writer and marks the database closed;
    /// further operations return `Error::DatabaseDisposed`.
    pub fn close(&self) -> CResult<()> {
        log::info!("closing database at commit version {}", self.engine.manager.current_version());
        self.engine.disposed.store(true, Ordering::Release);
        for writer in self.engine.wal.writers() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Triggers a snapshot rotation on every log group at the database's
    /// current commit version (spec.md §4.7).
    pub fn request_snapshot(&self) -> CResult<()> {
        self.require_open()?;
        let version = self.engine.manager.current_version();
        log::debug!("snapshot requested at commit version {version} across {} log groups", self.engine.groups.len());
        for &group in &self.engine.groups {
            let Some(writer) = self.engine.wal.writer(group) else { continue };
            let store = &self.engine.manager.store;
            writer.request_snapshot(version, |at_version, path| write_snapshot(store, group, at_version, path))?;
        }
        Ok(())
    }

    /// Object counts per class plus the current commit version, a
    /// lightweight alternative to exposing internal storage for monitoring.
    pub fn status(&self) -> CResult<EngineStatus> {
        self.require_open()?;
        let class_object_counts = self.engine.manager.store.classes().map(|c| (c.descriptor.id, c.object_count())).collect();
        Ok(EngineStatus {
            current_version: self.engine.manager.current_version(),
            class_object_counts,
        })
    }

    pub fn begin(&self, txn_type: TransactionType) -> CResult<Transaction> {
        self.require_open()?;
        Ok(self.engine.manager.begin(txn_type))
    }

    pub fn commit(&self, txn: Transaction) -> CResult<CommitVersion> {
        self.require_open()?;
        self.engine.manager.commit(txn)
    }

    /// Abandons a transaction's pending writes without publishing them.
    /// The version nodes it allocated stay unreachable garbage (spec.md
    /// §4.5 "Rollback").
    pub fn rollback(&self, mut txn: Transaction) {
        txn.state = crate::txn::transaction::TransactionState::Aborted;
    }

    pub fn create(&self, txn: &mut Transaction, class_id: ClassId, properties: Vec<Value>) -> CResult<ObjectId> {
        self.require_open()?;
        self.engine.manager.create(txn, class_id, properties)
    }

    pub fn get(&self, txn: &Transaction, class_id: ClassId, id: ObjectId) -> CResult<Option<ObjectVersion>> {
        self.require_open()?;
        self.engine.manager.read(txn, class_id, id)
    }

    pub fn update(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId, mutate: impl FnOnce(&mut Vec<Value>)) -> CResult<()> {
        self.require_open()?;
        self.engine.manager.update(txn, class_id, id, mutate)
    }

    pub fn delete(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId) -> CResult<()> {
        self.require_open()?;
        self.engine.manager.delete(txn, class_id, id)
    }

    /// Sets (or clears) a single-valued reference property.
    pub fn set_reference(&self, txn: &mut Transaction, class_id: ClassId, id: ObjectId, property_id: PropertyId, target: Option<ObjectId>) -> CResult<()> {
        self.require_open()?;
        let store = &self.engine.manager.store;
        let class_store = store.class(class_id)?;
        let position = class_store
            .descriptor
            .properties
            .iter()
            .position(|p| p.id == property_id)
            .ok_or_else(|| Error::SchemaMismatch(format!("property {property_id} not found on class {class_id}")))?;
        self.engine.manager.update(txn, class_id, id, |props| {
            if let Some(slot) = props.get_mut(position) {
                *slot = Value::Reference(target);
            }
        })
    }

    /// Interns a string/blob payload into a class's side store, producing
    /// the `Handle` a `Value::String`/`Value::StringArray` element needs.
    /// Callers build `String`-typed properties through this rather than
    /// through a raw `Handle` of their own construction.
    pub fn intern_string(&self, class_id: ClassId, bytes: &[u8]) -> CResult<Handle> {
        self.require_open()?;
        let class_store = self.engine.manager.store.class(class_id)?;
        Ok(class_store.strings.intern(bytes))
    }

    /// Resolves a `Value::String`/`Value::StringArray` element's `Handle`
    /// back to its bytes.
    pub fn resolve_string(&self, class_id: ClassId, handle: Handle) -> CResult<Option<Vec<u8>>> {
        self.require_open()?;
        let class_store = self.engine.manager.store.class(class_id)?;
        Ok(class_store.strings.get(handle))
    }

    pub fn get_inverse_references(&self, class_id: ClassId, id: ObjectId) -> CResult<Vec<InverseRefEntry>> {
        self.require_open()?;
        self.engine.manager.store.inverse_refs(class_id, id)
    }

    /// Every live object of `class_id` visible at `txn`'s read-version.
    pub fn scan(&self, txn: &Transaction, class_id: ClassId) -> CResult<Vec<ObjectVersion>> {
        self.require_open()?;
        let store = &self.engine.manager.store;
        let class_store = store.class(class_id)?;
        let ids: Vec<_> = class_store.scan_chunks(usize::MAX).into_iter().flatten().collect();
        Ok(ids.into_iter().filter_map(|id| class_store.get_visible(id, txn.read_version)).collect())
    }

    /// Exact-match lookup on a named index. Unique hash indexes return at
    /// most one id; non-unique/sorted indexes may return several.
    pub fn find(&self, class_id: ClassId, index_name: &str, key: &[u8]) -> CResult<Vec<ObjectId>> {
        self.require_open()?;
        let class_store = self.engine.manager.store.class(class_id)?;
        let result = class_store.with_indexes(|indexes| {
            indexes.iter().find(|(d, _)| d.name == index_name).map(|(_, index)| match index {
                Index::Hash(hash) => hash.find(&IndexKey(key.to_vec())).into_iter().collect(),
                Index::Sorted(sorted) => sorted.find_equal(key),
            })
        });
        result.ok_or_else(|| Error::SchemaMismatch(format!("no index named {index_name} on class {class_id}")))
    }

    /// Ascending range scan over a named sorted index.
    pub fn range(
        &self,
        class_id: ClassId,
        index_name: &str,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        low_inclusive: bool,
        high_inclusive: bool,
    ) -> CResult<Vec<(Vec<u8>, Vec<ObjectId>)>> {
        self.require_open()?;
        let class_store = self.engine.manager.store.class(class_id)?;
        let result = class_store.with_indexes(|indexes| {
            indexes.iter().find(|(d, _)| d.name == index_name).map(|(_, index)| match index {
                Index::Sorted(sorted) => Ok(sorted.range(low, high, low_inclusive, high_inclusive)),
                Index::Hash(_) => Err(Error::SchemaMismatch(format!("index {index_name} is a hash index; range scans require a sorted index"))),
            })
        });
        result.ok_or_else(|| Error::SchemaMismatch(format!("no index named {index_name} on class {class_id}")))?
    }

    /// Every entry of a named sorted index in ascending key order.
    pub fn iterate(&self, class_id: ClassId, index_name: &str) -> CResult<Vec<(Vec<u8>, Vec<ObjectId>)>> {
        self.range(class_id, index_name, None, None, true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseSensitivity, IndexKind, PropertyDescriptor, PropertyType};
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema {
            classes: vec![ClassDescriptor {
                id: 1,
                name: "Account".into(),
                abstract_class: false,
                log_group: MASTER_LOG_GROUP,
                properties: vec![PropertyDescriptor {
                    id: 0,
                    name: "balance".into(),
                    prop_type: PropertyType::Int,
                    target_class: None,
                    delete_action: None,
                    inverse_tracked: false,
                }],
            }],
            indexes: vec![IndexDescriptor {
                name: "by_balance".into(),
                class_id: 1,
                unique: false,
                kind: IndexKind::Sorted {
                    properties: vec![crate::model::IndexKeyProperty {
                        property: 0,
                        order: crate::model::SortOrder::Ascending,
                    }],
                    culture: None,
                    case_sensitivity: CaseSensitivity::Sensitive,
                },
            }],
        }
    }

    fn config_for(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.log_dir_template = dir.join("${NodeName}/log").to_string_lossy().into_owned();
        config.snapshot_dir_template = dir.join("${NodeName}/snapshot").to_string_lossy().into_owned();
        config
    }

    #[test]
    fn create_commit_and_read_back() {
        let dir = tempdir().unwrap();
        let db = Database::open(config_for(dir.path()), "", "node-1", schema()).unwrap();

        let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
        let id = db.create(&mut txn, 1, vec![Value::Int(100)]).unwrap();
        db.commit(txn).unwrap();

        let read = db.begin(TransactionType::Read).unwrap();
        let obj = db.get(&read, 1, id).unwrap().unwrap();
        assert_eq!(obj.properties[0], Value::Int(100));
    }

    #[test]
    fn index_find_and_range_reflect_writes() {
        let dir = tempdir().unwrap();
        let db = Database::open(config_for(dir.path()), "", "node-1", schema()).unwrap();

        let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
        db.create(&mut txn, 1, vec![Value::Int(10)]).unwrap();
        db.create(&mut txn, 1, vec![Value::Int(20)]).unwrap();
        db.commit(txn).unwrap();

        let found = db.find(1, "by_balance", &10i32.to_le_bytes()).unwrap();
        assert_eq!(found.len(), 1);
        let ranged = db.range(1, "by_balance", None, None, true, true).unwrap();
        assert_eq!(ranged.len(), 2);
    }

    #[test]
    fn closed_database_rejects_further_work() {
        let dir = tempdir().unwrap();
        let db = Database::open(config_for(dir.path()), "", "node-1", schema()).unwrap();
        db.close().unwrap();
        assert!(matches!(db.begin(TransactionType::Read), Err(Error::DatabaseDisposed)));
    }
}
