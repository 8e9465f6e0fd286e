//! End-to-end scenarios exercised through the public `Database`/`Schema`
//! surface, one per spec.md §8 seed scenario.

use veloxdb::config::EngineConfig;
use veloxdb::engine::{Database, Schema};
use veloxdb::error::Error;
use veloxdb::model::{
    CaseSensitivity, ClassDescriptor, DeleteAction, IndexDescriptor, IndexKind, IndexKeyProperty,
    PropertyDescriptor, PropertyType, SortOrder, MASTER_LOG_GROUP,
};
use veloxdb::store::object::Value;
use veloxdb::txn::transaction::TransactionType;

const CLASS_A: i16 = 1;
const CLASS_B: i16 = 2;
const PROP_NAME: u16 = 0;
const PROP_V: u16 = 0;
const PROP_REF: u16 = 1;

fn open(dir: &std::path::Path, node: &str, schema: Schema, log_groups: usize) -> Database {
    let mut config = EngineConfig::default();
    config.log_dir_template = dir.join("${NodeName}/log").to_string_lossy().into_owned();
    config.snapshot_dir_template = dir.join("${NodeName}/snapshot").to_string_lossy().into_owned();
    let _ = log_groups;
    Database::open(config, "", node, schema).unwrap()
}

fn single_class_schema(prop_type: PropertyType) -> Schema {
    Schema {
        classes: vec![ClassDescriptor {
            id: CLASS_A,
            name: "A".into(),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![PropertyDescriptor {
                id: PROP_NAME,
                name: "name".into(),
                prop_type,
                target_class: None,
                delete_action: None,
                inverse_tracked: false,
            }],
        }],
        indexes: vec![],
    }
}

/// Scenario 1: basic durability. Insert, commit, then reopen the database
/// against the same directory and confirm the object survived.
#[test]
fn basic_durability() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path(), "node-1", single_class_schema(PropertyType::String), 1);
        let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
        let handle = db.intern_string(CLASS_A, b"x").unwrap();
        db.create(&mut txn, CLASS_A, vec![Value::String(handle)]).unwrap();
        db.commit(txn).unwrap();
        db.close().unwrap();
    }

    let db = open(dir.path(), "node-1", single_class_schema(PropertyType::String), 1);
    let read = db.begin(TransactionType::Read).unwrap();
    let rows = db.scan(&read, CLASS_A).unwrap();
    assert_eq!(rows.len(), 1);
    let Value::String(handle) = &rows[0].properties[0] else { panic!("expected a string property") };
    assert_eq!(db.resolve_string(CLASS_A, *handle).unwrap(), Some(b"x".to_vec()));
}

/// Scenario 2: MVCC visibility. A reader that began before a commit never
/// observes it; one that began after does; a concurrent uncommitted update
/// is invisible to an older reader.
#[test]
fn mvcc_visibility() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path(), "node-1", single_class_schema(PropertyType::Int), 1);

    let before = db.begin(TransactionType::Read).unwrap();

    let mut t1 = db.begin(TransactionType::ReadWrite).unwrap();
    let id = db.create(&mut t1, CLASS_A, vec![Value::Int(1)]).unwrap();
    db.commit(t1).unwrap();

    assert_eq!(db.get(&before, CLASS_A, id).unwrap(), None);

    let after = db.begin(TransactionType::Read).unwrap();
    assert_eq!(db.get(&after, CLASS_A, id).unwrap().unwrap().properties[0], Value::Int(1));

    let mut t4 = db.begin(TransactionType::ReadWrite).unwrap();
    db.update(&mut t4, CLASS_A, id, |props| props[0] = Value::Int(2)).unwrap();
    // t4 hasn't committed yet; `after` must still see v=1.
    assert_eq!(db.get(&after, CLASS_A, id).unwrap().unwrap().properties[0], Value::Int(1));
    db.commit(t4).unwrap();
}

/// Scenario 3: write-write conflict. Two transactions read the same object,
/// both update it; the first to commit wins, the second is rejected.
#[test]
fn write_write_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path(), "node-1", single_class_schema(PropertyType::Int), 1);

    let mut setup = db.begin(TransactionType::ReadWrite).unwrap();
    let id = db.create(&mut setup, CLASS_A, vec![Value::Int(0)]).unwrap();
    db.commit(setup).unwrap();

    let mut t1 = db.begin(TransactionType::ReadWrite).unwrap();
    let mut t2 = db.begin(TransactionType::ReadWrite).unwrap();
    db.get(&t1, CLASS_A, id).unwrap();
    db.get(&t2, CLASS_A, id).unwrap();

    db.update(&mut t1, CLASS_A, id, |props| props[0] = Value::Int(1)).unwrap();
    db.update(&mut t2, CLASS_A, id, |props| props[0] = Value::Int(2)).unwrap();

    db.commit(t1).unwrap();
    let result = db.commit(t2);
    assert!(matches!(result, Err(Error::Conflict)));
}

/// Scenario 4: cascade delete. Deleting B1 (with A.ref -> B, CascadeDelete)
/// also deletes A1, and B1's inverse-ref list is left empty.
#[test]
fn cascade_delete() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema {
        classes: vec![
            ClassDescriptor {
                id: CLASS_A,
                name: "A".into(),
                abstract_class: false,
                log_group: MASTER_LOG_GROUP,
                properties: vec![PropertyDescriptor {
                    id: PROP_REF,
                    name: "ref".into(),
                    prop_type: PropertyType::Reference,
                    target_class: Some(CLASS_B),
                    delete_action: Some(DeleteAction::CascadeDelete),
                    inverse_tracked: true,
                }],
            },
            ClassDescriptor {
                id: CLASS_B,
                name: "B".into(),
                abstract_class: false,
                log_group: MASTER_LOG_GROUP,
                properties: vec![],
            },
        ],
        indexes: vec![],
    };
    let db = open(dir.path(), "node-1", schema, 1);

    let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
    let b1 = db.create(&mut txn, CLASS_B, vec![]).unwrap();
    let a1 = db.create(&mut txn, CLASS_A, vec![Value::Reference(Some(b1))]).unwrap();
    db.commit(txn).unwrap();

    let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
    db.delete(&mut txn, CLASS_B, b1).unwrap();
    db.commit(txn).unwrap();

    let read = db.begin(TransactionType::Read).unwrap();
    assert_eq!(db.get(&read, CLASS_A, a1).unwrap(), None);
    assert_eq!(db.get(&read, CLASS_B, b1).unwrap(), None);
    assert!(db.get_inverse_references(CLASS_B, b1).unwrap().is_empty());
}

/// Scenario 5: split transaction recovery. A transaction whose writes span
/// two log groups must be all-or-nothing: simulate a crash after committing
/// by just never calling `commit`, and confirm restoring finds nothing.
#[test]
fn split_transaction_not_committed_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema {
        classes: vec![
            ClassDescriptor {
                id: CLASS_A,
                name: "A".into(),
                abstract_class: false,
                log_group: MASTER_LOG_GROUP,
                properties: vec![PropertyDescriptor {
                    id: PROP_V,
                    name: "v".into(),
                    prop_type: PropertyType::Int,
                    target_class: None,
                    delete_action: None,
                    inverse_tracked: false,
                }],
            },
            ClassDescriptor {
                id: CLASS_B,
                name: "B".into(),
                abstract_class: false,
                log_group: 1,
                properties: vec![PropertyDescriptor {
                    id: PROP_V,
                    name: "v".into(),
                    prop_type: PropertyType::Int,
                    target_class: None,
                    delete_action: None,
                    inverse_tracked: false,
                }],
            },
        ],
        indexes: vec![],
    };
    {
        let db = open(dir.path(), "node-1", schema_clone(&schema), 2);
        let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
        let id_a = db.create(&mut txn, CLASS_A, vec![Value::Int(1)]).unwrap();
        let id_b = db.create(&mut txn, CLASS_B, vec![Value::Int(2)]).unwrap();
        // Simulate a crash mid-commit: drop the transaction without
        // committing or rolling back, as if the process died here.
        std::mem::drop(txn);
        let _ = (id_a, id_b);
        db.close().unwrap();
    }

    let db = open(dir.path(), "node-1", schema, 2);
    let read = db.begin(TransactionType::Read).unwrap();
    assert!(db.scan(&read, CLASS_A).unwrap().is_empty());
    assert!(db.scan(&read, CLASS_B).unwrap().is_empty());
}

fn schema_clone(schema: &Schema) -> Schema {
    Schema {
        classes: schema.classes.clone(),
        indexes: schema.indexes.clone(),
    }
}

/// Scenario 5b: split-transaction stopping LSN. Crafts a log where a
/// two-group transaction only ever reaches one of its two affected groups
/// (simulating a crash between the two groups' writes), followed by a
/// later, single-group transaction that is complete entirely on its own.
/// Restoration must still discard the later transaction, since nothing
/// recorded at or after the split transaction's LSN in that group can be
/// trusted (spec.md §4.9 step 6).
#[test]
fn split_transaction_caps_replay_at_stopping_lsn() {
    use veloxdb::changeset::{encode_changeset, BlockProperty, ChangesetWriter, FieldValue, OpType, Row};
    use veloxdb::wal::{LogItem, WalPersister};

    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.log_dir_template = dir.path().join("${NodeName}/log").to_string_lossy().into_owned();
    let paths = config.expand_paths("", "node-1");
    std::fs::create_dir_all(&paths.log_dir).unwrap();

    let groups = vec![MASTER_LOG_GROUP, 1u8];
    let properties = vec![BlockProperty {
        property_id: PROP_V,
        prop_type: PropertyType::Int,
    }];

    let changeset_for = |object_id: u64, version: u64, value: i32| -> Vec<u8> {
        let mut writer = ChangesetWriter::new();
        writer.write_row(
            CLASS_A,
            OpType::Insert,
            &properties,
            Row {
                object_id,
                version,
                values: vec![FieldValue::Int(value)],
            },
        );
        encode_changeset(&writer.finish())
    };

    {
        let wal = WalPersister::open(&config, paths.log_dir.clone(), &groups).unwrap();
        let group0 = wal.writer(MASTER_LOG_GROUP).unwrap();

        // The split transaction: affects both groups (mask bits 0 and 1),
        // but only ever lands in group 0 before the simulated crash.
        group0
            .append(&LogItem {
                commit_version: 10,
                local_term: 0,
                global_term: 0,
                affected_log_groups: 0b11,
                lsn: 1,
                changeset: Some(changeset_for(1, 10, 111)),
            })
            .unwrap();

        // A later, single-group transaction that is complete entirely
        // within group 0. Without stopping-LSN capping this would look
        // perfectly valid on replay.
        group0
            .append(&LogItem {
                commit_version: 11,
                local_term: 0,
                global_term: 0,
                affected_log_groups: 0b01,
                lsn: 2,
                changeset: Some(changeset_for(2, 11, 222)),
            })
            .unwrap();
        group0.flush().unwrap();
    }

    let schema = single_class_schema(PropertyType::Int);
    let db = open(dir.path(), "node-1", schema, 2);
    let read = db.begin(TransactionType::Read).unwrap();
    let objects = db.scan(&read, CLASS_A).unwrap();
    assert!(objects.is_empty(), "expected both the split transaction and the later transaction past its stopping LSN to be discarded, got {objects:?}");
}

/// Scenario 6: sorted index range. Insert keys [10,20,30,40]; range(15,35)
/// yields [20,30]; after removing 20, it yields [30].
#[test]
fn sorted_index_range_scan() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema {
        classes: vec![ClassDescriptor {
            id: CLASS_A,
            name: "A".into(),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![PropertyDescriptor {
                id: PROP_V,
                name: "v".into(),
                prop_type: PropertyType::Int,
                target_class: None,
                delete_action: None,
                inverse_tracked: false,
            }],
        }],
        indexes: vec![IndexDescriptor {
            name: "by_v".into(),
            class_id: CLASS_A,
            unique: false,
            kind: IndexKind::Sorted {
                properties: vec![IndexKeyProperty { property: PROP_V, order: SortOrder::Ascending }],
                culture: None,
                case_sensitivity: CaseSensitivity::Sensitive,
            },
        }],
    };
    let db = open(dir.path(), "node-1", schema, 1);

    let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
    let mut ids = Vec::new();
    for v in [10, 20, 30, 40] {
        ids.push(db.create(&mut txn, CLASS_A, vec![Value::Int(v)]).unwrap());
    }
    db.commit(txn).unwrap();

    let low = 15i32.to_le_bytes().to_vec();
    let high = 35i32.to_le_bytes().to_vec();
    let first = db.range(CLASS_A, "by_v", Some(&low), Some(&high), true, true).unwrap();
    assert_eq!(first.len(), 2);

    let mut txn = db.begin(TransactionType::ReadWrite).unwrap();
    db.delete(&mut txn, CLASS_A, ids[1]).unwrap();
    db.commit(txn).unwrap();

    let second = db.range(CLASS_A, "by_v", Some(&low), Some(&high), true, true).unwrap();
    assert_eq!(second.len(), 1);
}
