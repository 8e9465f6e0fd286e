use veloxdb::config::EngineConfig;
use veloxdb::engine::{Database, Schema};
use veloxdb::error::CResult;
use veloxdb::model::{ClassDescriptor, PropertyDescriptor, PropertyType, MASTER_LOG_GROUP};
use veloxdb::store::object::Value;
use veloxdb::txn::transaction::TransactionType;

fn main() {
    println!("Hello, VeloxDB!");
    run().unwrap();
    println!("Bye~");
}

fn run() -> CResult<()> {
    let dir = tempfile::tempdir()?;

    let schema = Schema {
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
        indexes: vec![],
    };

    let mut config = EngineConfig::default();
    config.log_dir_template = dir.path().join("${NodeName}/log").to_string_lossy().into_owned();
    config.snapshot_dir_template = dir.path().join("${NodeName}/snapshot").to_string_lossy().into_owned();

    let db = Database::open(config, "", "node-1", schema)?;

    let mut txn = db.begin(TransactionType::ReadWrite)?;
    let alice = db.create(&mut txn, 1, vec![Value::Int(100)])?;
    let bob = db.create(&mut txn, 1, vec![Value::Int(0)])?;
    db.commit(txn)?;

    let mut txn = db.begin(TransactionType::ReadWrite)?;
    db.update(&mut txn, 1, alice, |props| props[0] = Value::Int(60))?;
    db.update(&mut txn, 1, bob, |props| props[0] = Value::Int(40))?;
    db.commit(txn)?;

    let read = db.begin(TransactionType::Read)?;
    let accounts = db.scan(&read, 1)?;
    assert_eq!(accounts.len(), 2);
    for account in &accounts {
        println!("Account {{ id: {}, balance: {:?} }}", account.id, account.properties[0]);
    }

    db.request_snapshot()?;
    let status = db.status()?;
    println!("current_version={}", status.current_version);

    db.close()?;
    Ok(())
}
