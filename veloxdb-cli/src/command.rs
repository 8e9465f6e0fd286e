//! Subcommands operated against a single open `Database`: one demo class
//! ("Item", a single `Int` property) so the CLI can exercise the engine's
//! public surface without a schema-loading story of its own.

use anyhow::{Context, Result};
use clap::Subcommand;

use veloxdb::model::{ClassDescriptor, PropertyDescriptor, PropertyType, MASTER_LOG_GROUP};
use veloxdb::store::object::Value;
use veloxdb::txn::transaction::TransactionType;
use veloxdb::{Database, Schema};

pub const ITEM_CLASS: i16 = 1;
const VALUE_PROPERTY: u16 = 0;

pub fn demo_schema() -> Schema {
    Schema {
        classes: vec![ClassDescriptor {
            id: ITEM_CLASS,
            name: "Item".into(),
            abstract_class: false,
            log_group: MASTER_LOG_GROUP,
            properties: vec![PropertyDescriptor {
                id: VALUE_PROPERTY,
                name: "value".into(),
                prop_type: PropertyType::Int,
                target_class: None,
                delete_action: None,
                inverse_tracked: false,
            }],
        }],
        indexes: vec![],
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates a new Item with the given value.
    Put {
        #[clap(long)]
        value: i32,
    },
    /// Reads an Item by id.
    Get {
        #[clap(long)]
        id: u64,
    },
    /// Updates an Item's value.
    Update {
        #[clap(long)]
        id: u64,
        #[clap(long)]
        value: i32,
    },
    /// Deletes an Item.
    Delete {
        #[clap(long)]
        id: u64,
    },
    /// Lists every live Item.
    Scan,
    /// Triggers a snapshot rotation on every log group.
    Snapshot,
    /// Prints the current commit version and per-class object counts.
    Status,
}

pub fn run(db: &Database, cmd: Command) -> Result<()> {
    match cmd {
        Command::Put { value } => {
            let mut txn = db.begin(TransactionType::ReadWrite).context("begin")?;
            let id = db.create(&mut txn, ITEM_CLASS, vec![Value::Int(value)]).context("create")?;
            db.commit(txn).context("commit")?;
            println!("created object {id}");
        }
        Command::Get { id } => {
            let txn = db.begin(TransactionType::Read).context("begin")?;
            match db.get(&txn, ITEM_CLASS, id).context("get")? {
                Some(obj) => println!("Item {{ id: {}, value: {:?} }}", obj.id, obj.properties.first()),
                None => println!("no such object {id}"),
            }
        }
        Command::Update { id, value } => {
            let mut txn = db.begin(TransactionType::ReadWrite).context("begin")?;
            db.update(&mut txn, ITEM_CLASS, id, |props| {
                if let Some(slot) = props.get_mut(0) {
                    *slot = Value::Int(value);
                }
            })
            .context("update")?;
            db.commit(txn).context("commit")?;
            println!("updated object {id}");
        }
        Command::Delete { id } => {
            let mut txn = db.begin(TransactionType::ReadWrite).context("begin")?;
            db.delete(&mut txn, ITEM_CLASS, id).context("delete")?;
            db.commit(txn).context("commit")?;
            println!("deleted object {id}");
        }
        Command::Scan => {
            let txn = db.begin(TransactionType::Read).context("begin")?;
            for obj in db.scan(&txn, ITEM_CLASS).context("scan")? {
                println!("Item {{ id: {}, value: {:?} }}", obj.id, obj.properties.first());
            }
        }
        Command::Snapshot => {
            db.request_snapshot().context("request_snapshot")?;
            println!("snapshot requested");
        }
        Command::Status => {
            let status = db.status().context("status")?;
            let objects: usize = status.class_object_counts.iter().map(|(_, n)| n).sum();
            println!("current_version={} objects={}", status.current_version, objects);
        }
    }
    Ok(())
}
