//! `veloxdb` is an in-memory, transactional, schema-driven object database.
//! Objects are versioned copy-on-write nodes forming an MVCC chain per id;
//! committed transactions are durable via a per-log-group write-ahead log
//! and periodic snapshots, replayed back on open by the restorer.
//!
//! ## Getting started
//!
//! ```rust
//! use veloxdb::config::EngineConfig;
//! use veloxdb::engine::{Database, Schema};
//! use veloxdb::model::{ClassDescriptor, PropertyDescriptor, PropertyType, MASTER_LOG_GROUP};
//! use veloxdb::store::object::Value;
//! use veloxdb::txn::transaction::TransactionType;
//!
//! fn run() -> veloxdb::error::CResult<()> {
//!     let dir = tempfile::tempdir()?;
//!     let schema = Schema {
//!         classes: vec![ClassDescriptor {
//!             id: 1,
//!             name: "Account".into(),
//!             abstract_class: false,
//!             log_group: MASTER_LOG_GROUP,
//!             properties: vec![PropertyDescriptor {
//!                 id: 0,
//!                 name: "balance".into(),
//!                 prop_type: PropertyType::Int,
//!                 target_class: None,
//!                 delete_action: None,
//!                 inverse_tracked: false,
//!             }],
//!         }],
//!         indexes: vec![],
//!     };
//!
//!     let mut config = EngineConfig::default();
//!     config.log_dir_template = dir.path().join("${NodeName}/log").to_string_lossy().into_owned();
//!     let db = Database::open(config, "", "node-1", schema)?;
//!
//!     let mut txn = db.begin(TransactionType::ReadWrite)?;
//!     let id = db.create(&mut txn, 1, vec![Value::Int(100)])?;
//!     db.commit(txn)?;
//!
//!     let read = db.begin(TransactionType::Read)?;
//!     let account = db.get(&read, 1, id)?.unwrap();
//!     assert_eq!(account.properties[0], Value::Int(100));
//!     Ok(())
//! }
//!
//! run().unwrap();
//! ```

pub mod changeset;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod model;
pub mod restore;
pub mod store;
pub mod txn;
pub mod wal;

pub use engine::{Database, EngineStatus, Schema};
pub use error::{CResult, Error};
