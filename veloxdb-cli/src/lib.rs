//! `veloxdb-cli`: a small administrative tool for a VeloxDB database.
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./veloxdb-cli --data-dir ./data --node node-1 put --value 42
//! created object 1
//!
//! ❯ ./veloxdb-cli --data-dir ./data --node node-1 get --id 1
//! Item { id: 1, value: 42 }
//!
//! ❯ ./veloxdb-cli --data-dir ./data --node node-1 status
//! current_version=1 objects=1
//! ```

pub mod command;
pub mod config;
pub mod trace;
