//! Durable engine configuration: the non-schema knobs an embedder sets at
//! `Database::open`. Configuration loading from a file format is an external
//! collaborator per spec.md §1; this is the struct that collaborator
//! ultimately produces.

use serde::{Deserialize, Serialize};

/// Placeholder for the system data root, expanded in path templates.
pub const PLACEHOLDER_SYS_DIR: &str = "${SysDir}";
/// Placeholder for the node identity, expanded in path templates.
pub const PLACEHOLDER_NODE_NAME: &str = "${NodeName}";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Template directory for log files, e.g. `${SysDir}/${NodeName}/log`.
    pub log_dir_template: String,
    /// Template directory for snapshot files.
    pub snapshot_dir_template: String,
    /// Bytes at which an active log file is rotated.
    pub max_log_file_size: u64,
    /// Target size, in bytes, of a single accumulated WAL block.
    pub wal_block_target_size: u32,
    /// Target size, in bytes, of a single snapshot block.
    pub snapshot_block_target_size: u32,
    /// Physical sector size used for sector-aligned WAL writes. `None`
    /// means "probe the OS" (defaults to 4096 when probing is unavailable).
    pub sector_size: Option<u32>,
    /// Number of restoration worker threads; `None` means one per core.
    pub restore_worker_count: Option<usize>,
    /// Capacity of each log group's append intake queue.
    pub wal_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            log_dir_template: format!("{}/{}/log", PLACEHOLDER_SYS_DIR, PLACEHOLDER_NODE_NAME),
            snapshot_dir_template: format!(
                "{}/{}/snapshot",
                PLACEHOLDER_SYS_DIR, PLACEHOLDER_NODE_NAME
            ),
            max_log_file_size: 64 * 1024 * 1024,
            wal_block_target_size: 256 * 1024,
            snapshot_block_target_size: 1024 * 1024,
            sector_size: None,
            restore_worker_count: None,
            wal_queue_capacity: 4096,
        }
    }
}

impl EngineConfig {
    /// Expands `${SysDir}`/`${NodeName}` placeholders in both directory
    /// templates, per spec.md §6 "Environment/paths".
    pub fn expand_paths(&self, sys_dir: &str, node_name: &str) -> ExpandedPaths {
        ExpandedPaths {
            log_dir: expand(&self.log_dir_template, sys_dir, node_name),
            snapshot_dir: expand(&self.snapshot_dir_template, sys_dir, node_name),
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size.unwrap_or(4096)
    }

    pub fn restore_worker_count(&self) -> usize {
        self.restore_worker_count.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Clone, Debug)]
pub struct ExpandedPaths {
    pub log_dir: std::path::PathBuf,
    pub snapshot_dir: std::path::PathBuf,
}

fn expand(template: &str, sys_dir: &str, node_name: &str) -> std::path::PathBuf {
    let expanded = template
        .replace(PLACEHOLDER_SYS_DIR, sys_dir)
        .replace(PLACEHOLDER_NODE_NAME, node_name);
    std::path::PathBuf::from(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_both_placeholders() {
        let cfg = EngineConfig::default();
        let paths = cfg.expand_paths("/data", "node-1");
        assert_eq!(paths.log_dir, std::path::PathBuf::from("/data/node-1/log"));
        assert_eq!(
            paths.snapshot_dir,
            std::path::PathBuf::from("/data/node-1/snapshot")
        );
    }

    #[test]
    fn default_sector_size_is_4096() {
        assert_eq!(EngineConfig::default().sector_size(), 4096);
    }
}
