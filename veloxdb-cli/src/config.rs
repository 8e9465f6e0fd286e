//! Persisted CLI defaults, loaded from the OS config directory via `confy`.
//! Command-line flags always win; this only supplies fallbacks so a user
//! doesn't have to pass `--data-dir`/`--node` on every invocation.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    pub data_dir: Option<String>,
    pub node: Option<String>,
    pub log_level: Option<String>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            data_dir: None,
            node: None,
            log_level: Some("info".to_string()),
        }
    }
}

impl ConfigLoad {
    /// Loads `~/.config/veloxdb-cli/config.toml` (platform-appropriate
    /// equivalent), creating it with defaults on first run.
    pub fn load() -> anyhow::Result<Self> {
        Ok(confy::load("veloxdb-cli", "config")?)
    }
}
