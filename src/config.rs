//! Project configuration.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration file name, looked up at the repository root.
pub const CONFIG_FILE: &str = ".arbor.toml";

/// Project-level arbor configuration from `.arbor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Files copied from the trunk worktree into a freshly created one.
    #[serde(default = "default_copy_files")]
    pub copy_files: Vec<String>,

    /// Directories linked from the trunk worktree instead of copied.
    #[serde(default)]
    pub symlink_dirs: Vec<String>,

    /// Shell commands run inside a new worktree when dependency installation
    /// is requested.
    #[serde(default)]
    pub post_create_commands: Vec<String>,

    /// Where new worktrees are created. Defaults to the parent directory of
    /// the repository root.
    #[serde(default)]
    pub worktree_base: Option<PathBuf>,

    /// Age in days past which a quiet worktree counts as stale.
    #[serde(default = "default_stale_threshold_days")]
    pub stale_threshold_days: u32,

    /// How often watchers re-poll the repository.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

fn default_copy_files() -> Vec<String> {
    vec![".env".to_string(), ".env.local".to_string()]
}

fn default_stale_threshold_days() -> u32 {
    14
}

fn default_poll_interval_seconds() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            copy_files: default_copy_files(),
            symlink_dirs: Vec::new(),
            post_create_commands: Vec::new(),
            worktree_base: None,
            stale_threshold_days: default_stale_threshold_days(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

/// Load configuration from `.arbor.toml` under `repo_root`.
///
/// Falls back to defaults if the file is missing.
pub fn load(repo_root: &Path) -> Result<Config> {
    let path = repo_root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}
