//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".hermit";

/// Get the hermit config directory (~/.hermit)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the allowlist config file (~/.hermit/approved_commands.json)
pub fn allowlist_path() -> PathBuf {
    config_dir().join("approved_commands.json")
}

/// Get the hermit data directory (platform data dir, e.g. ~/.local/share/hermit)
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| config_dir().join("data"))
        .join("hermit")
}

/// Get the command usage stats file
pub fn command_stats_path() -> PathBuf {
    data_dir().join("command-stats.json")
}

/// Get the directory for fail-safe history dumps
pub fn failsafe_dump_dir() -> PathBuf {
    data_dir().join("failsafe-history")
}
