//! Command usage statistics
//!
//! A flat `{command_key: count}` JSON document in the platform data
//! directory. Writes are atomic (temp file + fsync + rename in the same
//! directory); corrupt or missing files reset to an empty record instead
//! of failing the pass.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Stats key for a command line: its first non-flag token.
pub fn resolve_command_key(run: &str) -> String {
    run.split_whitespace()
        .find(|token| !token.starts_with('-'))
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn parse_stats(raw: &str) -> BTreeMap<String, u64> {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(raw) else {
        return BTreeMap::new();
    };
    let Some(map) = parsed.as_object() else {
        return BTreeMap::new();
    };

    map.iter()
        .filter(|(key, _)| !key.is_empty())
        .filter_map(|(key, value)| {
            let count = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))?;
            Some((key.clone(), count))
        })
        .collect()
}

/// Increment the persisted counter for `key`.
pub fn increment_command_count(key: &str, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .context("stats path has no parent directory")?;
    std::fs::create_dir_all(dir).context("failed to create stats directory")?;

    let mut stats = match std::fs::read_to_string(path) {
        Ok(raw) => parse_stats(&raw),
        Err(_) => BTreeMap::new(),
    };

    let normalized = key.trim();
    let key = if normalized.is_empty() { "unknown" } else { normalized };
    *stats.entry(key.to_string()).or_insert(0) += 1;

    let tmp = dir.join(format!(
        "._cmdstats_{}",
        uuid::Uuid::new_v4().simple()
    ));

    let write_result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&tmp).context("failed to create stats temp file")?;
        file.write_all(serde_json::to_string(&stats)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path).context("failed to replace stats file")?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    write_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_first_non_flag_token() {
        assert_eq!(resolve_command_key("cargo test --all"), "cargo");
        assert_eq!(resolve_command_key("   ls   -la"), "ls");
        assert_eq!(resolve_command_key(""), "unknown");
        assert_eq!(resolve_command_key("--version"), "unknown");
    }

    #[test]
    fn increments_accumulate_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command-stats.json");

        increment_command_count("cargo", &path).unwrap();
        increment_command_count("cargo", &path).unwrap();
        increment_command_count("ls", &path).unwrap();

        let stats = parse_stats(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(stats.get("cargo"), Some(&2));
        assert_eq!(stats.get("ls"), Some(&1));
    }

    #[test]
    fn corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command-stats.json");
        std::fs::write(&path, "{broken").unwrap();

        increment_command_count("cargo", &path).unwrap();

        let stats = parse_stats(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(stats.get("cargo"), Some(&1));
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn string_counts_are_coerced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("command-stats.json");
        std::fs::write(&path, r#"{"cargo": "4", "bad": [], "": 9}"#).unwrap();

        increment_command_count("cargo", &path).unwrap();

        let stats = parse_stats(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(stats.get("cargo"), Some(&5));
        assert!(!stats.contains_key("bad"));
        assert!(!stats.contains_key(""));
    }
}
