//! Plan snapshot persistence
//!
//! The host reads/writes a flat JSON array of plan steps between passes.
//! An empty array signals "no active plan"; loading one resets the
//! completed-step registry at the call site.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::PlanStep;

/// Storage boundary for the active plan snapshot.
pub trait PlanStore: Send + Sync {
    fn load(&self) -> Result<Vec<PlanStep>>;
    fn save(&self, plan: &[PlanStep]) -> Result<()>;
    fn reset(&self) -> Result<()>;
}

/// JSON-file-backed snapshot store.
pub struct FilePlanStore {
    path: PathBuf,
}

impl FilePlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlanStore for FilePlanStore {
    fn load(&self) -> Result<Vec<PlanStep>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context("failed to read plan snapshot"),
        };

        // A corrupt snapshot is treated as no plan rather than wedging
        // the session.
        match serde_json::from_str(&raw) {
            Ok(plan) => Ok(plan),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "Corrupt plan snapshot, resetting");
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, plan: &[PlanStep]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("failed to create plan snapshot directory")?;
        }

        let serialized = serde_json::to_vec_pretty(plan)?;
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));

        let mut file = fs::File::create(&tmp).context("failed to create plan temp file")?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).context("failed to replace plan snapshot");
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.save(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::StepStatus;

    #[test]
    fn round_trips_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().join("plan.json"));

        let plan = vec![PlanStep {
            id: Some("a".to_string()),
            status: StepStatus::Running,
            ..Default::default()
        }];
        store.save(&plan).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, plan);
    }

    #[test]
    fn missing_file_is_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        fs::write(&path, "{not json").unwrap();

        let store = FilePlanStore::new(path);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn reset_writes_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path().join("plan.json"));
        store
            .save(&[PlanStep {
                id: Some("a".to_string()),
                ..Default::default()
            }])
            .unwrap();

        store.reset().unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
