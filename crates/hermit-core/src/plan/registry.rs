//! Completed-step registry
//!
//! Process-scoped record of every step id that reached `completed` during
//! the session. Survives plan replacement so a later delta cannot
//! resurrect a dependency on work that already finished; cleared whenever
//! the active plan becomes empty.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct CompletedStepRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CompletedStepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_completed(&self, id: impl Into<String>) {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return;
        }
        self.inner.lock().insert(trimmed.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains(id.trim())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
