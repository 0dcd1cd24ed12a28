//! Payload-growth fail-safe
//!
//! A deliberate circuit breaker against runaway API cost: when the
//! serialized request payload balloons between passes, the engine dumps
//! the full history to a snapshot file and terminates the process. This
//! is fatal by design, not a recoverable error.

use std::path::PathBuf;

use crate::model::ModelRequest;

use super::HistoryEntry;

const DEFAULT_GROWTH_FACTOR_LIMIT: f64 = 3.0;
const MIN_GROWTH_DELTA_BYTES: u64 = 1024;

/// Pure trip-wire predicate: the payload grew by at least the
/// multiplicative factor AND by more than the absolute byte floor.
pub fn payload_growth_is_unsafe(
    previous: u64,
    current: u64,
    growth_factor_limit: f64,
    min_delta_bytes: u64,
) -> bool {
    let growth_factor = if previous > 0 {
        current as f64 / previous as f64
    } else {
        f64::INFINITY
    };

    growth_factor >= growth_factor_limit && current.saturating_sub(previous) > min_delta_bytes
}

pub struct PayloadGuard {
    last_transmitted_size: Option<u64>,
    growth_factor_limit: f64,
    min_delta_bytes: u64,
    dump_dir: PathBuf,
}

impl PayloadGuard {
    pub fn new(dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            last_transmitted_size: None,
            growth_factor_limit: DEFAULT_GROWTH_FACTOR_LIMIT,
            min_delta_bytes: MIN_GROWTH_DELTA_BYTES,
            dump_dir: dump_dir.into(),
        }
    }

    pub fn with_growth_factor_limit(mut self, limit: f64) -> Self {
        self.growth_factor_limit = limit;
        self
    }

    /// Serialized byte size of the request about to be transmitted.
    pub fn estimate_payload_size(request: &ModelRequest) -> Option<u64> {
        serde_json::to_vec(request).ok().map(|bytes| bytes.len() as u64)
    }

    /// Would this payload size trip the breaker?
    pub fn would_trip(&self, current: u64) -> bool {
        self.last_transmitted_size.is_some_and(|previous| {
            payload_growth_is_unsafe(
                previous,
                current,
                self.growth_factor_limit,
                self.min_delta_bytes,
            )
        })
    }

    /// Remember the payload size of a request that actually went out.
    pub fn record_transmitted(&mut self, size: u64) {
        self.last_transmitted_size = Some(size);
    }

    /// Check the candidate payload against the previous pass; on a trip,
    /// dump history and terminate the process.
    pub fn enforce(&self, current: u64, history: &[HistoryEntry], pass_index: u64) {
        let Some(previous) = self.last_transmitted_size else {
            return;
        };
        if !self.would_trip(current) {
            return;
        }

        tracing::error!(
            previous_bytes = previous,
            current_bytes = current,
            pass = pass_index,
            "Request payload ballooned between passes"
        );

        match self.dump_history(history, pass_index) {
            Ok(path) => tracing::error!(path = %path.display(), "Dumped history snapshot"),
            Err(err) => tracing::error!(error = %err, "Failed to persist history snapshot"),
        }

        tracing::error!("Exiting to prevent excessive API charges");
        std::process::exit(1);
    }

    fn dump_history(&self, history: &[HistoryEntry], pass_index: u64) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dump_dir)?;

        let timestamp = chrono::Utc::now()
            .to_rfc3339()
            .replace([':', '.'], "-");
        let path = self.dump_dir.join(format!("pass-{pass_index}-{timestamp}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(history)?)?;
        Ok(path)
    }
}
