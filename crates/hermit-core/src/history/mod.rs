//! History & context management
//!
//! Append-only conversation history, the token-usage heuristic against
//! the model's context window, model-assisted compaction, and the
//! payload-growth fail-safe.

mod compactor;
mod failsafe;

pub use compactor::{HistoryCompactor, COMPACTED_MEMORY_PREFIX};
pub use failsafe::{payload_growth_is_unsafe, PayloadGuard};

use serde::{Deserialize, Serialize};

use crate::exec::Observation;
use crate::model::{ModelMessage, ModelRequest};

const DEFAULT_CONTEXT_WINDOW: u64 = 256_000;

/// Known per-model context windows; anything unknown falls back to the
/// default.
const MODEL_CONTEXT_WINDOWS: [(&str, u64); 6] = [
    ("gpt-4.1", 128_000),
    ("gpt-4.1-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("o4-mini", 128_000),
    ("gpt-5-codex", 256_000),
];

/// Environment override for the context window size.
pub const CONTEXT_WINDOW_ENV: &str = "HERMIT_CONTEXT_WINDOW";

/// One conversation history entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub event_type: String,
    pub role: String,
    pub content: String,
    pub pass: u64,
}

impl HistoryEntry {
    pub fn chat(role: impl Into<String>, content: impl Into<String>, pass: u64) -> Self {
        Self {
            event_type: "chat-message".to_string(),
            role: role.into(),
            content: content.into(),
            pass,
        }
    }

    /// Observation entries carry the serialized observation payload as
    /// user-visible content for the model's next pass.
    pub fn observation(observation: &Observation, pass: u64) -> Self {
        Self {
            event_type: "observation".to_string(),
            role: "user".to_string(),
            content: serde_json::to_string(&observation.to_value())
                .expect("observation serializes"),
            pass,
        }
    }
}

/// Project history into the model request message shape.
pub fn map_history_to_messages(history: &[HistoryEntry]) -> Vec<ModelMessage> {
    history
        .iter()
        .map(|entry| ModelMessage {
            role: entry.role.clone(),
            content: entry.content.clone(),
        })
        .collect()
}

pub fn build_model_request(model: &str, history: &[HistoryEntry]) -> ModelRequest {
    ModelRequest {
        model: model.to_string(),
        messages: map_history_to_messages(history),
    }
}

/// Character-length token estimate: ≈4 characters per token plus a fixed
/// structural overhead per message. A history of empty messages still
/// costs a little per entry.
pub fn estimate_tokens(history: &[HistoryEntry]) -> u64 {
    if history.is_empty() {
        return 0;
    }

    let message_count = history.len() as u64;
    let total_chars: u64 = history.iter().map(|entry| entry.content.len() as u64).sum();

    if total_chars == 0 {
        return message_count * 4;
    }

    let tokens_from_characters = total_chars.div_ceil(4);
    let structural_tokens = message_count * 6;
    tokens_from_characters + structural_tokens
}

/// Resolve the context window: explicit env override, then the per-model
/// table, then the default. A set-but-unparsable override disables the
/// window entirely rather than silently picking a number.
pub fn context_window(model: Option<&str>) -> Option<u64> {
    if let Ok(raw) = std::env::var(CONTEXT_WINDOW_ENV) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return trimmed.parse::<u64>().ok().filter(|window| *window > 0);
        }
    }

    let Some(model) = model.filter(|model| !model.trim().is_empty()) else {
        return Some(DEFAULT_CONTEXT_WINDOW);
    };

    let normalized = model.trim().to_ascii_lowercase();
    let window = MODEL_CONTEXT_WINDOWS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, window)| *window)
        .unwrap_or(DEFAULT_CONTEXT_WINDOW);
    Some(window)
}

/// Context usage summary emitted every pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextUsage {
    pub total: Option<u64>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub percent_remaining: Option<f64>,
}

pub fn summarize_context_usage(history: &[HistoryEntry], model: Option<&str>) -> ContextUsage {
    let used = estimate_tokens(history);
    let Some(total) = context_window(model).filter(|total| *total > 0) else {
        return ContextUsage {
            total: None,
            used,
            remaining: None,
            percent_remaining: None,
        };
    };

    let remaining = total.saturating_sub(used);
    ContextUsage {
        total: Some(total),
        used,
        remaining: Some(remaining),
        percent_remaining: Some(remaining as f64 / total as f64 * 100.0),
    }
}
