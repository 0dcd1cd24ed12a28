//! History compaction
//!
//! When estimated usage crosses the threshold, the oldest contiguous run
//! of entries (excluding the leading system entry) is summarized by the
//! model and replaced with one synthetic system entry. A failed or empty
//! summary leaves history untouched — compaction is best-effort.

use std::sync::Arc;

use crate::model::{ModelClient, ModelMessage, ModelRequest};

use super::{summarize_context_usage, HistoryEntry};

pub const COMPACTED_MEMORY_PREFIX: &str = "Compacted memory:";

const DEFAULT_USAGE_THRESHOLD: f64 = 0.5;

const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation history into a compact \
memory. Preserve decisions, command outcomes, file names, and open work. Reply with the summary \
text only.";

pub struct HistoryCompactor {
    client: Arc<dyn ModelClient>,
    model: String,
    usage_threshold: f64,
}

struct CompactionPlan {
    first_content_index: usize,
    count: usize,
}

impl HistoryCompactor {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            usage_threshold: DEFAULT_USAGE_THRESHOLD,
        }
    }

    pub fn with_usage_threshold(mut self, threshold: f64) -> Self {
        self.usage_threshold = threshold;
        self
    }

    fn build_plan(&self, history: &[HistoryEntry]) -> Option<CompactionPlan> {
        if history.is_empty() {
            return None;
        }

        let usage = summarize_context_usage(history, Some(&self.model));
        let total = usage.total.filter(|total| *total > 0)?;
        let ratio = usage.used as f64 / total as f64;
        if ratio <= self.usage_threshold {
            return None;
        }

        let first_content_index = usize::from(history[0].role == "system");
        let available = history.len() - first_content_index;
        if available <= 1 {
            return None;
        }

        Some(CompactionPlan {
            first_content_index,
            count: (available / 2).max(1),
        })
    }

    fn summarization_request(&self, entries: &[HistoryEntry]) -> ModelRequest {
        let mut transcript = String::new();
        for entry in entries {
            transcript.push_str(&format!("[pass {}] {}: {}\n", entry.pass, entry.role, entry.content));
        }

        ModelRequest {
            model: self.model.clone(),
            messages: vec![
                ModelMessage {
                    role: "system".to_string(),
                    content: SUMMARY_INSTRUCTION.to_string(),
                },
                ModelMessage {
                    role: "user".to_string(),
                    content: transcript,
                },
            ],
        }
    }

    /// Compact the oldest run of entries when usage demands it.
    /// Returns whether history was modified.
    pub async fn compact_if_needed(&self, history: &mut Vec<HistoryEntry>) -> bool {
        let Some(plan) = self.build_plan(history) else {
            return false;
        };

        let slice_end = plan.first_content_index + plan.count;
        let entries = &history[plan.first_content_index..slice_end];

        let summary = match self.client.complete(self.summarization_request(entries)).await {
            Ok(response) => response.content.trim().to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to summarize history entries");
                return false;
            }
        };

        if summary.is_empty() {
            return false;
        }

        let compacted_pass = entries.iter().map(|entry| entry.pass).max().unwrap_or(0);
        let replacement = HistoryEntry::chat(
            "system",
            format!("{COMPACTED_MEMORY_PREFIX}\n{summary}"),
            compacted_pass,
        );

        let original_len = history.len();
        history.splice(plan.first_content_index..slice_end, [replacement]);

        tracing::info!(
            entries_compacted = plan.count,
            original_history_length = original_len,
            resulting_history_length = history.len(),
            "Compacted history entries"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelResponse;
    use async_trait::async_trait;

    struct FixedSummary(String);

    #[async_trait]
    impl ModelClient for FixedSummary {
        async fn complete(&self, _request: ModelRequest) -> anyhow::Result<ModelResponse> {
            Ok(ModelResponse {
                content: self.0.clone(),
            })
        }
    }

    struct FailingClient;

    #[async_trait]
    impl ModelClient for FailingClient {
        async fn complete(&self, _request: ModelRequest) -> anyhow::Result<ModelResponse> {
            anyhow::bail!("summarizer offline")
        }
    }

    fn history_of(count: usize) -> Vec<HistoryEntry> {
        let mut history = vec![HistoryEntry::chat("system", "rules", 0)];
        for pass in 1..=count as u64 {
            history.push(HistoryEntry::chat("user", format!("entry {pass}"), pass));
        }
        history
    }

    fn compactor(client: impl ModelClient + 'static, threshold: f64) -> HistoryCompactor {
        HistoryCompactor::new(Arc::new(client), "gpt-4.1").with_usage_threshold(threshold)
    }

    #[tokio::test]
    async fn compacts_oldest_half_into_one_system_entry() {
        // 1 system + 4 content entries; half of 4 is 2.
        let mut history = history_of(4);
        let compacted = compactor(FixedSummary("the gist".to_string()), 0.0)
            .compact_if_needed(&mut history)
            .await;

        assert!(compacted);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "rules");
        assert_eq!(history[1].role, "system");
        assert!(history[1]
            .content
            .starts_with(COMPACTED_MEMORY_PREFIX));
        assert!(history[1].content.contains("the gist"));
        // Pass numbering of the synthetic entry matches the newest
        // compacted entry; the tail is untouched.
        assert_eq!(history[1].pass, 2);
        assert_eq!(history[2].content, "entry 3");
        assert_eq!(history[3].content, "entry 4");
    }

    #[tokio::test]
    async fn below_threshold_leaves_history_alone() {
        let mut history = history_of(4);
        let before = history.clone();

        let compacted = compactor(FixedSummary("unused".to_string()), 1.0)
            .compact_if_needed(&mut history)
            .await;

        assert!(!compacted);
        assert_eq!(history, before);
    }

    #[tokio::test]
    async fn empty_summary_leaves_history_alone() {
        let mut history = history_of(4);
        let before = history.clone();

        let compacted = compactor(FixedSummary("   ".to_string()), 0.0)
            .compact_if_needed(&mut history)
            .await;

        assert!(!compacted);
        assert_eq!(history, before);
    }

    #[tokio::test]
    async fn summarizer_failure_is_tolerated() {
        let mut history = history_of(4);
        let before = history.clone();

        let compacted = compactor(FailingClient, 0.0).compact_if_needed(&mut history).await;

        assert!(!compacted);
        assert_eq!(history, before);
    }

    #[tokio::test]
    async fn single_content_entry_is_never_compacted() {
        let mut history = history_of(1);
        let compacted = compactor(FixedSummary("gist".to_string()), 0.0)
            .compact_if_needed(&mut history)
            .await;
        assert!(!compacted);
    }
}
