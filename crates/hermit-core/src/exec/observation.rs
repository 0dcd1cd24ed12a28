//! Observation building
//!
//! Formats command results for two audiences at once: the structured
//! observation fed back to the model (filtered, truncated, exit code,
//! timestamp) and the render-ready preview for whichever UI is attached.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::plan::CommandDescriptor;

use super::CommandResult;

/// Combined stdout+stderr beyond this is considered corrupt output and
/// replaced wholesale rather than truncated.
const CORRUPT_OUTPUT_LIMIT_BYTES: usize = 50 * 1024;
const CORRUPT_OUTPUT_MARKER: &str = "!!!corrupt command, excessive output!!!";

const PREVIEW_MAX_LINES: usize = 30;
const PREVIEW_MAX_BYTES: usize = 4_096;

/// Structured record of a command's outcome, fed back to the model as a
/// history observation and attached to the plan step that ran it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Observation {
    pub observation_for_llm: Value,
    pub observation_metadata: Value,
}

impl Observation {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("observation serializes")
    }
}

/// Keep only lines matching the filter; an invalid pattern leaves the
/// text untouched.
fn apply_filter(text: &str, pattern: &str) -> String {
    let Ok(regex) = Regex::new(pattern) else {
        tracing::warn!(pattern, "Invalid filter_regex, leaving output unfiltered");
        return text.to_string();
    };

    text.lines()
        .filter(|line| regex.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep the last `count` lines.
fn tail_lines(text: &str, count: u64) -> String {
    if count == 0 {
        return text.to_string();
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let keep = count as usize;
    if lines.len() <= keep {
        return text.to_string();
    }
    lines[lines.len() - keep..].join("\n")
}

/// Tail-truncate to at most `max_bytes`, preserving UTF-8 boundaries.
fn tail_by_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("valid ansi pattern")
});

fn strip_ansi(text: &str) -> String {
    ANSI_PATTERN.replace_all(text, "").into_owned()
}

/// Render-ready preview: last lines within a byte cap, plus a notice when
/// content was dropped.
pub fn build_preview(text: &str) -> String {
    let stripped = strip_ansi(text);
    let total_lines = stripped.lines().count();

    let tailed = tail_lines(&stripped, PREVIEW_MAX_LINES as u64);
    let clipped = tail_by_bytes(&tailed, PREVIEW_MAX_BYTES);
    let shown_lines = clipped.lines().count();

    if shown_lines < total_lines || clipped.len() < stripped.len() {
        format!(
            "{}\n[preview: showing last {} of {} lines]",
            clipped, shown_lines, total_lines
        )
    } else {
        clipped.to_string()
    }
}

fn line_count(text: &str) -> u64 {
    if text.is_empty() {
        0
    } else {
        text.split('\n').count() as u64
    }
}

/// Build the observation and render preview for one executed command.
pub fn build_observation(
    command: &CommandDescriptor,
    result: &CommandResult,
) -> (Value, Observation) {
    let combined_bytes = result.stdout.len() + result.stderr.len();
    let exceeds_limit = combined_bytes > CORRUPT_OUTPUT_LIMIT_BYTES;

    let (filtered_stdout, filtered_stderr) = if exceeds_limit {
        (
            CORRUPT_OUTPUT_MARKER.to_string(),
            CORRUPT_OUTPUT_MARKER.to_string(),
        )
    } else {
        let mut stdout = result.stdout.clone();
        let mut stderr = result.stderr.clone();

        if let Some(pattern) = command.filter_regex.as_deref() {
            stdout = apply_filter(&stdout, pattern);
            stderr = apply_filter(&stderr, pattern);
        }

        if let Some(count) = command.tail_lines {
            stdout = tail_lines(&stdout, count);
            stderr = tail_lines(&stderr, count);
        }

        let max_bytes = command.max_bytes as usize;
        stdout = tail_by_bytes(&stdout, max_bytes).to_string();
        stderr = tail_by_bytes(&stderr, max_bytes).to_string();

        (stdout, stderr)
    };

    let truncated = exceeds_limit
        || filtered_stdout.len() < result.stdout.len()
        || filtered_stderr.len() < result.stderr.len()
        || command.tail_lines.is_some_and(|count| {
            line_count(&result.stdout) > count || line_count(&result.stderr) > count
        });

    // Oversized output is reported as a failure so the model does not
    // mistake the marker for a successful run.
    let exit_code = if exceeds_limit {
        Some(1)
    } else {
        result.exit_code
    };

    let mut for_llm = json!({
        "stdout": filtered_stdout,
        "stderr": filtered_stderr,
        "truncated": truncated,
    });
    if let Some(code) = exit_code {
        for_llm["exit_code"] = code.into();
    }

    let observation = Observation {
        observation_for_llm: for_llm,
        observation_metadata: json!({
            "runtime_ms": result.runtime_ms,
            "killed": result.killed,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    };

    let preview = json!({
        "stdout": filtered_stdout,
        "stderr": filtered_stderr,
        "stdoutPreview": build_preview(&filtered_stdout),
        "stderrPreview": build_preview(&filtered_stderr),
    });

    (preview, observation)
}

/// Observation recorded when a human declines a proposed command.
pub fn build_rejection_observation() -> Observation {
    Observation {
        observation_for_llm: json!({
            "canceled_by_human": true,
            "message": "Human declined to execute the proposed command and asked for an alternative approach without executing a command.",
        }),
        observation_metadata: json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    }
}

/// Observation recorded when an operation is canceled mid-flight.
pub fn build_cancellation_observation(reason: &str, message: &str) -> Observation {
    Observation {
        observation_for_llm: json!({
            "operation_canceled": true,
            "reason": reason,
            "message": message,
        }),
        observation_metadata: json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    }
}
