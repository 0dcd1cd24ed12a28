//! Response resolution pipeline
//!
//! Turns raw model output into a validated, normalized
//! `{message, plan, command}` payload. Parsing tries a list of recovery
//! strategies in order — first success wins, every failure is recorded
//! for diagnostics — then the payload is normalized and run through
//! schema and semantic validation.

mod command;
mod extract;
mod plan;
mod validate;

pub use command::normalize_command_value;
pub use plan::normalize_plan_value;
pub use validate::{validate_schema, validate_semantics, ValidationReport};

use serde_json::Value;

use crate::plan::{CommandDescriptor, PlanStep};
use extract::{escape_bare_line_breaks, extract_balanced_json, extract_code_fence};

/// How the raw text was recovered into parseable JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Direct,
    EscapedNewlines,
    CodeFence,
    BalancedSlice,
}

impl RecoveryStrategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::EscapedNewlines => "escaped newlines",
            Self::CodeFence => "code fence",
            Self::BalancedSlice => "balanced slice",
        }
    }
}

/// One failed strategy, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ParseAttempt {
    pub strategy: RecoveryStrategy,
    pub error: String,
}

/// Successfully parsed and normalized payload, still value-typed.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub value: Value,
    pub strategy: RecoveryStrategy,
    pub attempts: Vec<ParseAttempt>,
}

/// All strategies failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ParseFailure {
    pub message: String,
    pub attempts: Vec<ParseAttempt>,
}

fn normalize_payload(mut value: Value) -> Value {
    if let Value::Object(ref mut map) = value {
        if let Some(command) = map.get("command") {
            let normalized = normalize_command_value(command);
            map.insert("command".to_string(), normalized);
        }
        if let Some(plan) = map.get("plan") {
            if plan.is_array() {
                let normalized = normalize_plan_value(plan);
                map.insert("plan".to_string(), normalized);
            }
        }
    }
    value
}

fn attempt(
    text: &str,
    strategy: RecoveryStrategy,
    attempts: &mut Vec<ParseAttempt>,
) -> Option<ParsedResponse> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(ParsedResponse {
            value: normalize_payload(value),
            strategy,
            attempts: attempts.clone(),
        }),
        Err(err) => {
            attempts.push(ParseAttempt {
                strategy,
                error: err.to_string(),
            });
            None
        }
    }
}

/// Parse raw model output, trying each recovery strategy in order.
///
/// Re-parsing the same text always yields the same normalized value and
/// the same winning strategy.
pub fn parse_assistant_response(raw: &str) -> Result<ParsedResponse, ParseFailure> {
    let trimmed = raw.trim();
    let mut attempts = Vec::new();

    if trimmed.is_empty() {
        return Err(ParseFailure {
            message: "Assistant response was empty or missing.".to_string(),
            attempts,
        });
    }

    if let Some(parsed) = attempt(trimmed, RecoveryStrategy::Direct, &mut attempts) {
        return Ok(parsed);
    }

    if let Some(repaired) = escape_bare_line_breaks(trimmed) {
        if let Some(parsed) = attempt(&repaired, RecoveryStrategy::EscapedNewlines, &mut attempts) {
            return Ok(parsed);
        }
    }

    if let Some(fenced) = extract_code_fence(trimmed) {
        if let Some(parsed) = attempt(&fenced, RecoveryStrategy::CodeFence, &mut attempts) {
            return Ok(parsed);
        }
    }

    if let Some(sliced) = extract_balanced_json(trimmed) {
        if let Some(parsed) = attempt(&sliced, RecoveryStrategy::BalancedSlice, &mut attempts) {
            return Ok(parsed);
        }
    }

    let mut message = "Failed to parse assistant JSON response.".to_string();
    if let Some(first) = attempts.first() {
        message.push(' ');
        message.push_str(&first.error);
    }

    Err(ParseFailure { message, attempts })
}

/// Typed projection of the validated payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantPayload {
    pub message: String,
    pub plan: Option<Vec<PlanStep>>,
    pub command: Option<CommandDescriptor>,
}

impl AssistantPayload {
    /// Extract the typed payload from a normalized, validated value.
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let plan = match value.get("plan") {
            Some(Value::Array(entries)) => Some(
                entries
                    .iter()
                    .map(|entry| serde_json::from_value(entry.clone()))
                    .collect::<Result<Vec<PlanStep>, _>>()?,
            ),
            _ => None,
        };

        let command = match value.get("command") {
            Some(command @ Value::Object(_)) => Some(serde_json::from_value(command.clone())?),
            _ => None,
        };

        Ok(Self {
            message,
            plan,
            command,
        })
    }
}

/// Outcome of the full resolution pipeline. `canceled` is observed at the
/// model-request layer and reported by the pass executor; every other
/// branch callers must handle lives here.
#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    Resolved {
        payload: AssistantPayload,
        strategy: RecoveryStrategy,
    },
    /// No usable text came back from the model.
    MissingContent,
    /// Every recovery strategy failed to produce JSON.
    ParseFailed {
        message: String,
        attempts: Vec<ParseAttempt>,
    },
    /// Parsed, but the payload violates the schema or plan semantics.
    SchemaFailed { errors: Vec<String> },
}

/// Run parse → normalize → schema validation → semantic validation.
pub fn resolve_assistant_response(raw: &str) -> ResolutionOutcome {
    if raw.trim().is_empty() {
        return ResolutionOutcome::MissingContent;
    }

    let parsed = match parse_assistant_response(raw) {
        Ok(parsed) => parsed,
        Err(failure) => {
            return ResolutionOutcome::ParseFailed {
                message: failure.message,
                attempts: failure.attempts,
            }
        }
    };

    let schema = validate_schema(&parsed.value);
    if !schema.is_valid() {
        return ResolutionOutcome::SchemaFailed {
            errors: schema.errors,
        };
    }

    let semantics = validate_semantics(&parsed.value);
    if !semantics.is_valid() {
        return ResolutionOutcome::SchemaFailed {
            errors: semantics.errors,
        };
    }

    match AssistantPayload::from_value(&parsed.value) {
        Ok(payload) => ResolutionOutcome::Resolved {
            payload,
            strategy: parsed.strategy,
        },
        Err(err) => ResolutionOutcome::SchemaFailed {
            errors: vec![err.to_string()],
        },
    }
}
