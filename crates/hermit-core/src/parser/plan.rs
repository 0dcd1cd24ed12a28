//! Plan entry normalization
//!
//! Defaults loosely-typed incoming plan entries before validation: ids and
//! dependency references are string-coerced, unknown statuses fold to
//! `pending`, and step commands go through the same coercion as the
//! top-level command payload.

use serde_json::{Map, Value};

use super::command::normalize_command_value;
use crate::plan::StepStatus;

fn coerce_identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_status(entry: &Map<String, Value>) -> Value {
    let folded = entry
        .get("status")
        .and_then(Value::as_str)
        .map(StepStatus::parse_lenient)
        .unwrap_or_default();

    serde_json::to_value(folded).expect("status serializes")
}

/// Normalize a dependency array: trim and string-coerce each entry, drop
/// empties. Duplicates and self-references are preserved — collapsing
/// them is the state machine's job, not the parser's.
fn normalize_waiting_for(value: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(entries)) = value else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(coerce_identifier)
        .map(Value::String)
        .collect()
}

fn normalize_priority(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Number(n)) => Some(Value::Number(n.clone())),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite())
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

fn normalize_entry(entry: &Value) -> Value {
    let Value::Object(map) = entry else {
        return entry.clone();
    };

    let mut normalized = map.clone();

    if let Some(id) = map.get("id").and_then(coerce_identifier) {
        normalized.insert("id".to_string(), Value::String(id));
    } else {
        normalized.remove("id");
    }

    normalized.insert("status".to_string(), normalize_status(map));
    normalized.insert(
        "waitingForId".to_string(),
        Value::Array(normalize_waiting_for(map.get("waitingForId"))),
    );

    match normalize_priority(map.get("priority")) {
        Some(priority) => {
            normalized.insert("priority".to_string(), priority);
        }
        None => {
            normalized.remove("priority");
        }
    }

    if let Some(command) = map.get("command") {
        if !command.is_null() {
            normalized.insert("command".to_string(), normalize_command_value(command));
        } else {
            normalized.remove("command");
        }
    }

    Value::Object(normalized)
}

/// Normalize every entry of an incoming plan array.
pub fn normalize_plan_value(plan: &Value) -> Value {
    match plan {
        Value::Array(entries) => Value::Array(entries.iter().map(normalize_entry).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn folds_unknown_status_to_pending() {
        let plan = normalize_plan_value(&json!([{"id": "a", "status": "doing-it"}]));
        assert_eq!(plan[0]["status"], "pending");
    }

    #[test]
    fn coerces_numeric_ids_and_dependencies() {
        let plan = normalize_plan_value(&json!([
            {"id": 7, "waitingForId": [3, " b ", "", null]},
        ]));
        assert_eq!(plan[0]["id"], "7");
        assert_eq!(plan[0]["waitingForId"], json!(["3", "b"]));
    }

    #[test]
    fn preserves_duplicate_and_self_references() {
        let plan = normalize_plan_value(&json!([
            {"id": "a", "waitingForId": ["a", "b", "b"]},
        ]));
        assert_eq!(plan[0]["waitingForId"], json!(["a", "b", "b"]));
    }

    #[test]
    fn normalizes_step_commands() {
        let plan = normalize_plan_value(&json!([
            {"id": "a", "command": "cargo check"},
        ]));
        assert_eq!(plan[0]["command"]["run"], "cargo check");
    }

    #[test]
    fn numeric_string_priority_becomes_number() {
        let plan = normalize_plan_value(&json!([
            {"id": "a", "priority": " 2 "},
            {"id": "b", "priority": "high"},
        ]));
        assert_eq!(plan[0]["priority"], json!(2.0));
        assert!(plan[1].get("priority").is_none());
    }
}
