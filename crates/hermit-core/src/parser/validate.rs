//! Schema and semantic validation for the resolved assistant payload.
//!
//! Schema checks cover shape (types of `message`, `plan`, `command`);
//! semantic checks cover what makes a plan entry usable — a resolvable
//! identity and an executable command while the step is still open.

use serde_json::Value;

use crate::plan::StepStatus;

/// Validation outcome: empty error list means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn command_has_payload(command: &Value) -> bool {
    let Value::Object(map) = command else {
        return false;
    };
    let run = map
        .get("run")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let shell = map
        .get("shell")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    !run.is_empty() || !shell.is_empty()
}

/// Shape validation over the normalized payload.
pub fn validate_schema(payload: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    let Value::Object(map) = payload else {
        return ValidationReport {
            errors: vec!["Assistant response must be a JSON object.".to_string()],
        };
    };

    match map.get("message") {
        None | Some(Value::Null) | Some(Value::String(_)) => {}
        Some(_) => errors.push("\"message\" must be a string when provided.".to_string()),
    }

    match map.get("plan") {
        None | Some(Value::Null) | Some(Value::Array(_)) => {}
        Some(_) => errors.push("\"plan\" must be an array.".to_string()),
    }

    match map.get("command") {
        None | Some(Value::Null) | Some(Value::Object(_)) => {}
        Some(_) => errors.push("\"command\" must be an object after normalization.".to_string()),
    }

    ValidationReport { errors }
}

fn validate_plan_entry(entry: &Value, path: &str, errors: &mut Vec<String>) {
    let Value::Object(map) = entry else {
        errors.push(format!("{path} must be an object."));
        return;
    };

    let id = map
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    let title = map
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");

    if id.is_empty() && title.is_empty() {
        errors.push(format!(
            "{path} needs a resolvable identity: provide a non-empty \"id\" or \"title\"."
        ));
    }

    let status = map
        .get("status")
        .and_then(Value::as_str)
        .map(StepStatus::parse_lenient)
        .unwrap_or_default();

    match map.get("command") {
        None | Some(Value::Null) => {
            if !status.is_terminal() {
                errors.push(format!(
                    "{path} requires a non-empty command while the step is open."
                ));
            }
        }
        Some(command @ Value::Object(_)) => {
            if !command_has_payload(command) {
                if status.is_terminal() {
                    errors.push(format!(
                        "{path}.command must include execution details when provided."
                    ));
                } else {
                    errors.push(format!(
                        "{path} requires a non-empty command while the step is open."
                    ));
                }
            }
        }
        Some(_) => errors.push(format!("{path}.command must be an object when present.")),
    }
}

/// Semantic validation of the plan entries.
pub fn validate_semantics(payload: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    if let Some(Value::Array(plan)) = payload.get("plan") {
        for (index, entry) in plan.iter().enumerate() {
            validate_plan_entry(entry, &format!("plan[{index}]"), &mut errors);
        }
    }

    ValidationReport { errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_message_payload() {
        let payload = json!({"message": "ok"});
        assert!(validate_schema(&payload).is_valid());
        assert!(validate_semantics(&payload).is_valid());
    }

    #[test]
    fn rejects_non_string_message() {
        let report = validate_schema(&json!({"message": 42}));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("message"));
    }

    #[test]
    fn rejects_non_array_plan() {
        let report = validate_schema(&json!({"message": "ok", "plan": "soon"}));
        assert!(!report.is_valid());
    }

    #[test]
    fn open_step_without_command_is_invalid() {
        let report = validate_semantics(&json!({
            "plan": [{"id": "a", "title": "do it", "status": "pending"}],
        }));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("requires a non-empty command"));
    }

    #[test]
    fn terminal_step_without_command_is_valid() {
        let report = validate_semantics(&json!({
            "plan": [{"id": "a", "title": "done", "status": "completed"}],
        }));
        assert!(report.is_valid());
    }

    #[test]
    fn entry_without_identity_is_invalid() {
        let report = validate_semantics(&json!({
            "plan": [{"status": "completed"}],
        }));
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("resolvable identity"));
    }

    #[test]
    fn title_alone_is_a_resolvable_identity() {
        let report = validate_semantics(&json!({
            "plan": [{
                "title": "inspect logs",
                "status": "pending",
                "command": {"run": "tail log.txt"},
            }],
        }));
        assert!(report.is_valid());
    }
}
