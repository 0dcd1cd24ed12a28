//! Command payload normalization
//!
//! The model hands back commands as a bare string, an array of tokens, or
//! an object — sometimes with the executable tucked inside a nested `run`
//! or `shell` sub-object. Everything funnels into the canonical
//! [`CommandDescriptor`] shape before approval or execution sees it.

use serde_json::{Map, Value};

use crate::plan::DEFAULT_COMMAND_MAX_BYTES;

/// Keys that may carry the command line, in precedence order.
const RUN_KEYS: [&str; 4] = ["run", "command", "cmd", "command_line"];

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn first_run_candidate(map: &Map<String, Value>) -> Option<String> {
    RUN_KEYS
        .iter()
        .find_map(|key| non_empty_string(map.get(*key)))
}

/// Stringify one array token the way the upstream protocol expects:
/// strings are trimmed, scalars are rendered, null disappears.
fn token_to_string(token: &Value) -> String {
    match token {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

fn strip_command_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !RUN_KEYS.contains(&key.as_str()) && key.as_str() != "shell")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn apply_defaults(mut map: Map<String, Value>) -> Value {
    let valid_max_bytes = map
        .get("max_bytes")
        .and_then(Value::as_u64)
        .is_some_and(|bytes| bytes >= 1);
    if !valid_max_bytes {
        map.insert("max_bytes".to_string(), DEFAULT_COMMAND_MAX_BYTES.into());
    }
    Value::Object(map)
}

fn normalize_object(map: &Map<String, Value>) -> Value {
    // Nested form: the executable lives inside a `run` or `shell`
    // sub-object; flatten it over the carrier keys.
    let nested = ["run", "shell"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_object));

    let mut normalized = strip_command_keys(map);
    let mut run = None;
    let mut shell = None;

    if let Some(nested_map) = nested {
        for (key, value) in strip_command_keys(nested_map) {
            normalized.insert(key, value);
        }
        run = first_run_candidate(nested_map).or_else(|| first_run_candidate(map));
        shell = non_empty_string(nested_map.get("shell"));
    }

    let run = run.or_else(|| first_run_candidate(map));
    let shell = shell.or_else(|| non_empty_string(map.get("shell")));

    if let Some(run) = run {
        if let Some(shell) = shell.filter(|shell| *shell != run) {
            normalized.insert("shell".to_string(), Value::String(shell));
        }
        normalized.insert("run".to_string(), Value::String(run));
    } else if let Some(shell) = shell {
        // A lone shell string is the command line itself.
        normalized.insert("run".to_string(), Value::String(shell));
    }

    apply_defaults(normalized)
}

/// Coerce any accepted command form into the canonical object shape.
/// Non-command types (numbers, booleans) pass through untouched for the
/// schema validator to reject.
pub fn normalize_command_value(command: &Value) -> Value {
    match command {
        Value::String(raw) => {
            let trimmed = raw.trim();
            let mut map = Map::new();
            if !trimmed.is_empty() {
                map.insert("run".to_string(), Value::String(trimmed.to_string()));
            }
            apply_defaults(map)
        }
        Value::Array(tokens) => {
            let joined = tokens
                .iter()
                .map(token_to_string)
                .filter(|token| !token.is_empty())
                .collect::<Vec<_>>()
                .join(" ");

            let mut map = Map::new();
            if !joined.is_empty() {
                map.insert("run".to_string(), Value::String(joined));
            }
            apply_defaults(map)
        }
        Value::Object(map) => normalize_object(map),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CommandDescriptor;
    use serde_json::json;

    fn descriptor(value: Value) -> CommandDescriptor {
        serde_json::from_value(normalize_command_value(&value)).unwrap()
    }

    #[test]
    fn string_form_trims_into_run() {
        let command = descriptor(json!("  cargo test  "));
        assert_eq!(command.run, "cargo test");
        assert_eq!(command.max_bytes, DEFAULT_COMMAND_MAX_BYTES);
    }

    #[test]
    fn blank_string_yields_empty_payload() {
        let command = descriptor(json!("   "));
        assert!(!command.has_payload());
    }

    #[test]
    fn array_form_joins_tokens() {
        let command = descriptor(json!(["git", " status ", null, "", 42]));
        assert_eq!(command.run, "git status 42");
    }

    #[test]
    fn flat_object_prefers_run_over_aliases() {
        let command = descriptor(json!({
            "run": "echo primary",
            "cmd": "echo alias",
            "command_line": "echo other",
        }));
        assert_eq!(command.run, "echo primary");
    }

    #[test]
    fn alias_keys_fill_in_when_run_is_missing() {
        let command = descriptor(json!({"cmd": "echo alias"}));
        assert_eq!(command.run, "echo alias");

        let command = descriptor(json!({"command": "echo named"}));
        assert_eq!(command.run, "echo named");
    }

    #[test]
    fn lone_shell_string_becomes_run() {
        let command = descriptor(json!({"shell": "echo via-shell"}));
        assert_eq!(command.run, "echo via-shell");
        assert_eq!(command.shell, None);
    }

    #[test]
    fn nested_run_object_is_flattened() {
        let command = descriptor(json!({
            "run": {"command": "make build", "timeout_sec": 120},
            "cwd": "/repo",
        }));
        assert_eq!(command.run, "make build");
        assert_eq!(command.cwd.as_deref(), Some("/repo"));
        assert_eq!(command.timeout_sec, Some(120));
    }

    #[test]
    fn nested_shell_object_keeps_distinct_shell() {
        let command = descriptor(json!({
            "shell": {"run": "ls -la", "shell": "bash"},
        }));
        assert_eq!(command.run, "ls -la");
        assert_eq!(command.shell.as_deref(), Some("bash"));
    }

    #[test]
    fn invalid_max_bytes_is_replaced_by_default() {
        let command = descriptor(json!({"run": "echo hi", "max_bytes": 0}));
        assert_eq!(command.max_bytes, DEFAULT_COMMAND_MAX_BYTES);

        let command = descriptor(json!({"run": "echo hi", "max_bytes": "lots"}));
        assert_eq!(command.max_bytes, DEFAULT_COMMAND_MAX_BYTES);

        let command = descriptor(json!({"run": "echo hi", "max_bytes": 2048}));
        assert_eq!(command.max_bytes, 2048);
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = json!({"cmd": "echo twice", "tail_lines": 10});
        let once = normalize_command_value(&raw);
        let twice = normalize_command_value(&once);
        assert_eq!(once, twice);
    }
}
