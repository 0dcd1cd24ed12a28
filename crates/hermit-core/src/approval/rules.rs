//! Command safety screen and per-executable argument rules.
//!
//! The allowlist only ever matches a single plain invocation: anything
//! that chains, pipes, substitutes, redirects, or escalates is pushed to
//! the human instead.

use once_cell::sync::Lazy;
use regex::Regex;

static FORBIDDEN_SHELL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r";|&&|\|\|",        // command chaining / logical operators
        r"\|",               // pipes
        r"`",                // legacy command substitution
        r"\$\(",             // modern command substitution
        r"<\s*\(",           // process substitution
        r">\s*\(",           // output process substitution
        r"(^|[^&])&([^&]|$)", // background execution with a single ampersand
        r"<<",               // here-documents (covers here-strings too)
        r"&>",               // redirect-all
        r"(^|\s)[0-9]*>>?\s", // file redirections
        r"[0-9]?>&[0-9]?",   // fd duplication
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid safety pattern"))
    .collect()
});

static SUDO_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*sudo\b").expect("valid sudo pattern"));

/// Lightweight screen rejecting obviously unsafe shell invocations.
pub fn is_command_string_safe(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }

    if trimmed.contains('\n') || trimmed.contains('\r') {
        return false;
    }

    if FORBIDDEN_SHELL_PATTERNS.iter().any(|re| re.is_match(trimmed)) {
        return false;
    }

    !SUDO_PATTERN.is_match(trimmed)
}

fn joined_args(tokens: &[String]) -> String {
    format!(" {} ", tokens[1..].join(" "))
}

fn has_output_file(tokens: &[String], option: &str) -> bool {
    for (index, token) in tokens.iter().enumerate().skip(1) {
        if token == option {
            let destination = tokens.get(index + 1).map(String::as_str).unwrap_or("");
            return destination != "-";
        }
    }
    false
}

fn has_short_output_assignment(tokens: &[String], prefix: &str) -> bool {
    tokens
        .iter()
        .skip(1)
        .any(|token| token.starts_with(prefix) && token.len() > prefix.len())
}

fn validate_sed(tokens: &[String]) -> bool {
    static IN_PLACE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(^|\s)-i(\b|\s)").expect("valid sed pattern"));
    !IN_PLACE.is_match(&joined_args(tokens))
}

fn validate_find(tokens: &[String]) -> bool {
    let joined = joined_args(tokens);
    !joined.contains(" -exec") && !joined.contains(" -delete")
}

fn validate_curl(tokens: &[String]) -> bool {
    static MUTATING_METHOD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(^|\s)-X\s*(POST|PUT|PATCH|DELETE)\b").expect("valid curl pattern")
    });
    static DATA_FLAGS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(^|\s)(--data(-binary|-raw|-urlencode)?|-d|--form|-F|--upload-file|-T)\b")
            .expect("valid curl pattern")
    });
    static REMOTE_NAME: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(^|\s)(-O|--remote-name|--remote-header-name)\b").expect("valid curl pattern")
    });

    let joined = joined_args(tokens);
    if MUTATING_METHOD.is_match(&joined) || DATA_FLAGS.is_match(&joined) {
        return false;
    }
    if REMOTE_NAME.is_match(&joined) {
        return false;
    }
    if has_output_file(tokens, "-o") || has_output_file(tokens, "--output") {
        return false;
    }
    !has_short_output_assignment(tokens, "-o")
}

fn validate_wget(tokens: &[String]) -> bool {
    if joined_args(tokens).contains(" --spider") {
        return true;
    }
    if has_output_file(tokens, "-O") || has_output_file(tokens, "--output-document") {
        return false;
    }
    !has_short_output_assignment(tokens, "-O")
}

fn validate_ping(tokens: &[String]) -> bool {
    let Some(flag_index) = tokens.iter().position(|token| token == "-c") else {
        return false;
    };
    let Some(count) = tokens
        .get(flag_index + 1)
        .and_then(|raw| raw.parse::<i64>().ok())
    else {
        return false;
    };
    (1..=3).contains(&count)
}

/// Per-executable argument rules; commands without a rule pass through.
pub fn validate_command_specific_args(base: &str, tokens: &[String]) -> bool {
    match base {
        "sed" => validate_sed(tokens),
        "find" => validate_find(tokens),
        "curl" => validate_curl(tokens),
        "wget" => validate_wget(tokens),
        "ping" => validate_ping(tokens),
        _ => true,
    }
}
