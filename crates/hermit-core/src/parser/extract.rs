//! Recovery helpers for malformed assistant JSON.

/// Escape bare (unescaped) line breaks found inside string literals.
/// Returns `None` when the text needed no repair.
pub fn escape_bare_line_breaks(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for ch in text.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_string => {
                out.push(ch);
                escaped = true;
            }
            '"' => {
                in_string = !in_string;
                out.push(ch);
            }
            '\n' if in_string => {
                out.push_str("\\n");
                changed = true;
            }
            '\r' if in_string => {
                out.push_str("\\r");
                changed = true;
            }
            _ => out.push(ch),
        }
    }

    changed.then_some(out)
}

/// Contents of the first fenced code block, if any.
pub fn extract_code_fence(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip the optional language tag up to the end of the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;

    let inner = body[..end].trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

/// First balanced `{…}` slice found by brace counting, string-aware.
pub fn extract_balanced_json(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }

    None
}
