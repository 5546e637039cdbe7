//! Tolerant JSON extraction from model output.
//!
//! Providers without a JSON mode are instructed to emit JSON only, but
//! still wrap it in code fences, leave trailing commas, or truncate the
//! tail. The repair pass handles those; anything worse is a contract
//! error.

use serde_json::Value;

use crate::error::{Error, Result};

/// Parse model output as JSON, repairing common damage first.
pub fn parse_model_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let repaired = repair(trimmed);
    serde_json::from_str::<Value>(&repaired).map_err(|e| {
        Error::LlmContract(format!(
            "output is not JSON after repair ({e}); first 200 bytes: {}",
            &trimmed.chars().take(200).collect::<String>()
        ))
    })
}

fn repair(text: &str) -> String {
    let unfenced = strip_code_fences(text);
    let sliced = slice_to_outer_value(&unfenced);
    let no_trailing = remove_trailing_commas(&sliced);
    balance_brackets(&no_trailing)
}

fn strip_code_fences(text: &str) -> String {
    let mut out = text.trim();
    if let Some(start) = out.find("```") {
        out = &out[start + 3..];
        // Drop an optional language tag on the fence line.
        if let Some(newline) = out.find('\n') {
            let tag = &out[..newline];
            if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
                out = &out[newline + 1..];
            }
        }
        if let Some(end) = out.rfind("```") {
            out = &out[..end];
        }
    }
    out.trim().to_string()
}

fn slice_to_outer_value(text: &str) -> String {
    let open = text.find(['{', '[']);
    let close = text.rfind(['}', ']']);
    match (open, close) {
        (Some(o), Some(c)) if c > o => text[o..=c].to_string(),
        (Some(o), _) => text[o..].to_string(),
        _ => text.to_string(),
    }
}

/// Remove `,` immediately preceding `}` or `]`, outside strings.
fn remove_trailing_commas(text: &str) -> String {
    let bytes: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = bytes[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Append closers for any brackets left open, e.g. on truncated output.
fn balance_brackets(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn clean_json_passes_through() {
        let value = parse_model_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn strips_code_fences() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        assert_eq!(parse_model_json(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn removes_trailing_commas() {
        let text = r#"{"items": [1, 2, 3,], "b": {"c": 1,},}"#;
        assert_eq!(
            parse_model_json(text).unwrap(),
            json!({"items": [1, 2, 3], "b": {"c": 1}})
        );
    }

    #[test]
    fn preserves_commas_inside_strings() {
        let text = r#"{"note": "a, b, c,"}"#;
        assert_eq!(parse_model_json(text).unwrap(), json!({"note": "a, b, c,"}));
    }

    #[test]
    fn balances_truncated_output() {
        let text = r#"{"selectors": {"nav_container": "nav""#;
        let value = parse_model_json(text).unwrap();
        assert_eq!(value["selectors"]["nav_container"], "nav");
    }

    #[test]
    fn prose_around_object_is_sliced_away() {
        let text = "The strategy is {\"navigation_type\": \"grid\"} as requested.";
        assert_eq!(
            parse_model_json(text).unwrap(),
            json!({"navigation_type": "grid"})
        );
    }

    #[test]
    fn garbage_is_a_contract_error() {
        let err = parse_model_json("I cannot determine the structure.").unwrap_err();
        assert!(matches!(err, Error::LlmContract(_)));
    }
}
