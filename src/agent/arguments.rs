//! Bounded repair of model-emitted tool arguments.
//!
//! Models occasionally emit almost-JSON: trailing commas, single quotes,
//! literal newlines inside strings. The repair pass is a fixed set of
//! syntax-only substitutions; it never guesses at meaning. Text that
//! still does not parse as a JSON object becomes an empty argument map,
//! letting schema validation report the real problem.

use serde_json::{Map, Value};
use tracing::debug;

pub fn parse_tool_arguments(raw: &str) -> Map<String, Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Map::new();
    }
    if let Some(map) = parse_object(trimmed) {
        return map;
    }
    let repaired = repair_json(trimmed);
    if let Some(map) = parse_object(&repaired) {
        debug!("Repaired malformed tool arguments");
        return map;
    }
    debug!("Unparseable tool arguments, substituting an empty map");
    Map::new()
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn repair_json(text: &str) -> String {
    // Single-quoted JSON is only rewritten when no double quote appears
    // anywhere, so a legitimate apostrophe inside a properly quoted
    // string is never touched.
    let text = if text.contains('"') {
        text.to_string()
    } else {
        text.replace('\'', "\"")
    };

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            match ch {
                '"' => {
                    out.push(ch);
                    in_string = true;
                }
                '}' | ']' => {
                    while out.ends_with(|c: char| c.is_whitespace()) {
                        out.pop();
                    }
                    if out.ends_with(',') {
                        out.pop();
                    }
                    out.push(ch);
                }
                _ => out.push(ch),
            }
        }
    }
    out
}
