//! Component A: pulling a JSON result out of an LLM's free-text response.
//!
//! Grounded on `original_source/app/utils/utils.py`'s `response_parser`:
//! try a fenced code block first, then scan for a balanced `{`/`[` span,
//! then fall back to parsing the whole trimmed string.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::prelude::*;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex is valid")
});

/// Parse a JSON value out of an LLM's free-text output.
///
/// Returns `None` (never an error) when nothing parseable could be found,
/// matching the original's "never crash on a bad response" behavior.
pub fn parse_llm_response(output_text: &str) -> Option<Value> {
    let trimmed = output_text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(captures) = FENCED_BLOCK.captures(trimmed) {
        let candidate = captures.get(1)?.as_str().trim();
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
    }

    if let Some(value) = parse_balanced_span(trimmed) {
        return Some(value);
    }

    serde_json::from_str(trimmed).ok()
}

/// Scan for the first `{` or `[` and try to parse a balanced-bracket span
/// starting there, extending the span if a shorter one fails to parse (the
/// original does this implicitly by scanning to the matching close
/// bracket; we do the equivalent by depth-tracking every opener we pass).
fn parse_balanced_span(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    for (i, &byte) in bytes.iter().enumerate() {
        let opener = byte == b'{' || byte == b'[';
        if opener && start.is_none() {
            start = Some(i);
        }
        if let Some(begin) = start {
            if let Some(value) = try_balanced_from(text, begin, i, byte) {
                return Some(value);
            }
        }
    }
    None
}

fn try_balanced_from(text: &str, begin: usize, _first: usize, _opener: u8) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for i in begin..bytes.len() {
        let byte = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[begin..=i];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
