//! JSON extraction utilities for parsing model replies.
//!
//! Local reasoning models often wrap their answer in `<think>` blocks,
//! markdown fences or prose. The extraction tries, in order:
//! 1. The whole reply, after stripping reasoning blocks
//! 2. A fenced code block (```json or generic)
//! 3. The largest balanced array anywhere, preferring later ones
//! 4. An object whose first array-valued field holds the items
//!
//! # Example
//!
//! ```
//! use qa_forge::utils::json_extraction::extract_json_array;
//!
//! let reply = "Sure!\n```json\n[{\"question\": \"Q?\", \"answer\": \"A.\"}]\n```";
//! let items = extract_json_array(reply).unwrap();
//! assert_eq!(items.len(), 1);
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_brackets} unclosed brackets, {unclosed_braces} unclosed braces. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    #[error("No JSON array found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Depth counters left over after scanning a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonStructureAnalysis {
    pub unclosed_braces: usize,
    pub unclosed_brackets: usize,
    pub in_string: bool,
}

impl JsonStructureAnalysis {
    pub fn is_truncated(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

/// Scans `s` and reports unbalanced structure, ignoring string contents.
pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut braces: isize = 0;
    let mut brackets: isize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for c in s.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => braces += 1,
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: braces.max(0) as usize,
        unclosed_brackets: brackets.max(0) as usize,
        in_string,
    }
}

/// Finds the index of the delimiter closing the one `s` starts with.
///
/// Handles nesting, string literals and escape sequences.
pub fn find_matching_close(s: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Removes `<think>...</think>` blocks, and an unterminated leading one.
pub fn strip_reasoning(content: &str) -> String {
    let Some(closed) = think_block_regex() else {
        return content.to_string();
    };
    let stripped = closed.replace_all(content, "");
    match stripped.find("</think>") {
        // Some servers drop the opening tag.
        Some(end) => stripped[end + "</think>".len()..].trim().to_string(),
        None => stripped.trim().to_string(),
    }
}

/// Returns the body of the first fenced code block that looks like JSON.
pub fn extract_from_code_block(content: &str) -> Option<String> {
    code_block_regex()?
        .captures_iter(content)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .find(|body| body.starts_with('[') || body.starts_with('{'))
}

fn think_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").ok())
        .as_ref()
}

fn code_block_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json|JSON)?[^\n]*\n([\s\S]*?)```").ok())
        .as_ref()
}

/// Largest valid array in `content`; later wins among equal sizes.
pub fn extract_last_valid_array(content: &str) -> Option<Vec<Value>> {
    let mut best: Option<(usize, usize, Vec<Value>)> = None;

    for (start, _) in content.char_indices().filter(|(_, c)| *c == '[') {
        let substr = &content[start..];
        let Some(end) = find_matching_close(substr, '[', ']') else {
            continue;
        };
        let candidate = &substr[..=end];
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(candidate) {
            let better = match &best {
                Some((len, pos, _)) => candidate.len() > *len || (candidate.len() == *len && start > *pos),
                None => true,
            };
            if better {
                best = Some((candidate.len(), start, items));
            }
        }
    }

    best.map(|(_, _, items)| items)
}

/// Parses `candidate` as an array, or as an object wrapping one.
fn parse_items(candidate: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(candidate).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.into_iter().find_map(|(_, v)| match v {
            Value::Array(items) => Some(items),
            _ => None,
        }),
        _ => None,
    }
}

/// Extracts the array of items from a model reply.
pub fn extract_json_array(content: &str) -> Result<Vec<Value>, JsonExtractionError> {
    let cleaned = strip_reasoning(content);
    let trimmed = cleaned.trim();

    if let Some(items) = parse_items(trimmed) {
        return Ok(items);
    }

    if let Some(block) = extract_from_code_block(trimmed) {
        if let Some(items) = parse_items(&block) {
            return Ok(items);
        }
    }

    if let Some(items) = extract_last_valid_array(trimmed) {
        return Ok(items);
    }

    if let Some(start) = trimmed.find('{') {
        if let Some(end) = find_matching_close(&trimmed[start..], '{', '}') {
            if let Some(items) = parse_items(&trimmed[start..=start + end]) {
                return Ok(items);
            }
        }
    }

    if let Some(start) = trimmed.find('[') {
        let partial = &trimmed[start..];
        let analysis = analyze_json_structure(partial);
        if analysis.is_truncated() {
            return Err(JsonExtractionError::Truncated {
                partial_preview: partial.chars().take(100).collect(),
                unclosed_braces: analysis.unclosed_braces,
                unclosed_brackets: analysis.unclosed_brackets,
            });
        }
    }

    Err(JsonExtractionError::NotFound {
        content_preview: trimmed.chars().take(50).collect(),
    })
}
