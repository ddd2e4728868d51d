//! Locating the JSON object inside free-form model output.
//!
//! Models wrap their answer in prose or code fences, occasionally emit
//! syntactically broken JSON, and sometimes stop mid-object when they hit an
//! output limit. The rules are:
//!
//! - The first balanced `{...}` that parses as JSON wins. Balanced candidates
//!   that fail to parse are skipped whole and the scan resumes after them.
//! - A balanced candidate that is malformed (trailing commas, unescaped
//!   quotes) is never repaired. If nothing later parses, the first parse
//!   error is reported. A stray quote that swallows the closing `}` into a
//!   runaway string still counts as a complete object.
//! - An unclosed `{` that is not followed by a key is prose and is skipped.
//! - If the text ends inside an unclosed object, the output is treated as
//!   truncated: the tail is cut back to the last structural boundary and the
//!   open brackets are closed. The recovered object is flagged `truncated`.
//!   Recovery that keeps no field at all is a parse error.

use crate::error::{AnalysisError, Result};
use log::{debug, warn};
use serde_json::{Map, Value};

/// Upper bound on cut points tried when recovering a truncated object.
const MAX_REPAIR_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedJson {
    pub object: Map<String, Value>,
    /// The object was recovered from output that stopped mid-object.
    pub truncated: bool,
}

pub fn extract_json_object(raw: &str) -> Result<ExtractedJson> {
    let mut search_from = 0;
    let mut first_error: Option<String> = None;

    while let Some(offset) = raw[search_from..].find('{') {
        let start = search_from + offset;
        let end = match scan_object(raw, start) {
            Scan::Closed(end) => end,
            Scan::Unclosed { open_string } => {
                if let Some(end) = open_string.and_then(|quote| swallowed_close(raw, start, quote)) {
                    end
                } else if opens_object(&raw[start..]) {
                    return recover(&raw[start..], first_error);
                } else {
                    search_from = start + 1;
                    continue;
                }
            }
        };

        let candidate = &raw[start..end];
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(object)) => {
                return Ok(ExtractedJson {
                    object,
                    truncated: false,
                })
            }
            Ok(_) => {}
            Err(e) => {
                debug!(
                    "Skipping malformed JSON candidate at byte {} ({} bytes): {}",
                    start,
                    candidate.len(),
                    e
                );
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
        search_from = end;
    }

    match first_error {
        Some(e) => Err(AnalysisError::JsonParseError(e)),
        None => Err(AnalysisError::NoJsonFound),
    }
}

fn recover(text: &str, first_error: Option<String>) -> Result<ExtractedJson> {
    match recover_truncated(text) {
        Some(object) if !object.is_empty() => {
            warn!(
                "Model output ended inside a JSON object; recovered {} top-level field(s)",
                object.len()
            );
            Ok(ExtractedJson {
                object,
                truncated: true,
            })
        }
        _ => Err(AnalysisError::JsonParseError(first_error.unwrap_or_else(|| {
            "output ends inside a JSON object before any field is complete".to_string()
        }))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scan {
    /// Byte index one past the `}` closing the object.
    Closed(usize),
    /// The text ends first. `open_string` is where the string still open at
    /// the end of input begins, if any.
    Unclosed { open_string: Option<usize> },
}

/// Follows the object opened at `start`, ignoring string contents.
fn scan_object(raw: &str, start: usize) -> Scan {
    let mut depth = 0usize;
    let mut string_start: Option<usize> = None;
    let mut escaped = false;

    for (i, byte) in raw[start..].bytes().enumerate() {
        if string_start.is_some() {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => string_start = None,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => string_start = Some(start + i),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Closed(start + i + 1);
                }
            }
            _ => {}
        }
    }
    Scan::Unclosed {
        open_string: string_start,
    }
}

/// When the text ends inside a string opened at `quote`, finds a `}` past
/// that quote which closes the object if quotes are ignored. Such a string
/// is a stray quote inside a finished object, not a cut-off value.
fn swallowed_close(raw: &str, start: usize, quote: usize) -> Option<usize> {
    let mut depth = 0i64;
    for (i, byte) in raw[start..].bytes().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 && start + i > quote {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// A `{` that could start an object: a key or nothing follows it.
fn opens_object(text: &str) -> bool {
    let rest = text[1..].trim_start();
    rest.is_empty() || rest.starts_with('"')
}

#[derive(Debug, Clone, Copy)]
enum Cut {
    /// Keep everything before this byte (a separating comma).
    Before(usize),
    /// Keep everything up to and including this byte (an opening or closing bracket).
    After(usize),
}

/// Cuts the truncated text back to successive structural boundaries, newest
/// first, closes whatever is still open and returns the first object that parses.
fn recover_truncated(text: &str) -> Option<Map<String, Value>> {
    let mut cuts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b',' => cuts.push(Cut::Before(i)),
            b'{' | b'[' | b'}' | b']' => cuts.push(Cut::After(i)),
            _ => {}
        }
    }

    cuts.iter()
        .rev()
        .take(MAX_REPAIR_ATTEMPTS)
        .find_map(|cut| {
            let prefix = match *cut {
                Cut::Before(i) => &text[..i],
                Cut::After(i) => &text[..=i],
            };
            let closed = close_brackets(prefix.trim_end())?;
            match serde_json::from_str::<Value>(&closed) {
                Ok(Value::Object(object)) => Some(object),
                _ => None,
            }
        })
}

/// Appends the closers for every bracket still open at the end of `prefix`.
fn close_brackets(prefix: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for byte in prefix.bytes() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) {
                    return None;
                }
            }
            _ => {}
        }
    }
    if in_string || stack.is_empty() {
        return None;
    }

    let mut closed = String::with_capacity(prefix.len() + stack.len());
    closed.push_str(prefix);
    closed.extend(stack.iter().rev().map(|&b| b as char));
    Some(closed)
}
