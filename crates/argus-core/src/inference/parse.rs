//! Typed results parsed out of free-form model output.
//!
//! Models wrap JSON in markdown fences, prepend prose, or nest the payload one
//! level deep. Parsing tries a small, deterministic set of candidates and then
//! checks required fields before deserializing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{InferenceError, Result};
use crate::domain::VulnerabilityRecord;

const MAX_CANDIDATES: usize = 8;

/// A result type with a name and a set of required, non-empty string fields.
pub trait StructuredResult: DeserializeOwned {
    const OPERATION: &'static str;
    const REQUIRED: &'static [&'static str];
}

/// Findings for one scan batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ScanResult {
    pub vulnerabilities: Vec<VulnerabilityRecord>,
}

impl<'de> Deserialize<'de> for ScanResult {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Either a bare array or `{"vulnerabilities": [...]}`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            List(Vec<VulnerabilityRecord>),
            Wrapped {
                vulnerabilities: Vec<VulnerabilityRecord>,
            },
        }

        Ok(match Shape::deserialize(deserializer)? {
            Shape::List(vulnerabilities) | Shape::Wrapped { vulnerabilities } => {
                Self { vulnerabilities }
            }
        })
    }
}

impl StructuredResult for ScanResult {
    const OPERATION: &'static str = "scan";
    const REQUIRED: &'static [&'static str] = &[];
}

/// Reproduction test plus the fixed file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResult {
    pub reproduction_test_code: String,
    pub fixed_code: String,
}

impl StructuredResult for PatchResult {
    const OPERATION: &'static str = "patch";
    const REQUIRED: &'static [&'static str] = &["reproduction_test_code", "fixed_code"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploitResult {
    pub exploit_code: String,
}

impl StructuredResult for ExploitResult {
    const OPERATION: &'static str = "exploit";
    const REQUIRED: &'static [&'static str] = &["exploit_code"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphResult {
    pub visualization_code: String,
}

impl StructuredResult for GraphResult {
    const OPERATION: &'static str = "attack_graph";
    const REQUIRED: &'static [&'static str] = &["visualization_code"];
}

/// Contents of a fenced block, if `content` is one.
pub fn strip_markdown_fences(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let without_open = trimmed.strip_prefix("```")?;
    let after_header = match without_open.find('\n') {
        Some(idx) => &without_open[idx + 1..],
        None => without_open,
    };
    let end = after_header.rfind("```")?;
    Some(after_header[..end].trim().to_string())
}

fn push_unique(candidates: &mut Vec<String>, candidate: impl Into<String>) {
    let candidate = candidate.into();
    let trimmed = candidate.trim();
    if !trimmed.is_empty() && !candidates.iter().any(|c| c == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

fn balanced_json_at(content: &str, start: usize) -> Option<&str> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&content[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn candidates(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    push_unique(&mut out, content);
    if let Some(stripped) = strip_markdown_fences(content) {
        push_unique(&mut out, stripped);
    }
    let mut idx = 0;
    while idx < out.len() && out.len() < MAX_CANDIDATES {
        let current = out[idx].clone();
        for (pos, ch) in current.char_indices() {
            if ch == '{' || ch == '[' {
                if let Some(found) = balanced_json_at(&current, pos) {
                    push_unique(&mut out, found);
                    if out.len() >= MAX_CANDIDATES {
                        break;
                    }
                }
            }
        }
        idx += 1;
    }
    out
}

fn check_required<T: StructuredResult>(value: &Value) -> Result<()> {
    for field in T::REQUIRED {
        match value.get(*field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => {
                return Err(InferenceError::malformed(
                    T::OPERATION,
                    format!("field '{field}' is empty"),
                ))
            }
            Some(_) => {
                return Err(InferenceError::malformed(
                    T::OPERATION,
                    format!("field '{field}' is not a string"),
                ))
            }
            None => {
                return Err(InferenceError::malformed(
                    T::OPERATION,
                    format!("missing field '{field}'"),
                ))
            }
        }
    }
    Ok(())
}

fn has_required<T: StructuredResult>(value: &Value) -> bool {
    T::REQUIRED.iter().all(|field| value.get(*field).is_some())
}

/// Unwrap `{"patch": {...}}` style wrappers: when the object lacks a required
/// field and exactly one of its values is an object carrying all of them,
/// that inner object is the payload.
fn unnest<T: StructuredResult>(value: Value) -> Value {
    if T::REQUIRED.is_empty() || has_required::<T>(&value) {
        return value;
    }
    let inner = match &value {
        Value::Object(map) => {
            let mut nested = map
                .values()
                .filter(|v| v.is_object() && has_required::<T>(v));
            match (nested.next(), nested.next()) {
                (Some(inner), None) => Some(inner.clone()),
                _ => None,
            }
        }
        _ => None,
    };
    inner.unwrap_or(value)
}

/// Parse model output into `T`.
///
/// # Errors
///
/// `MalformedResult` when no candidate is JSON, a required field is missing
/// or empty, or the payload does not match `T`.
pub fn parse_structured<T: StructuredResult>(content: &str) -> Result<T> {
    let mut last_err = None;
    for candidate in candidates(content) {
        let value: Value = match serde_json::from_str(&candidate) {
            Ok(value) => value,
            Err(e) => {
                last_err = Some(e.to_string());
                continue;
            }
        };
        let value = unnest::<T>(value);
        // Shape errors on a valid JSON candidate are final.
        check_required::<T>(&value)?;
        return serde_json::from_value(value)
            .map_err(|e| InferenceError::malformed(T::OPERATION, e.to_string()));
    }
    Err(InferenceError::malformed(
        T::OPERATION,
        format!(
            "no JSON payload found ({})",
            last_err.unwrap_or_else(|| "empty response".to_string())
        ),
    ))
}
