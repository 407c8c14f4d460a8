//! Extraction of the stage-plan JSON from blueprint agent output.
//!
//! The blueprint agent produces architecture prose plus a JSON stage plan
//! fenced by a recognized marker:
//!
//! ````text
//! ```stage-plan
//! { "stages": [ { "name": "Core", "tasks": [ ... ] } ] }
//! ```
//! ````
//!
//! Extraction falls back in order: fenced `stage-plan` block → any fenced
//! `json` block → first balanced JSON object anywhere in the text → None.
//! The caller turns a None into the default single-stage plan.

use crate::util::extract_json_object;
use serde_json::Value;

/// Fence markers recognized as introducing the stage plan.
const PLAN_FENCES: &[&str] = &["```stage-plan", "```stageplan", "```plan-json"];

/// Generic JSON fence, used as the second fallback.
const JSON_FENCE: &str = "```json";

fn fenced_block<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Extract the raw plan JSON string from blueprint output, applying the
/// fallback chain. Returns the JSON text without validating it.
pub fn extract_plan_json(text: &str) -> Option<String> {
    for fence in PLAN_FENCES {
        if let Some(block) = fenced_block(text, fence) {
            return Some(block.to_string());
        }
    }
    if let Some(block) = fenced_block(text, JSON_FENCE) {
        return Some(block.to_string());
    }
    extract_json_object(text)
}

/// Parse blueprint output into a loose JSON value ready for validation.
/// Returns None when no parseable JSON plan is present anywhere.
pub fn parse_blueprint_output(text: &str) -> Option<Value> {
    let raw = extract_plan_json(text)?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => Some(value),
        // A fenced block that fails to parse may still be followed by a
        // bare JSON object later in the prose.
        _ => extract_json_object(text)
            .and_then(|fallback| serde_json::from_str(&fallback).ok())
            .filter(Value::is_object),
    }
}
