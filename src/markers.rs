//! Marker parsing from sub-agent output.
//!
//! The text-protocol markers are the agent ↔ orchestrator control channel:
//! - `[TASK_COMPLETE]` — plan-wide completion claim
//! - `[RETURN TO STAGE n]` — debugging requests a coding rollback
//! - `[FAILED_TASK: id]` — names a task to reset (matched case-insensitively)
//! - `[REPLAN: {...}]` — proposes a replacement plan (depth-scanned JSON)
//! - `[STAGE n/m: NAME - COMPLETE]` — per-stage completion report
//!
//! Broadcast markers (`[TASK_BROADCAST: ...]`) are parsed by the task bus,
//! which owns their depth-aware value scanning.

use regex::Regex;
use std::sync::LazyLock;

static FAILED_TASK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[FAILED_TASK:\s*([^\]\s][^\]]*)\]").unwrap());

static RETURN_TO_STAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[RETURN TO STAGE\s+(\d+)\]").unwrap());

static STAGE_COMPLETE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[STAGE\s+(\d+)\s*/\s*(\d+):\s*([^\]-]+?)\s*-\s*COMPLETE\]").unwrap()
});

// Word-boundary match: a bare "task complete" in prose counts, but
// "task completed 3 subtasks" or "multitask complete" does not.
static TASK_COMPLETE_PHRASE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btask complete\b").unwrap());

/// Explicit completion marker.
pub const TASK_COMPLETE_MARKER: &str = "[TASK_COMPLETE]";

/// Opener for the replan marker; the JSON payload is depth-scanned.
const REPLAN_OPENER: &str = "[REPLAN:";

/// A per-stage completion report parsed from agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCompleteReport {
    pub index: usize,
    pub total: usize,
    pub name: String,
}

/// Check for the plan-wide completion claim: either the explicit
/// `[TASK_COMPLETE]` marker or the phrase "task complete" on a word
/// boundary.
pub fn contains_completion_marker(text: &str) -> bool {
    text.contains(TASK_COMPLETE_MARKER) || TASK_COMPLETE_PHRASE_REGEX.is_match(text)
}

/// Extract all `[FAILED_TASK: id]` ids, case-insensitively, in order of
/// appearance.
pub fn extract_failed_task_ids(text: &str) -> Vec<String> {
    FAILED_TASK_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Extract the first `[RETURN TO STAGE n]` marker.
pub fn extract_return_to_stage(text: &str) -> Option<usize> {
    RETURN_TO_STAGE_REGEX
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Extract all `[STAGE n/m: NAME - COMPLETE]` reports.
pub fn extract_stage_complete_reports(text: &str) -> Vec<StageCompleteReport> {
    STAGE_COMPLETE_REGEX
        .captures_iter(text)
        .filter_map(|cap| {
            Some(StageCompleteReport {
                index: cap.get(1)?.as_str().parse().ok()?,
                total: cap.get(2)?.as_str().parse().ok()?,
                name: cap.get(3)?.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Extract the JSON payload of a `[REPLAN: {...}]` marker. The payload is
/// scanned with a depth counter, so nested braces inside the new plan are
/// handled; the closing `]` after the JSON is required.
pub fn extract_replan(text: &str) -> Option<String> {
    let start = text.find(REPLAN_OPENER)?;
    let after = &text[start + REPLAN_OPENER.len()..];
    let json = crate::util::extract_json_object(after)?;
    // The marker must actually close after the payload.
    let tail = &after[after.find('{')? + json.len() - 1..];
    if tail[1..].trim_start().starts_with(']') {
        Some(json)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // Completion marker tests
    // =========================================

    #[test]
    fn test_explicit_marker_detected() {
        assert!(contains_completion_marker("All done. [TASK_COMPLETE]"));
    }

    #[test]
    fn test_phrase_requires_word_boundary() {
        assert!(contains_completion_marker("the final task complete."));
        assert!(contains_completion_marker("Task Complete"));
        assert!(!contains_completion_marker("multitask completeness"));
        assert!(!contains_completion_marker("task completed 3 subtasks"));
    }

    #[test]
    fn test_no_marker() {
        assert!(!contains_completion_marker("still working on it"));
    }

    // =========================================
    // Failed-task marker tests
    // =========================================

    #[test]
    fn test_extract_failed_task_ids() {
        let text = "Broken: [FAILED_TASK: stage2_task_3]\nAlso [failed_task: stage1_task_1]";
        assert_eq!(
            extract_failed_task_ids(text),
            vec!["stage2_task_3", "stage1_task_1"]
        );
    }

    #[test]
    fn test_extract_failed_task_ids_none() {
        assert!(extract_failed_task_ids("nothing failed").is_empty());
    }

    // =========================================
    // Return-to-stage tests
    // =========================================

    #[test]
    fn test_extract_return_to_stage() {
        assert_eq!(
            extract_return_to_stage("needs rework: [RETURN TO STAGE 3]"),
            Some(3)
        );
        assert_eq!(
            extract_return_to_stage("[return to stage 12]"),
            Some(12)
        );
        assert_eq!(extract_return_to_stage("no marker"), None);
    }

    // =========================================
    // Stage-complete tests
    // =========================================

    #[test]
    fn test_extract_stage_complete() {
        let reports =
            extract_stage_complete_reports("[STAGE 2/4: Storage Layer - COMPLETE] moving on");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].index, 2);
        assert_eq!(reports[0].total, 4);
        assert_eq!(reports[0].name, "Storage Layer");
    }

    // =========================================
    // Replan tests
    // =========================================

    #[test]
    fn test_extract_replan_nested_json() {
        let text = r#"[REPLAN: {"stages": [{"tasks": [{"prompt": "x"}]}]}]"#;
        let json = extract_replan(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["stages"].is_array());
    }

    #[test]
    fn test_extract_replan_unclosed_marker_rejected() {
        assert!(extract_replan(r#"[REPLAN: {"stages": []}"#).is_none());
        assert!(extract_replan(r#"[REPLAN: {"stages": ["#).is_none());
        assert!(extract_replan("no replan here").is_none());
    }
}
