//! Stuck-loop detection over tool-call patterns.
//!
//! The tracker watches the tool calls each sub-agent round makes and flags
//! patterns that indicate the agent has stopped making forward progress:
//! re-globbing config files, cycling through the same read-only calls,
//! exploring without writing, or thrashing a single file with edits.
//!
//! On a trigger the orchestrator injects a warning string into the next
//! sub-agent prompt exactly once per detected reason.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Default history window for signatures and write operations.
pub const DEFAULT_HISTORY: usize = 10;

/// Read-only tool names; rounds made only of these count as exploration.
const READ_ONLY_TOOLS: &[&str] = &[
    "read",
    "glob",
    "grep",
    "list",
    "webfetch",
    "websearch",
    "codesearch",
];

/// Writing tool names.
const WRITE_TOOLS: &[&str] = &["write", "edit", "notebookedit"];

/// Consecutive all-read-only rounds tolerated before flagging.
const READ_ONLY_ROUND_LIMIT: u32 = 4;

/// Identical read-only calls in a row that count as a cycle.
const SAME_CALL_CYCLE_LEN: usize = 6;

/// Minimum glob history before the config-glob rule applies.
const CONFIG_GLOB_MIN_GLOBS: usize = 6;

/// Distinct config-file patterns that trigger the config-glob rule.
const CONFIG_GLOB_DISTINCT: usize = 4;

/// Consecutive same-tool edits to one path that count as a write loop.
const WRITE_LOOP_LEN: usize = 3;

/// Write/edit alternations on one path that count as an edit cycle.
const EDIT_CYCLE_LEN: usize = 4;

/// Check if a tool name is read-only.
pub fn is_read_only_tool(name: &str) -> bool {
    READ_ONLY_TOOLS.contains(&name.to_lowercase().as_str())
}

/// Check if a tool name writes files.
pub fn is_write_tool(name: &str) -> bool {
    WRITE_TOOLS.contains(&name.to_lowercase().as_str())
}

/// One tool call as seen by the tracker.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn new(name: &str, args: Value) -> Self {
        Self {
            name: name.to_string(),
            args,
        }
    }

    /// The signature hashed into history: `<tool>:<argsJson>`.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name.to_lowercase(), self.args)
    }

    fn path(&self) -> Option<&str> {
        for key in ["path", "file_path", "file"] {
            if let Some(p) = self.args.get(key).and_then(Value::as_str) {
                return Some(p);
            }
        }
        None
    }
}

/// Why the tracker considers the agent stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    RepeatedConfigFileGlob,
    ToolCycleDetected,
    ExcessiveReadOnlyExploration,
    WriteLoopDetected,
    EditCycleDetected,
}

impl StuckReason {
    /// The warning line injected into the next sub-agent prompt.
    pub fn warning(&self) -> &'static str {
        match self {
            Self::RepeatedConfigFileGlob => {
                "WARNING: you keep globbing configuration files without acting on them. Pick a file and make a concrete change."
            }
            Self::ToolCycleDetected => {
                "WARNING: your recent tool calls repeat in a cycle. Stop re-reading and take a different action."
            }
            Self::ExcessiveReadOnlyExploration => {
                "WARNING: several rounds of read-only exploration without a write. Commit to an implementation step now."
            }
            Self::WriteLoopDetected => {
                "WARNING: the same file has been edited repeatedly in a row. Re-read the file and reconsider the approach before editing again."
            }
            Self::EditCycleDetected => {
                "WARNING: alternating write/edit churn on one file. Decide the final content and write it once."
            }
        }
    }
}

/// Outcome of one tracked round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckReport {
    pub is_stuck: bool,
    pub reason: Option<StuckReason>,
}

impl StuckReport {
    fn clear() -> Self {
        Self {
            is_stuck: false,
            reason: None,
        }
    }

    fn stuck(reason: StuckReason) -> Self {
        Self {
            is_stuck: true,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
struct SigEntry {
    signature: String,
    read_only: bool,
}

#[derive(Debug, Clone)]
struct WriteOp {
    tool: String,
    path: String,
}

/// Sliding-window tracker over tool calls.
#[derive(Debug)]
pub struct StuckTracker {
    history: usize,
    signatures: VecDeque<SigEntry>,
    write_ops: VecDeque<WriteOp>,
    glob_patterns: VecDeque<String>,
    read_only_rounds: u32,
    pending_warning: Option<&'static str>,
    last_warned: Option<StuckReason>,
}

impl Default for StuckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl StuckTracker {
    /// Create a tracker keeping the last `history` signatures and writes.
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
            signatures: VecDeque::new(),
            write_ops: VecDeque::new(),
            glob_patterns: VecDeque::new(),
            read_only_rounds: 0,
            pending_warning: None,
            last_warned: None,
        }
    }

    fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
        queue.push_back(item);
        while queue.len() > cap {
            queue.pop_front();
        }
    }

    /// Record one sub-agent round of tool calls and evaluate the stuck
    /// rules.
    pub fn track(&mut self, calls: &[ToolCall]) -> StuckReport {
        for call in calls {
            let read_only = is_read_only_tool(&call.name);
            Self::push_bounded(
                &mut self.signatures,
                SigEntry {
                    signature: call.signature(),
                    read_only,
                },
                self.history,
            );

            if call.name.eq_ignore_ascii_case("glob") {
                let pattern = call
                    .args
                    .get("pattern")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Self::push_bounded(&mut self.glob_patterns, pattern, self.history);
            }

            if is_write_tool(&call.name) {
                if let Some(path) = call.path() {
                    Self::push_bounded(
                        &mut self.write_ops,
                        WriteOp {
                            tool: call.name.to_lowercase(),
                            path: path.to_string(),
                        },
                        self.history,
                    );
                }
            }
        }

        let all_read_only = !calls.is_empty() && calls.iter().all(|c| is_read_only_tool(&c.name));
        if all_read_only {
            self.read_only_rounds += 1;
        } else if !calls.is_empty() {
            self.read_only_rounds = 0;
        }

        let report = self.evaluate();
        if let Some(reason) = report.reason {
            if self.last_warned != Some(reason) {
                self.pending_warning = Some(reason.warning());
                self.last_warned = Some(reason);
            }
        }
        report
    }

    fn evaluate(&self) -> StuckReport {
        if self.write_loop() {
            return StuckReport::stuck(StuckReason::WriteLoopDetected);
        }
        if self.edit_cycle() {
            return StuckReport::stuck(StuckReason::EditCycleDetected);
        }
        if self.repeated_config_glob() {
            return StuckReport::stuck(StuckReason::RepeatedConfigFileGlob);
        }
        if self.tool_cycle() {
            return StuckReport::stuck(StuckReason::ToolCycleDetected);
        }
        if self.read_only_rounds >= READ_ONLY_ROUND_LIMIT {
            return StuckReport::stuck(StuckReason::ExcessiveReadOnlyExploration);
        }
        StuckReport::clear()
    }

    fn write_loop(&self) -> bool {
        if self.write_ops.len() < WRITE_LOOP_LEN {
            return false;
        }
        let tail: Vec<&WriteOp> = self
            .write_ops
            .iter()
            .rev()
            .take(WRITE_LOOP_LEN)
            .collect();
        tail.iter()
            .all(|op| op.path == tail[0].path && op.tool == tail[0].tool)
    }

    fn edit_cycle(&self) -> bool {
        if self.write_ops.len() < EDIT_CYCLE_LEN {
            return false;
        }
        let tail: Vec<&WriteOp> = self.write_ops.iter().rev().take(EDIT_CYCLE_LEN).collect();
        if !tail.iter().all(|op| op.path == tail[0].path) {
            return false;
        }
        tail.windows(2).all(|w| w[0].tool != w[1].tool)
    }

    fn repeated_config_glob(&self) -> bool {
        if self.glob_patterns.len() < CONFIG_GLOB_MIN_GLOBS {
            return false;
        }
        let distinct: HashSet<&String> = self
            .glob_patterns
            .iter()
            .filter(|p| is_config_pattern(p))
            .collect();
        distinct.len() >= CONFIG_GLOB_DISTINCT
    }

    fn tool_cycle(&self) -> bool {
        // Six identical read-only calls in a row.
        if self.signatures.len() >= SAME_CALL_CYCLE_LEN {
            let tail: Vec<&SigEntry> = self
                .signatures
                .iter()
                .rev()
                .take(SAME_CALL_CYCLE_LEN)
                .collect();
            if tail
                .iter()
                .all(|e| e.read_only && e.signature == tail[0].signature)
            {
                return true;
            }
        }

        // Split-half equality: the recent read-only history is two
        // identical bags of calls.
        let read_only: Vec<&str> = self
            .signatures
            .iter()
            .filter(|e| e.read_only)
            .map(|e| e.signature.as_str())
            .collect();
        if read_only.len() >= SAME_CALL_CYCLE_LEN && read_only.len() % 2 == 0 {
            let mid = read_only.len() / 2;
            let mut first: Vec<&str> = read_only[..mid].to_vec();
            let mut second: Vec<&str> = read_only[mid..].to_vec();
            first.sort_unstable();
            second.sort_unstable();
            // Two identical halves of a single repeated call are already
            // caught above; this rule is for multi-call cycles.
            if first == second && first.iter().collect::<HashSet<_>>().len() > 1 {
                return true;
            }
        }

        false
    }

    /// Consume the pending warning, if any. Returns Some exactly once per
    /// newly detected reason.
    pub fn take_warning(&mut self) -> Option<&'static str> {
        self.pending_warning.take()
    }
}

fn is_config_pattern(pattern: &str) -> bool {
    let lower = pattern.to_lowercase();
    lower.contains("config")
        || lower.ends_with(".json")
        || lower.ends_with(".toml")
        || lower.ends_with(".yaml")
        || lower.ends_with(".yml")
        || lower.ends_with(".ini")
        || lower.ends_with(".env")
        || lower.ends_with("rc")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_call(path: &str) -> ToolCall {
        ToolCall::new("read", json!({"path": path}))
    }

    fn glob_call(pattern: &str) -> ToolCall {
        ToolCall::new("glob", json!({"pattern": pattern}))
    }

    fn edit_call(path: &str) -> ToolCall {
        ToolCall::new("edit", json!({"path": path, "old": "a", "new": "b"}))
    }

    fn write_call(path: &str) -> ToolCall {
        ToolCall::new("write", json!({"path": path, "content": "x"}))
    }

    // =========================================
    // Read-only exploration tests
    // =========================================

    #[test]
    fn test_excessive_read_only_exploration_at_fourth_round() {
        let mut tracker = StuckTracker::default();
        for i in 0..3 {
            let report = tracker.track(&[read_call(&format!("src/f{i}.rs"))]);
            assert!(!report.is_stuck, "round {i} should not trigger yet");
        }
        let report = tracker.track(&[read_call("src/f3.rs")]);
        assert!(report.is_stuck);
        assert_eq!(
            report.reason,
            Some(StuckReason::ExcessiveReadOnlyExploration)
        );
    }

    #[test]
    fn test_write_resets_read_only_streak() {
        let mut tracker = StuckTracker::default();
        for i in 0..3 {
            tracker.track(&[read_call(&format!("src/f{i}.rs"))]);
        }
        tracker.track(&[edit_call("src/f0.rs")]);
        let report = tracker.track(&[read_call("src/f4.rs")]);
        assert!(!report.is_stuck);
    }

    // =========================================
    // Write-loop and edit-cycle tests
    // =========================================

    #[test]
    fn test_write_loop_after_three_edits_to_same_path() {
        let mut tracker = StuckTracker::default();
        tracker.track(&[edit_call("src/a.rs")]);
        tracker.track(&[edit_call("src/a.rs")]);
        let report = tracker.track(&[edit_call("src/a.rs")]);
        assert!(report.is_stuck);
        assert_eq!(report.reason, Some(StuckReason::WriteLoopDetected));
    }

    #[test]
    fn test_edits_to_different_paths_do_not_loop() {
        let mut tracker = StuckTracker::default();
        tracker.track(&[edit_call("src/a.rs")]);
        tracker.track(&[edit_call("src/b.rs")]);
        let report = tracker.track(&[edit_call("src/a.rs")]);
        assert!(!report.is_stuck);
    }

    #[test]
    fn test_edit_cycle_on_alternating_write_edit() {
        let mut tracker = StuckTracker::default();
        tracker.track(&[write_call("src/a.rs")]);
        tracker.track(&[edit_call("src/a.rs")]);
        tracker.track(&[write_call("src/a.rs")]);
        let report = tracker.track(&[edit_call("src/a.rs")]);
        assert!(report.is_stuck);
        assert_eq!(report.reason, Some(StuckReason::EditCycleDetected));
    }

    // =========================================
    // Config-glob tests
    // =========================================

    #[test]
    fn test_repeated_config_glob() {
        let mut tracker = StuckTracker::default();
        let patterns = [
            "**/*.json",
            "**/*.toml",
            "**/*.yaml",
            "**/.env",
            "src/**/*.rs",
            "**/config/*",
        ];
        let mut last = StuckReport::clear();
        for p in patterns {
            last = tracker.track(&[glob_call(p)]);
        }
        assert!(last.is_stuck);
        assert_eq!(last.reason, Some(StuckReason::RepeatedConfigFileGlob));
    }

    #[test]
    fn test_source_globs_do_not_trigger_config_rule() {
        let mut tracker = StuckTracker::default();
        let mut stuck_config = false;
        for i in 0..8 {
            let report = tracker.track(&[
                glob_call(&format!("src/mod{i}/**/*.rs")),
                edit_call(&format!("src/mod{i}/lib.rs")),
            ]);
            stuck_config |= report.reason == Some(StuckReason::RepeatedConfigFileGlob);
        }
        assert!(!stuck_config);
    }

    // =========================================
    // Tool-cycle tests
    // =========================================

    #[test]
    fn test_six_identical_read_only_calls_cycle() {
        let mut tracker = StuckTracker::default();
        let mut last = StuckReport::clear();
        for _ in 0..6 {
            last = tracker.track(&[read_call("src/a.rs")]);
        }
        assert!(last.is_stuck);
        assert_eq!(last.reason, Some(StuckReason::ToolCycleDetected));
    }

    #[test]
    fn test_split_half_cycle_detected() {
        let mut tracker = StuckTracker::default();
        // a,b,c,a,b,c: sorted halves match.
        let mut last = StuckReport::clear();
        for path in ["a", "b", "c", "a", "b", "c"] {
            last = tracker.track(&[read_call(path)]);
        }
        assert!(last.is_stuck);
        assert_eq!(last.reason, Some(StuckReason::ToolCycleDetected));
    }

    // =========================================
    // Warning injection tests
    // =========================================

    #[test]
    fn test_warning_injected_exactly_once() {
        let mut tracker = StuckTracker::default();
        for _ in 0..3 {
            tracker.track(&[edit_call("src/a.rs")]);
        }
        let warning = tracker.take_warning();
        assert!(warning.is_some());
        assert!(warning.unwrap().contains("edited repeatedly"));
        assert!(tracker.take_warning().is_none());

        // The same reason re-triggering does not rearm the warning.
        tracker.track(&[edit_call("src/a.rs")]);
        assert!(tracker.take_warning().is_none());
    }
}
