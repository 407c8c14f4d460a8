//! Mutable run state, the structured run result and recovery suggestions.

use crate::adapters::llm::TokenUsage;
use crate::failure::{ErrorCategory, classify_error};
use crate::plan::{FileChange, StagePlan, TaskProgress, TaskStatus};
use crate::vcs::BranchState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Terminal status of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A completion marker was seen and the pipeline finished.
    Completed,
    /// The pipeline finished without an explicit completion claim.
    Done,
    /// Cooperative cancellation stopped the run.
    Stopped,
    /// Pre-flight rejected the objective.
    Blocked,
    /// A fatal condition ended the run.
    Error,
    /// The token budget ended the run.
    BudgetExceeded,
    /// Recovery was exhausted without a degradation path left.
    Aborted,
}

/// Advice for one failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTaskAdvice {
    pub task_id: String,
    pub category: ErrorCategory,
    pub advice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structured guidance attached to non-completed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySuggestions {
    /// Phase where the run stopped making progress.
    pub phase: String,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<FailedTaskAdvice>,
    /// Manual steps derived from the gate status map.
    pub manual_steps: Vec<String>,
    pub resume_hint: String,
    pub summary: String,
}

impl RecoverySuggestions {
    /// Build suggestions from the final run state.
    pub fn build(
        session_id: &str,
        phase: &str,
        task_progress: &HashMap<String, TaskProgress>,
        gate_status: &HashMap<String, Value>,
    ) -> Self {
        let mut completed_tasks: Vec<String> = task_progress
            .values()
            .filter(|p| p.status == TaskStatus::Completed)
            .map(|p| p.task_id.clone())
            .collect();
        completed_tasks.sort();

        let mut failed_tasks: Vec<FailedTaskAdvice> = task_progress
            .values()
            .filter(|p| matches!(p.status, TaskStatus::Error | TaskStatus::Cancelled))
            .map(|p| {
                let category = p
                    .last_error
                    .as_deref()
                    .map(|e| classify_error(e, None))
                    .unwrap_or(ErrorCategory::Unknown);
                FailedTaskAdvice {
                    task_id: p.task_id.clone(),
                    category,
                    advice: category.advice().to_string(),
                    last_error: p.last_error.clone(),
                }
            })
            .collect();
        failed_tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let mut manual_steps = Vec::new();
        for (gate, value) in gate_status {
            let failed = value
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|s| s != "pass");
            if failed {
                manual_steps.push(format!(
                    "Check gate '{gate}': {}",
                    value
                        .get("failures")
                        .and_then(Value::as_str)
                        .unwrap_or("see gate output")
                ));
            }
        }
        manual_steps.sort();

        let summary = format!(
            "stopped in {phase}: {} task(s) completed, {} failed",
            completed_tasks.len(),
            failed_tasks.len()
        );

        Self {
            phase: phase.to_string(),
            completed_tasks,
            failed_tasks,
            manual_steps,
            resume_hint: format!("crucible resume {session_id}"),
            summary,
        }
    }
}

impl std::fmt::Display for RecoverySuggestions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.summary)?;
        for task in &self.failed_tasks {
            writeln!(f, "  {} [{:?}]: {}", task.task_id, task.category, task.advice)?;
        }
        for step in &self.manual_steps {
            writeln!(f, "  manual: {step}")?;
        }
        write!(f, "  resume: {}", self.resume_hint)
    }
}

/// Structured result returned from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub session_id: String,
    pub status: RunStatus,
    /// Phase code where the run ended.
    pub phase: String,
    pub stage_index: usize,
    pub stage_count: usize,
    pub task_progress: HashMap<String, TaskProgress>,
    pub file_changes: Vec<FileChange>,
    pub gate_status: HashMap<String, Value>,
    pub usage: TokenUsage,
    /// Completion percentage of the coding loop.
    pub progress: f64,
    pub recovery_count: u32,
    pub coding_rollbacks: u32,
    pub branch_state: BranchState,
    pub elapsed_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_suggestions: Option<RecoverySuggestions>,
}

/// Mutable orchestrator state for one run. Reconstructible from the
/// latest checkpoint plus the frozen plan.
#[derive(Debug)]
pub struct RunState {
    pub session_id: String,
    /// Monotonic counters: these never decrease.
    pub iteration: u64,
    pub recovery_count: u32,
    pub coding_rollback_count: u32,
    pub stage_index: usize,
    pub plan: Option<StagePlan>,
    pub task_progress: HashMap<String, TaskProgress>,
    pub file_changes: Vec<FileChange>,
    pub gate_status: HashMap<String, Value>,
    pub usage: TokenUsage,
    pub prior_context: String,
    pub completion_marker_seen: bool,
    pub last_progress: f64,
    pub intake_summary: String,
    pub preview_findings: String,
    /// Degradation-chain writes land here, not in the config.
    pub model: String,
    pub max_parallel: usize,
    pub should_stop: bool,
}

impl RunState {
    pub fn new(session_id: &str, model: &str, max_parallel: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            iteration: 0,
            recovery_count: 0,
            coding_rollback_count: 0,
            stage_index: 0,
            plan: None,
            task_progress: HashMap::new(),
            file_changes: Vec::new(),
            gate_status: HashMap::new(),
            usage: TokenUsage::default(),
            prior_context: String::new(),
            completion_marker_seen: false,
            last_progress: 0.0,
            intake_summary: String::new(),
            preview_findings: String::new(),
            model: model.to_string(),
            max_parallel,
            should_stop: false,
        }
    }

    /// Merge a barrier's progress map into the run-wide map.
    pub fn merge_progress(&mut self, progress: HashMap<String, TaskProgress>) {
        for (task_id, record) in progress {
            self.task_progress.insert(task_id, record);
        }
    }

    /// Reset errored tasks for another coding pass. With an explicit list
    /// only those tasks reset; otherwise every errored task does, except
    /// tasks whose classified failure is permanent or unknown, which are
    /// skipped with a reason.
    pub fn reset_failed_tasks(&mut self, only: Option<&[String]>) -> Vec<String> {
        let mut reset = Vec::new();
        for record in self.task_progress.values_mut() {
            if record.status != TaskStatus::Error {
                continue;
            }
            if let Some(ids) = only {
                if !ids.iter().any(|id| id.eq_ignore_ascii_case(&record.task_id)) {
                    continue;
                }
            }
            let category = record
                .last_error
                .as_deref()
                .map(|e| classify_error(e, None))
                .unwrap_or(ErrorCategory::Unknown);
            match category {
                ErrorCategory::Permanent | ErrorCategory::Unknown if only.is_none() => {
                    record.transition(TaskStatus::Skipped);
                    record.skip_reason = Some(format!("{category:?} failure, not retried"));
                }
                _ => {
                    if record.transition(TaskStatus::Retrying) {
                        reset.push(record.task_id.clone());
                    }
                }
            }
        }
        reset.sort();
        reset
    }

    /// Mark every non-completed task skipped (the `reduce_scope`
    /// degradation strategy).
    pub fn skip_non_completed_tasks(&mut self) -> usize {
        let mut skipped = 0;
        for record in self.task_progress.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            if record.transition(TaskStatus::Skipped) {
                record.skip_reason = Some("scope reduced under degradation".to_string());
                skipped += 1;
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(task_id: &str, status: TaskStatus, last_error: Option<&str>) -> TaskProgress {
        TaskProgress {
            task_id: task_id.to_string(),
            status,
            attempt: 1,
            last_reply: None,
            last_error: last_error.map(str::to_string),
            remaining_files: vec![],
            skip_reason: None,
        }
    }

    fn state_with(records: Vec<TaskProgress>) -> RunState {
        let mut state = RunState::new("sess", "model", 4);
        for record in records {
            state.task_progress.insert(record.task_id.clone(), record);
        }
        state
    }

    // =========================================
    // reset_failed_tasks tests
    // =========================================

    #[test]
    fn test_reset_only_listed_tasks() {
        let mut state = state_with(vec![
            progress("a", TaskStatus::Error, Some("ECONNRESET")),
            progress("b", TaskStatus::Error, Some("ECONNRESET")),
            progress("c", TaskStatus::Completed, None),
        ]);

        let reset = state.reset_failed_tasks(Some(&["a".to_string()]));
        assert_eq!(reset, vec!["a"]);
        assert_eq!(state.task_progress["a"].status, TaskStatus::Retrying);
        assert_eq!(state.task_progress["b"].status, TaskStatus::Error);
        assert_eq!(state.task_progress["c"].status, TaskStatus::Completed);
    }

    #[test]
    fn test_reset_listed_matches_case_insensitively() {
        let mut state = state_with(vec![progress(
            "Stage2_Task_3",
            TaskStatus::Error,
            Some("ECONNRESET"),
        )]);
        let reset = state.reset_failed_tasks(Some(&["stage2_task_3".to_string()]));
        assert_eq!(reset, vec!["Stage2_Task_3"]);
    }

    #[test]
    fn test_reset_all_skips_permanent_failures() {
        let mut state = state_with(vec![
            progress("a", TaskStatus::Error, Some("ECONNRESET")),
            progress("b", TaskStatus::Error, Some("ENOENT: missing")),
        ]);

        let reset = state.reset_failed_tasks(None);
        assert_eq!(reset, vec!["a"]);
        assert_eq!(state.task_progress["b"].status, TaskStatus::Skipped);
        assert!(
            state.task_progress["b"]
                .skip_reason
                .as_deref()
                .unwrap()
                .contains("Permanent")
        );
    }

    #[test]
    fn test_skip_non_completed() {
        let mut state = state_with(vec![
            progress("a", TaskStatus::Completed, None),
            progress("b", TaskStatus::Error, None),
            progress("c", TaskStatus::Pending, None),
        ]);
        let skipped = state.skip_non_completed_tasks();
        assert_eq!(skipped, 2);
        assert_eq!(state.task_progress["a"].status, TaskStatus::Completed);
        assert_eq!(state.task_progress["b"].status, TaskStatus::Skipped);
        assert_eq!(state.task_progress["c"].status, TaskStatus::Skipped);
    }

    // =========================================
    // RecoverySuggestions tests
    // =========================================

    #[test]
    fn test_recovery_suggestions_structure() {
        let mut task_progress = HashMap::new();
        task_progress.insert(
            "a".to_string(),
            progress("a", TaskStatus::Completed, None),
        );
        task_progress.insert(
            "b".to_string(),
            progress("b", TaskStatus::Error, Some("ENOENT: no such file")),
        );
        let mut gate_status = HashMap::new();
        gate_status.insert(
            "usabilityGates".to_string(),
            serde_json::json!({"status": "fail", "failures": "Test: 2 failing"}),
        );
        gate_status.insert(
            "preview".to_string(),
            serde_json::json!({"status": "pass"}),
        );

        let suggestions =
            RecoverySuggestions::build("sess-9", "H6", &task_progress, &gate_status);

        assert_eq!(suggestions.phase, "H6");
        assert_eq!(suggestions.completed_tasks, vec!["a"]);
        assert_eq!(suggestions.failed_tasks.len(), 1);
        assert_eq!(suggestions.failed_tasks[0].category, ErrorCategory::Permanent);
        assert_eq!(suggestions.manual_steps.len(), 1);
        assert!(suggestions.manual_steps[0].contains("usabilityGates"));
        assert_eq!(suggestions.resume_hint, "crucible resume sess-9");
        assert!(suggestions.summary.contains("1 task(s) completed"));
    }
}
