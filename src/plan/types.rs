//! Core plan data types: stages, tasks, progress and file changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimum per-task timeout. Anything lower is clamped up by the validator.
pub const MIN_TASK_TIMEOUT_MS: u64 = 1000;

/// Default per-task timeout when the blueprint omits one.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

/// Default per-task retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Maximum planned files kept per task.
pub const MAX_PLANNED_FILES: usize = 80;

/// Maximum acceptance checks kept per task.
pub const MAX_ACCEPTANCE: usize = 50;

/// The only supported stage pass rule.
pub const PASS_RULE_ALL_SUCCESS: &str = "all_success";

/// Task complexity as estimated by the blueprint agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Coerce a free-form string to a complexity, defaulting to medium.
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

/// Status of a task inside the stage barrier.
///
/// Transitions form a DAG rooted at `Pending`:
/// pending → running → (completed | retrying → running | error | cancelled
/// | skipped). `Completed`, `Cancelled` and `Skipped` are terminal; `Error`
/// may be reset to `Retrying` by rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Error,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Check if the status is terminal for this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Skipped)
    }

    /// Check whether a transition is permitted by the status DAG.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Skipped) | (Pending, Cancelled) => true,
            (Running, Completed)
            | (Running, Retrying)
            | (Running, Error)
            | (Running, Cancelled) => true,
            (Retrying, Running) | (Retrying, Cancelled) | (Retrying, Skipped) => true,
            // Rollback resets errored tasks for another coding pass.
            (Error, Retrying) | (Error, Skipped) => true,
            _ => false,
        }
    }
}

/// A unit of work assigned to a single sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub prompt: String,
    /// Files this task owns. Disjoint from sibling tasks in the same stage.
    #[serde(default)]
    pub planned_files: Vec<String>,
    /// Machine-verifiable acceptance checks, in order.
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    /// Create a task with defaults for everything but id and prompt.
    pub fn new(task_id: &str, prompt: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            prompt: prompt.to_string(),
            planned_files: Vec::new(),
            acceptance: Vec::new(),
            complexity: Complexity::default(),
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            depends_on: Vec::new(),
        }
    }

    /// Set the planned files.
    pub fn with_planned_files(mut self, files: Vec<String>) -> Self {
        self.planned_files = files;
        self
    }

    /// Set the acceptance checks.
    pub fn with_acceptance(mut self, acceptance: Vec<String>) -> Self {
        self.acceptance = acceptance;
        self
    }

    /// Set the complexity.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// An ordered unit of the plan whose tasks run in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: String,
    pub name: String,
    /// Always `all_success`; kept explicit in the serialized form.
    #[serde(default = "default_pass_rule")]
    pub pass_rule: String,
    pub tasks: Vec<Task>,
}

fn default_pass_rule() -> String {
    PASS_RULE_ALL_SUCCESS.to_string()
}

impl Stage {
    /// Create a stage with the given id and name.
    pub fn new(stage_id: &str, name: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            name: name.to_string(),
            pass_rule: default_pass_rule(),
            tasks: Vec::new(),
        }
    }

    /// Add tasks to the stage.
    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }
}

/// The frozen stage plan produced by the blueprint phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub plan_id: String,
    pub objective: String,
    pub stages: Vec<Stage>,
}

impl StagePlan {
    /// Create a plan with a fresh id.
    pub fn new(objective: &str, stages: Vec<Stage>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            objective: objective.to_string(),
            stages,
        }
    }

    /// The default single-stage, single-task plan built from an objective.
    /// Used when blueprint parsing or validation fails outright.
    pub fn fallback(objective: &str) -> Self {
        let task = Task::new("task_1", objective);
        let stage = Stage::new("stage_1", "Implementation").with_tasks(vec![task]);
        Self::new(objective, vec![stage])
    }

    /// Total task count across all stages.
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }

    /// Look up a task by id across all stages.
    pub fn find_task(&self, task_id: &str) -> Option<(&Stage, &Task)> {
        self.stages.iter().find_map(|s| {
            s.tasks
                .iter()
                .find(|t| t.task_id == task_id)
                .map(|t| (s, t))
        })
    }
}

/// Mutable execution record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub remaining_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TaskProgress {
    /// Fresh pending progress for a task.
    pub fn pending(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: TaskStatus::Pending,
            attempt: 0,
            last_reply: None,
            last_error: None,
            remaining_files: task.planned_files.clone(),
            skip_reason: None,
        }
    }

    /// Apply a status transition, enforcing the status DAG. A `Completed`
    /// record never moves again within one run.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Seed a progress map for a stage, preferring checkpointed records.
pub fn seed_progress(
    stage: &Stage,
    prior: &HashMap<String, TaskProgress>,
) -> HashMap<String, TaskProgress> {
    stage
        .tasks
        .iter()
        .map(|t| {
            let progress = prior
                .get(&t.task_id)
                .cloned()
                .unwrap_or_else(|| TaskProgress::pending(t));
            (t.task_id.clone(), progress)
        })
        .collect()
}

/// A line-count delta for one file, attributed to a stage and task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub added_lines: u64,
    pub removed_lines: u64,
    pub stage_id: String,
    pub task_id: String,
}

impl FileChange {
    fn key(&self) -> (String, String, String) {
        (
            self.path.clone(),
            self.stage_id.clone(),
            self.task_id.clone(),
        )
    }
}

/// Merge new file changes into the accumulated list: line counts are summed
/// by `(path, stage, task)` key and the list is capped to the `cap`
/// most-recent entries.
pub fn merge_file_changes(existing: &mut Vec<FileChange>, incoming: Vec<FileChange>, cap: usize) {
    for change in incoming {
        if let Some(found) = existing.iter_mut().find(|c| c.key() == change.key()) {
            found.added_lines += change.added_lines;
            found.removed_lines += change.removed_lines;
        } else {
            existing.push(change);
        }
    }
    if existing.len() > cap {
        let drop = existing.len() - cap;
        existing.drain(0..drop);
    }
}
