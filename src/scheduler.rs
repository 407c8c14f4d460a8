//! Stage barrier: bounded-parallel task execution with per-task retry
//! policy and a hard barrier on stage completion.
//!
//! Each task runs as its own tokio task under a semaphore permit and its
//! own timeout. A task attempt is a short agent loop: model request, tool
//! dispatch for any tool calls (feeding the stuck tracker), repeat until a
//! text-only reply. Replies are scanned for broadcast and completion
//! markers; failures are classified to decide whether the attempt may be
//! retried.
//!
//! `run_stage_barrier` returns only once every task has reached a terminal
//! state, with a coherent per-task status map even under cancellation.

use crate::adapters::llm::{LlmAdapter, LlmRequest, Message, SystemPrompt, TokenUsage};
use crate::adapters::tools::{ToolExecutor, ToolInvocationCtx};
use crate::agents::AgentRegistry;
use crate::bus::TaskBus;
use crate::failure::{ErrorCategory, StuckTracker, ToolCall, classify_error};
use crate::markers::contains_completion_marker;
use crate::plan::{
    FileChange, Stage, Task, TaskProgress, TaskStatus, merge_file_changes, seed_progress,
};
use crate::util::error_excerpt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Callback fired when a task completes; the orchestrator wires this to
/// the per-task checkpoint writer.
pub type TaskCompleteHook = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Inputs shared by every task of one stage run.
#[derive(Debug, Clone)]
pub struct StageRunContext {
    pub session_id: String,
    pub working_dir: PathBuf,
    /// Plan anchor prepended to every task prompt.
    pub plan_anchor: String,
    /// Prior-stage context string.
    pub prior_context: String,
    pub model: String,
    pub max_parallel: usize,
    pub max_tool_rounds: u32,
    /// Task progress seeded from a checkpoint, if any.
    pub seed: HashMap<String, TaskProgress>,
}

/// Result of one stage barrier run.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub task_progress: HashMap<String, TaskProgress>,
    pub success_count: usize,
    pub fail_count: usize,
    pub all_success: bool,
    pub completion_marker_seen: bool,
    pub file_changes: Vec<FileChange>,
    pub usage: TokenUsage,
    /// Set when an adapter surfaced a fatal (authentication) error; the
    /// orchestrator aborts the turn.
    pub fatal_error: Option<String>,
}

/// Outcome of one task attempt.
enum AttemptOutcome {
    Success { reply: String },
    Failure { message: String, category: ErrorCategory },
}

/// The stage barrier scheduler.
pub struct StageBarrier {
    llm: Arc<dyn LlmAdapter>,
    tools: Arc<dyn ToolExecutor>,
    agents: Arc<AgentRegistry>,
}

impl StageBarrier {
    pub fn new(
        llm: Arc<dyn LlmAdapter>,
        tools: Arc<dyn ToolExecutor>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self { llm, tools, agents }
    }

    /// Run one stage to the barrier: every task reaches a terminal state
    /// before this returns.
    pub async fn run_stage_barrier(
        &self,
        stage: &Stage,
        ctx: StageRunContext,
        bus: Arc<Mutex<TaskBus>>,
        stuck: Arc<Mutex<StuckTracker>>,
        on_task_complete: TaskCompleteHook,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let progress = Arc::new(Mutex::new(seed_progress(stage, &ctx.seed)));
        let completion_seen = Arc::new(Mutex::new(false));
        let file_changes = Arc::new(Mutex::new(Vec::<FileChange>::new()));
        let usage = Arc::new(Mutex::new(TokenUsage::default()));
        let fatal_error = Arc::new(Mutex::new(None::<String>));
        let semaphore = Arc::new(Semaphore::new(ctx.max_parallel.max(1)));

        let mut join_set = JoinSet::new();
        for task in &stage.tasks {
            // Terminal seeds (resume): keep the checkpointed state.
            {
                let map = progress.lock().await;
                if map
                    .get(&task.task_id)
                    .is_some_and(|p| p.status.is_terminal())
                {
                    continue;
                }
            }

            let worker = TaskWorker {
                llm: Arc::clone(&self.llm),
                tools: Arc::clone(&self.tools),
                agents: Arc::clone(&self.agents),
                stage_id: stage.stage_id.clone(),
                task: task.clone(),
                ctx: ctx.clone(),
                bus: Arc::clone(&bus),
                stuck: Arc::clone(&stuck),
                progress: Arc::clone(&progress),
                completion_seen: Arc::clone(&completion_seen),
                file_changes: Arc::clone(&file_changes),
                usage: Arc::clone(&usage),
                fatal_error: Arc::clone(&fatal_error),
                on_task_complete: Arc::clone(&on_task_complete),
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                worker.run(&cancel).await;
            });
        }

        // The barrier: wait for every worker.
        while join_set.join_next().await.is_some() {}

        let task_progress = progress.lock().await.clone();
        let mut success_count = 0;
        let mut fail_count = 0;
        for record in task_progress.values() {
            match record.status {
                TaskStatus::Completed => success_count += 1,
                TaskStatus::Error | TaskStatus::Cancelled => fail_count += 1,
                _ => {}
            }
        }
        let all_success = fail_count == 0
            && task_progress
                .values()
                .all(|p| p.status.is_terminal());

        let completion_marker_seen = *completion_seen.lock().await;
        let file_changes = file_changes.lock().await.clone();
        let usage = *usage.lock().await;
        let fatal_error = fatal_error.lock().await.clone();

        StageOutcome {
            all_success,
            success_count,
            fail_count,
            completion_marker_seen,
            file_changes,
            usage,
            fatal_error,
            task_progress,
        }
    }
}

/// One task's execution state, owned by its tokio task.
struct TaskWorker {
    llm: Arc<dyn LlmAdapter>,
    tools: Arc<dyn ToolExecutor>,
    agents: Arc<AgentRegistry>,
    stage_id: String,
    task: Task,
    ctx: StageRunContext,
    bus: Arc<Mutex<TaskBus>>,
    stuck: Arc<Mutex<StuckTracker>>,
    progress: Arc<Mutex<HashMap<String, TaskProgress>>>,
    completion_seen: Arc<Mutex<bool>>,
    file_changes: Arc<Mutex<Vec<FileChange>>>,
    usage: Arc<Mutex<TokenUsage>>,
    fatal_error: Arc<Mutex<Option<String>>>,
    on_task_complete: TaskCompleteHook,
}

impl TaskWorker {
    async fn set_status(&self, status: TaskStatus) {
        let mut map = self.progress.lock().await;
        if let Some(record) = map.get_mut(&self.task.task_id) {
            record.transition(status);
        }
    }

    async fn bump_attempt(&self) -> u32 {
        let mut map = self.progress.lock().await;
        match map.get_mut(&self.task.task_id) {
            Some(record) => {
                record.attempt += 1;
                record.attempt
            }
            None => 0,
        }
    }

    async fn run(self, cancel: &CancellationToken) {
        let mut logic_retried = false;
        let mut error_annotation: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                self.finalize_cancelled().await;
                return;
            }

            let attempt = self.bump_attempt().await;
            self.set_status(TaskStatus::Running).await;

            let attempt_future = self.run_attempt(error_annotation.as_deref(), cancel);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.finalize_cancelled().await;
                    return;
                }
                result = tokio::time::timeout(
                    Duration::from_millis(self.task.timeout_ms),
                    attempt_future,
                ) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => AttemptOutcome::Failure {
                        message: "timeout".to_string(),
                        category: ErrorCategory::Transient,
                    },
                },
            };

            match outcome {
                AttemptOutcome::Success { reply } => {
                    self.finalize_success(reply, attempt).await;
                    return;
                }
                AttemptOutcome::Failure { message, category } => {
                    let retry = match category {
                        ErrorCategory::Transient => attempt <= self.task.max_retries,
                        ErrorCategory::Logic => {
                            if logic_retried {
                                false
                            } else {
                                logic_retried = true;
                                error_annotation = Some(error_excerpt(&message, 300));
                                true
                            }
                        }
                        ErrorCategory::Permanent | ErrorCategory::Unknown => false,
                    };

                    if retry {
                        tracing::debug!(
                            task = %self.task.task_id,
                            attempt,
                            ?category,
                            "task attempt failed, retrying"
                        );
                        self.set_status(TaskStatus::Retrying).await;
                        {
                            let mut map = self.progress.lock().await;
                            if let Some(record) = map.get_mut(&self.task.task_id) {
                                record.last_error = Some(message);
                            }
                        }
                        continue;
                    }

                    self.finalize_error(message).await;
                    return;
                }
            }
        }
    }

    fn build_prompt(&self, error_annotation: Option<&str>, bus_delta: &str, warning: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.ctx.plan_anchor);
        if !bus_delta.is_empty() {
            prompt.push('\n');
            prompt.push_str(bus_delta);
        }
        if !self.ctx.prior_context.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.ctx.prior_context);
        }
        if !warning.is_empty() {
            prompt.push('\n');
            prompt.push_str(warning);
        }
        prompt.push_str("\n\n## YOUR TASK\n");
        prompt.push_str(&self.task.prompt);
        if !self.task.planned_files.is_empty() {
            prompt.push_str("\n\nFiles you own:\n");
            for file in &self.task.planned_files {
                prompt.push_str(&format!("- {file}\n"));
            }
        }
        if !self.task.acceptance.is_empty() {
            prompt.push_str("\nAcceptance checks:\n");
            for check in &self.task.acceptance {
                prompt.push_str(&format!("- {check}\n"));
            }
        }
        if let Some(excerpt) = error_annotation {
            prompt.push_str(&format!(
                "\nThe previous attempt failed with:\n{excerpt}\nFix the cause before retrying the same approach.\n"
            ));
        }
        prompt
    }

    /// One attempt: an agent loop of model requests and tool dispatches.
    async fn run_attempt(
        &self,
        error_annotation: Option<&str>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let spec = self.agents.expect("coding-agent");
        let bus_delta = self.bus.lock().await.to_delta_string(4000);
        let warning = self
            .stuck
            .lock()
            .await
            .take_warning()
            .unwrap_or_default()
            .to_string();

        let mut messages = vec![Message::user(self.build_prompt(
            error_annotation,
            &bus_delta,
            &warning,
        ))];

        for _round in 0..self.ctx.max_tool_rounds.max(1) {
            let request = LlmRequest {
                agent: spec.name.to_string(),
                system: SystemPrompt::Text(spec.system_prompt.clone()),
                messages: messages.clone(),
                tools: spec.allowed_tools.clone(),
                model: self.ctx.model.clone(),
                timeout_ms: self.task.timeout_ms,
            };

            let response = match self.llm.request(request, cancel).await {
                Ok(response) => response,
                Err(err) => {
                    if err.is_fatal() {
                        *self.fatal_error.lock().await = Some(err.to_string());
                        return AttemptOutcome::Failure {
                            message: err.to_string(),
                            category: ErrorCategory::Permanent,
                        };
                    }
                    let category = match classify_error(&err.message, None) {
                        ErrorCategory::Unknown if err.kind.is_retryable() => {
                            ErrorCategory::Transient
                        }
                        category => category,
                    };
                    return AttemptOutcome::Failure {
                        message: err.to_string(),
                        category,
                    };
                }
            };
            self.usage.lock().await.add(&response.usage);

            if response.tool_calls.is_empty() {
                // Replies that read as errors count as failed attempts,
                // unless the agent also claims completion.
                let category = classify_error(&response.text, None);
                if category != ErrorCategory::Unknown
                    && !contains_completion_marker(&response.text)
                {
                    return AttemptOutcome::Failure {
                        message: response.text,
                        category,
                    };
                }
                return AttemptOutcome::Success {
                    reply: response.text,
                };
            }

            // Feed the stuck tracker one round of calls before dispatch.
            let tracked: Vec<ToolCall> = response
                .tool_calls
                .iter()
                .map(|c| ToolCall::new(&c.name, c.args.clone()))
                .collect();
            self.stuck.lock().await.track(&tracked);

            messages.push(Message::assistant(response.text.clone()));
            let tool_ctx = ToolInvocationCtx {
                session_id: self.ctx.session_id.clone(),
                task_id: self.task.task_id.clone(),
                stage_id: self.stage_id.clone(),
                working_dir: self.ctx.working_dir.clone(),
            };

            let mut tool_report = String::new();
            for call in &response.tool_calls {
                match self.tools.invoke(&call.name, &call.args, &tool_ctx, cancel).await {
                    Ok(outcome) => {
                        let mut attributed = outcome.file_changes;
                        for change in &mut attributed {
                            change.stage_id = self.stage_id.clone();
                            change.task_id = self.task.task_id.clone();
                        }
                        merge_file_changes(
                            &mut *self.file_changes.lock().await,
                            attributed,
                            usize::MAX,
                        );
                        tool_report.push_str(&format!(
                            "[{}] {}\n",
                            call.name,
                            crate::util::truncate_str(&outcome.output, 2000)
                        ));
                    }
                    Err(err) => {
                        return AttemptOutcome::Failure {
                            message: format!("tool {} failed: {err:#}", call.name),
                            category: classify_error(&err.to_string(), None),
                        };
                    }
                }
            }
            messages.push(Message::user(tool_report));
        }

        AttemptOutcome::Failure {
            message: "tool-round budget exhausted without a final reply".to_string(),
            category: ErrorCategory::Unknown,
        }
    }

    async fn finalize_success(&self, reply: String, attempt: u32) {
        self.bus
            .lock()
            .await
            .parse_task_output(&self.task.task_id, &reply);
        if contains_completion_marker(&reply) {
            *self.completion_seen.lock().await = true;
        }

        {
            let mut map = self.progress.lock().await;
            if let Some(record) = map.get_mut(&self.task.task_id) {
                record.transition(TaskStatus::Completed);
                record.last_reply = Some(crate::util::truncate_str(&reply, 4000));
                record.last_error = None;
                record.remaining_files.clear();
            }
        }

        (self.on_task_complete)(
            &self.stage_id,
            &self.task.task_id,
            &json!({
                "task_id": self.task.task_id,
                "stage_id": self.stage_id,
                "status": "completed",
                "attempt": attempt,
            }),
        );
    }

    async fn finalize_error(&self, message: String) {
        let mut map = self.progress.lock().await;
        if let Some(record) = map.get_mut(&self.task.task_id) {
            record.transition(TaskStatus::Error);
            record.last_error = Some(message);
        }
    }

    async fn finalize_cancelled(&self) {
        let mut map = self.progress.lock().await;
        if let Some(record) = map.get_mut(&self.task.task_id) {
            record.transition(TaskStatus::Cancelled);
        }
    }
}
