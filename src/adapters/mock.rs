//! Scripted collaborator implementations for tests.
//!
//! Each mock is driven by a queue of canned responses keyed where it
//! matters (the model mock scripts per sub-agent name) and records what
//! the orchestrator asked of it, so scenario tests can assert on prompts,
//! emitted events and gate traffic.

use crate::adapters::events::{EventSink, OrchestratorEvent};
use crate::adapters::gates::{GateRunRequest, GateRunResult, GateRunner};
use crate::adapters::llm::{LlmAdapter, LlmError, LlmRequest, LlmResponse, Message, TokenUsage};
use crate::adapters::session::SessionStore;
use crate::adapters::tools::{ToolExecutor, ToolInvocationCtx, ToolOutcome};
use crate::adapters::validator::{CompletionValidator, ValidationReport};
use crate::gates::GateCheck;
use crate::plan::FileChange;
use crate::vcs::{CommitOutcome, MergeOutcome, Vcs};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted model reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(LlmError),
}

/// Model adapter driven by per-agent reply queues.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<LlmRequest>>,
    usage_per_call: TokenUsage,
    /// Reply used when an agent's queue is empty.
    fallback: String,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            usage_per_call: TokenUsage {
                input: 1000,
                output: 500,
                cache_read: 0,
                cache_write: 0,
            },
            fallback: "OK".to_string(),
        }
    }

    /// Set the usage attributed to every call.
    pub fn with_usage_per_call(mut self, usage: TokenUsage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Queue a text reply for an agent.
    pub fn push_reply(&self, agent: &str, text: impl Into<String>) {
        self.replies
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(ScriptedReply::Text(text.into()));
    }

    /// Queue an error for an agent.
    pub fn push_error(&self, agent: &str, error: LlmError) {
        self.replies
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(ScriptedReply::Error(error));
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests issued by one agent.
    pub fn requests_for(&self, agent: &str) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent == agent)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn request(
        &self,
        request: LlmRequest,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let agent = request.agent.clone();
        self.requests.lock().unwrap().push(request);

        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&agent)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(ScriptedReply::Text(text)) => Ok(LlmResponse {
                text,
                usage: self.usage_per_call,
                tool_calls: Vec::new(),
            }),
            Some(ScriptedReply::Error(error)) => Err(error),
            None => Ok(LlmResponse {
                text: self.fallback.clone(),
                usage: self.usage_per_call,
                tool_calls: Vec::new(),
            }),
        }
    }
}

/// Tool executor that approves everything and records invocations.
#[derive(Debug, Default)]
pub struct RecordingToolExecutor {
    invocations: Mutex<Vec<(String, Value)>>,
}

impl RecordingToolExecutor {
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for RecordingToolExecutor {
    async fn invoke(
        &self,
        name: &str,
        args: &Value,
        _ctx: &ToolInvocationCtx,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        Ok(ToolOutcome::success("ok"))
    }
}

/// Event sink that records every emitted event.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingEventSink {
    /// All `(session_id, payload)` pairs.
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }

    /// All wire-level type tags, in emission order.
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, payload)| payload["type"].as_str().map(str::to_string))
            .collect()
    }

    /// First payload with the given type tag.
    pub fn find(&self, event_type: &str) -> Option<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, payload)| payload["type"] == event_type)
            .map(|(_, payload)| payload.clone())
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, session_id: &str, event: OrchestratorEvent) {
        self.events
            .lock()
            .unwrap()
            .push((session_id.to_string(), event.to_payload()));
    }
}

/// Session store that accepts everything and keeps nothing.
#[derive(Debug, Default)]
pub struct NullSessionStore {
    statuses: Mutex<Vec<String>>,
}

impl NullSessionStore {
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn touch_session(&self, _session_id: &str, _meta: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_session_status(&self, _session_id: &str, status: &str) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push(status.to_string());
        Ok(())
    }

    async fn get_conversation_history(
        &self,
        _session_id: &str,
        _limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn replace_messages(
        &self,
        _session_id: &str,
        _messages: &[Message],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Gate runner driven by a queue of checks; defaults to pass when empty.
#[derive(Debug, Default)]
pub struct ScriptedGateRunner {
    checks: Mutex<VecDeque<GateCheck>>,
    requests: Mutex<Vec<GateRunRequest>>,
}

impl ScriptedGateRunner {
    pub fn push_check(&self, check: GateCheck) {
        self.checks.lock().unwrap().push_back(check);
    }

    pub fn requests(&self) -> Vec<GateRunRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GateRunner for ScriptedGateRunner {
    async fn run_usability_gates(
        &self,
        request: GateRunRequest,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<GateRunResult> {
        self.requests.lock().unwrap().push(request);
        let check = self
            .checks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(GateCheck::passed);
        Ok(GateRunResult { check, usage: None })
    }
}

/// Completion validator driven by a queue of reports; defaults to pass.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    reports: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedValidator {
    pub fn push_report(&self, report: ValidationReport) {
        self.reports.lock().unwrap().push_back(report);
    }
}

#[async_trait]
impl CompletionValidator for ScriptedValidator {
    async fn validate(
        &self,
        _objective: &str,
        _file_changes: &[FileChange],
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ValidationReport> {
        Ok(self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(ValidationReport::pass))
    }
}

/// In-memory `Vcs` with a scriptable merge outcome.
#[derive(Debug)]
pub struct MockVcs {
    pub repo_detected: bool,
    branch: Mutex<String>,
    merge_outcomes: Mutex<VecDeque<MergeOutcome>>,
    pub operations: Mutex<Vec<String>>,
    clean: bool,
}

impl Default for MockVcs {
    fn default() -> Self {
        Self {
            repo_detected: true,
            branch: Mutex::new("main".to_string()),
            merge_outcomes: Mutex::new(VecDeque::new()),
            operations: Mutex::new(Vec::new()),
            clean: true,
        }
    }
}

impl MockVcs {
    pub fn with_dirty_tree(mut self) -> Self {
        self.clean = false;
        self
    }

    pub fn push_merge_outcome(&self, outcome: MergeOutcome) {
        self.merge_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.operations.lock().unwrap().push(op);
    }
}

impl Vcs for MockVcs {
    fn is_repo(&self, _cwd: &Path) -> bool {
        self.repo_detected
    }

    fn current_branch(&self, _cwd: &Path) -> anyhow::Result<String> {
        Ok(self.branch.lock().unwrap().clone())
    }

    fn is_clean(&self, _cwd: &Path) -> anyhow::Result<bool> {
        Ok(self.clean)
    }

    fn stash(&self, message: &str, _cwd: &Path) -> anyhow::Result<bool> {
        self.record(format!("stash:{message}"));
        Ok(true)
    }

    fn stash_pop(&self, _cwd: &Path) -> anyhow::Result<()> {
        self.record("stash_pop".to_string());
        Ok(())
    }

    fn create_branch(&self, name: &str, _cwd: &Path) -> anyhow::Result<()> {
        self.record(format!("create_branch:{name}"));
        Ok(())
    }

    fn checkout_branch(&self, name: &str, _cwd: &Path) -> anyhow::Result<()> {
        self.record(format!("checkout:{name}"));
        *self.branch.lock().unwrap() = name.to_string();
        Ok(())
    }

    fn merge_branch(&self, name: &str, _cwd: &Path) -> anyhow::Result<MergeOutcome> {
        self.record(format!("merge:{name}"));
        Ok(self
            .merge_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeOutcome::Merged))
    }

    fn delete_branch(&self, name: &str, _cwd: &Path) -> anyhow::Result<()> {
        self.record(format!("delete_branch:{name}"));
        Ok(())
    }

    fn commit_all(&self, message: &str, _cwd: &Path) -> anyhow::Result<CommitOutcome> {
        self.record(format!("commit:{message}"));
        Ok(CommitOutcome {
            ok: true,
            message: message.to_string(),
        })
    }

    fn conflict_files(&self, _cwd: &Path) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn merge_abort(&self, _cwd: &Path) -> anyhow::Result<()> {
        self.record("merge_abort".to_string());
        Ok(())
    }
}
