//! The hybrid orchestrator driver: walks phases H0…H7, invokes the stage
//! barrier for the coding loop, the debugging loop with its rollback edge,
//! the gate fix-and-retry loop and the VCS merge, while handling budget,
//! degradation, checkpoints and cancellation.

use crate::adapters::events::{EventSink, OrchestratorEvent};
use crate::adapters::gates::{GateRunRequest, GateRunner};
use crate::adapters::llm::{LlmAdapter, LlmRequest, Message, SystemPrompt};
use crate::adapters::session::SessionStore;
use crate::adapters::tools::{ToolExecutor, ToolInvocationCtx};
use crate::adapters::validator::CompletionValidator;
use crate::agents::AgentRegistry;
use crate::bus::TaskBus;
use crate::checkpoint::{Checkpoint, CheckpointStore, CleanupPolicy, validate_checkpoint};
use crate::config::RunConfig;
use crate::errors::OrchestratorError;
use crate::failure::{
    DegradationChain, DegradationConfig, DegradationStrategy, SemanticErrorTracker, StuckTracker,
    ToolCall,
};
use crate::gates::{FixStrategy, GatesConfig, select_fix_strategy};
use crate::markers::{
    contains_completion_marker, extract_failed_task_ids, extract_replan, extract_return_to_stage,
    extract_stage_complete_reports,
};
use crate::memory::ProjectMemory;
use crate::orchestrator::budget::{BudgetSignal, BudgetTracker};
use crate::orchestrator::context::{build_plan_anchor, compression_prompt, stage_summary};
use crate::orchestrator::phase::HybridPhase;
use crate::orchestrator::state::{RecoverySuggestions, RunResult, RunState, RunStatus};
use crate::plan::{StagePlan, TaskProgress, merge_file_changes, validate_plan};
use crate::plan::parser::parse_blueprint_output;
use crate::scheduler::{StageBarrier, StageRunContext, TaskCompleteHook};
use crate::vcs::{BranchLifecycle, MergeStart, Vcs};
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Default timeout for phase-level agent calls.
const PHASE_AGENT_TIMEOUT_MS: u64 = 300_000;

/// External collaborators wired in by the host application.
pub struct Collaborators {
    pub llm: Arc<dyn LlmAdapter>,
    pub tools: Arc<dyn ToolExecutor>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn EventSink>,
    pub gate_runner: Arc<dyn GateRunner>,
    pub validator: Option<Arc<dyn CompletionValidator>>,
    pub vcs: Arc<dyn Vcs>,
}

/// Verdict from the coding loop.
enum CodingVerdict {
    Finished,
    Stopped(RunStatus),
}

/// Verdict from the debugging loop.
enum DebugVerdict {
    StageComplete,
    Rollback(usize),
    Exhausted,
    Stopped(RunStatus),
}

/// The top-level orchestrator.
pub struct HybridOrchestrator {
    config: RunConfig,
    collab: Collaborators,
    agents: Arc<AgentRegistry>,
    store: CheckpointStore,
    barrier: StageBarrier,
}

impl HybridOrchestrator {
    pub fn new(config: RunConfig, collab: Collaborators) -> Self {
        let agents = Arc::new(AgentRegistry::default());
        let store = CheckpointStore::new(config.checkpoint_root());
        let barrier = StageBarrier::new(
            Arc::clone(&collab.llm),
            Arc::clone(&collab.tools),
            Arc::clone(&agents),
        );
        Self {
            config,
            collab,
            agents,
            store,
            barrier,
        }
    }

    /// The checkpoint store backing this orchestrator.
    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    fn emit(&self, session_id: &str, event: OrchestratorEvent) {
        self.collab.events.emit(session_id, event);
    }

    fn transition(&self, session_id: &str, phase: &mut HybridPhase, to: HybridPhase) {
        self.emit(
            session_id,
            OrchestratorEvent::PhaseChanged {
                from: phase.code().to_string(),
                to: to.code().to_string(),
            },
        );
        tracing::info!(from = phase.code(), to = to.code(), "phase change");
        *phase = to;
    }

    /// Run a fresh session for an objective.
    pub async fn run(&self, objective: &str, cancel: &CancellationToken) -> Result<RunResult> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.run_session(objective, &session_id, None, cancel).await
    }

    /// Resume a session from its latest valid checkpoint. An invalid or
    /// missing checkpoint is discarded and reported as an error.
    pub async fn resume(&self, session_id: &str, cancel: &CancellationToken) -> Result<RunResult> {
        match self.store.load_latest(session_id) {
            Some(checkpoint) if validate_checkpoint(&checkpoint) => {
                let objective = checkpoint.stage_plan.objective.clone();
                self.run_session(&objective, session_id, Some(checkpoint), cancel)
                    .await
            }
            _ => {
                self.emit(session_id, OrchestratorEvent::HybridCheckpointInvalid);
                Err(anyhow!("no valid checkpoint for session {session_id}"))
            }
        }
    }

    async fn run_session(
        &self,
        objective: &str,
        session_id: &str,
        checkpoint: Option<Checkpoint>,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let started = Instant::now();
        let cfg = &self.config.orchestrator;

        let mut state = RunState::new(session_id, &cfg.model, cfg.max_parallel);
        let mut phase = HybridPhase::Intake;

        // Pre-flight: an empty objective is not actionable.
        if objective.trim().is_empty() {
            let err = OrchestratorError::Blocked("objective is empty".to_string());
            tracing::warn!("{err}");
            return Ok(self.finalize(
                &mut state,
                phase,
                Some(RunStatus::Blocked),
                started,
                None,
            ));
        }

        let _lock = self.store.lock_session(session_id)?;
        let _ = self
            .collab
            .sessions
            .touch_session(session_id, &json!({"objective": objective, "mode": "longagent"}))
            .await;
        let _ = self
            .collab
            .sessions
            .mark_session_status(session_id, "running")
            .await;

        let stuck = Arc::new(Mutex::new(StuckTracker::new(cfg.stuck_history)));
        let mut semantic = SemanticErrorTracker::new(cfg.semantic_threshold);
        let mut budget = BudgetTracker::new(cfg.token_budget);
        let mut degradation = DegradationChain::new(DegradationConfig {
            fallback_model: cfg.fallback_model.clone(),
            skip_non_critical: cfg.skip_non_critical,
        });
        let bus = Arc::new(Mutex::new(TaskBus::new(cfg.bus_max_messages)));
        let mut lifecycle =
            BranchLifecycle::new(Arc::clone(&self.collab.vcs), &self.config.project_dir);

        let memory_path = ProjectMemory::default_path(&self.config.project_dir);
        let memory = ProjectMemory::load(&memory_path);
        if let Some(memory) = &memory {
            self.emit(
                session_id,
                OrchestratorEvent::HybridMemoryLoaded {
                    entries: memory.len(),
                },
            );
        }
        let memory_section = memory
            .as_ref()
            .map(ProjectMemory::to_prompt_section)
            .unwrap_or_default();

        let resumed = checkpoint.is_some();
        if let Some(cp) = checkpoint {
            state.iteration = cp.iteration;
            state.stage_index = cp.stage_index;
            state.task_progress = cp.task_progress;
            state.prior_context = cp.prior_context;
            state.last_progress = cp.last_progress;
            self.emit(
                session_id,
                OrchestratorEvent::HybridCheckpointResumed {
                    stage_index: cp.stage_index,
                    iteration: cp.iteration,
                },
            );
            state.plan = Some(cp.stage_plan);
        }

        if !resumed {
            // ── H0 Intake ────────────────────────────────────────────────
            if cfg.max_intake_rounds > 0 {
                if let Err(err) = self
                    .run_intake(&mut state, objective, &memory_section, &stuck, cancel)
                    .await
                {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            }

            // ── H1 Preview ───────────────────────────────────────────────
            if cancel.is_cancelled() {
                return Ok(self.finalize(
                    &mut state,
                    phase,
                    Some(RunStatus::Stopped),
                    started,
                    None,
                ));
            }
            self.transition(session_id, &mut phase, HybridPhase::Preview);
            self.emit(session_id, OrchestratorEvent::HybridPreviewStart);
            let preview_prompt = format!(
                "{memory_section}Objective:\n{objective}\n\nExplore the codebase read-only and \
                 report structure, conventions and the extension points this objective will \
                 touch."
            );
            match self
                .call_agent(&mut state, &stuck, "preview-agent", preview_prompt, cancel)
                .await
            {
                Ok(findings) => {
                    state
                        .gate_status
                        .insert("preview".to_string(), json!({"status": "pass"}));
                    self.emit(
                        session_id,
                        OrchestratorEvent::HybridPreviewComplete {
                            findings_len: findings.len(),
                        },
                    );
                    state.preview_findings = findings;
                }
                Err(err) => {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            }

            // ── H2 Blueprint ─────────────────────────────────────────────
            self.transition(session_id, &mut phase, HybridPhase::Blueprint);
            self.emit(session_id, OrchestratorEvent::HybridBlueprintStart);
            let blueprint_prompt = format!(
                "Objective:\n{objective}\n\n{}{}\n\nProduce the architecture overview and the \
                 stage plan JSON in a ```stage-plan fence. Stages are sequential; tasks within \
                 a stage run in parallel and must claim disjoint files.",
                if state.intake_summary.is_empty() {
                    String::new()
                } else {
                    format!("Intake summary:\n{}\n\n", state.intake_summary)
                },
                format!("Preview findings:\n{}", state.preview_findings),
            );
            let blueprint_reply = match self
                .call_agent(&mut state, &stuck, "blueprint-agent", blueprint_prompt, cancel)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            };
            self.emit(session_id, OrchestratorEvent::HybridBlueprintComplete);

            let raw = parse_blueprint_output(&blueprint_reply).unwrap_or(Value::Null);
            let validation = validate_plan(objective, &raw);
            self.emit(
                session_id,
                OrchestratorEvent::HybridBlueprintValidated {
                    errors: validation.errors.len(),
                    warnings: validation.warnings.len(),
                    quality_score: validation.quality_score,
                },
            );
            for warning in &validation.warnings {
                tracing::warn!("plan warning: {warning}");
            }
            self.freeze_plan(&mut state, validation.plan, validation.quality_score);

            // ── H2.5 VCS branch ──────────────────────────────────────────
            if cfg.vcs_enabled {
                self.transition(session_id, &mut phase, HybridPhase::VcsBranch);
                match lifecycle.begin(session_id) {
                    Ok(true) => {
                        let branch_state = lifecycle.state().clone();
                        self.emit(
                            session_id,
                            OrchestratorEvent::GitBranchCreated {
                                branch: branch_state.branch.clone().unwrap_or_default(),
                                base: branch_state.base_branch.clone().unwrap_or_default(),
                            },
                        );
                    }
                    Ok(false) => {
                        tracing::info!("no repository detected, session branch skipped");
                    }
                    Err(err) => {
                        return self.fail_run(
                            &mut state,
                            phase,
                            started,
                            &mut lifecycle,
                            OrchestratorError::Vcs(format!("{err:#}")),
                        );
                    }
                }
            }

            // ── H3 Scaffold ──────────────────────────────────────────────
            self.transition(session_id, &mut phase, HybridPhase::Scaffold);
            let plan = state.plan.clone().expect("plan frozen in H2");
            let planned: Vec<String> = plan
                .stages
                .iter()
                .flat_map(|s| s.tasks.iter())
                .flat_map(|t| t.planned_files.iter().cloned())
                .collect();
            if !planned.is_empty() {
                let scaffold_prompt = format!(
                    "Create stub files for the plan. Each stub carries inline comments \
                     describing intended signatures and behavior; no implementations.\n\
                     Planned files:\n{}",
                    planned
                        .iter()
                        .map(|f| format!("- {f}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                if let Err(err) = self
                    .call_agent(&mut state, &stuck, "scaffold-agent", scaffold_prompt, cancel)
                    .await
                {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            }
            self.emit(
                session_id,
                OrchestratorEvent::ScaffoldComplete {
                    files: state.file_changes.len(),
                },
            );
        }

        // ── H4 Coding ⇄ H5 Debugging ─────────────────────────────────────
        self.transition(session_id, &mut phase, HybridPhase::Coding);
        let coding_started = Instant::now();
        loop {
            let verdict = self
                .run_coding_loop(
                    &mut state,
                    &bus,
                    &stuck,
                    &mut budget,
                    &mut degradation,
                    &mut lifecycle,
                    coding_started,
                    cancel,
                )
                .await;
            match verdict {
                Ok(CodingVerdict::Finished) => {}
                Ok(CodingVerdict::Stopped(status)) => {
                    return Ok(self.finalize(
                        &mut state,
                        phase,
                        Some(status),
                        started,
                        Some(&mut lifecycle),
                    ));
                }
                Err(err) => {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            }
            if state.should_stop {
                break;
            }

            // Optional cross-review seeds the debugging loop.
            let mut seeded_failures = Vec::new();
            if cfg.cross_review {
                let review_prompt = format!(
                    "Audit the modified files against the objective and acceptance checks.\n\
                     {}\nFlag broken tasks with [FAILED_TASK: id] lines.",
                    state.prior_context
                );
                if let Ok(reply) = self
                    .call_agent(&mut state, &stuck, "review-agent", review_prompt, cancel)
                    .await
                {
                    seeded_failures = extract_failed_task_ids(&reply);
                    if !seeded_failures.is_empty() {
                        self.emit(
                            session_id,
                            OrchestratorEvent::HybridBlueprintReview {
                                failed_tasks: seeded_failures.clone(),
                            },
                        );
                    }
                }
            }

            self.transition(session_id, &mut phase, HybridPhase::Debugging);
            match self
                .run_debugging_loop(
                    &mut state,
                    &stuck,
                    &mut semantic,
                    &mut degradation,
                    seeded_failures,
                    cancel,
                )
                .await
            {
                Ok(DebugVerdict::Rollback(stage_number)) => {
                    let stage_count = state.plan.as_ref().map(|p| p.stages.len()).unwrap_or(1);
                    state.stage_index = stage_number.saturating_sub(1).min(stage_count - 1);
                    self.transition(session_id, &mut phase, HybridPhase::Coding);
                    continue;
                }
                Ok(DebugVerdict::StageComplete | DebugVerdict::Exhausted) => break,
                Ok(DebugVerdict::Stopped(status)) => {
                    return Ok(self.finalize(
                        &mut state,
                        phase,
                        Some(status),
                        started,
                        Some(&mut lifecycle),
                    ));
                }
                Err(err) => {
                    return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
                }
            }
        }

        // ── H5.5 Completion validation ───────────────────────────────────
        if !state.should_stop && cfg.completion_validation {
            if let Some(validator) = &self.collab.validator {
                self.transition(session_id, &mut phase, HybridPhase::CompletionValidation);
                match validator
                    .validate(objective, &state.file_changes, cancel)
                    .await
                {
                    Ok(report) if report.is_blocked() => {
                        let fix_prompt = format!(
                            "Completion validation blocked the run with this report; fix the \
                             causes:\n{}",
                            report.report
                        );
                        let _ = self
                            .call_agent(&mut state, &stuck, "coding-agent", fix_prompt, cancel)
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("completion validator failed: {err:#}"),
                }
            }
        }

        // ── H6 Gates ─────────────────────────────────────────────────────
        if !state.should_stop {
            self.transition(session_id, &mut phase, HybridPhase::Gates);
            if let Err(err) = self.run_gate_loop(&mut state, &stuck, cancel).await {
                return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
            }
        }

        // ── H7 VCS merge ─────────────────────────────────────────────────
        if lifecycle.state().active {
            self.transition(session_id, &mut phase, HybridPhase::VcsMerge);
            if let Err(err) = self
                .run_vcs_merge(&mut state, &mut lifecycle, &stuck, cancel)
                .await
            {
                return self.fail_run(&mut state, phase, started, &mut lifecycle, err);
            }
        }

        self.transition(session_id, &mut phase, HybridPhase::Finalized);
        let mut result = self.finalize(&mut state, phase, None, started, Some(&mut lifecycle));

        // Save enriched project memory at the end of a successful run.
        if result.status == RunStatus::Completed || result.status == RunStatus::Done {
            let mut memory = memory.unwrap_or_default();
            if let Some(plan) = &state.plan {
                memory.add_pattern(format!(
                    "objective '{}' decomposed into {} stage(s)",
                    crate::util::truncate_str(&plan.objective, 80),
                    plan.stages.len()
                ));
            }
            if memory.save(&memory_path).is_ok() {
                self.emit(
                    session_id,
                    OrchestratorEvent::HybridMemorySaved {
                        entries: memory.len(),
                    },
                );
            }
        }

        let final_status = match result.status {
            RunStatus::Completed => "completed",
            RunStatus::Done => "done",
            RunStatus::Stopped => "stopped",
            _ => "error",
        };
        let _ = self
            .collab
            .sessions
            .mark_session_status(session_id, final_status)
            .await;

        result.elapsed_secs = started.elapsed().as_secs();
        Ok(result)
    }

    // =====================================================================
    // Phase bodies
    // =====================================================================

    async fn run_intake(
        &self,
        state: &mut RunState,
        objective: &str,
        memory_section: &str,
        stuck: &Arc<Mutex<StuckTracker>>,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let max_rounds = self.config.orchestrator.max_intake_rounds;
        for round in 1..=max_rounds {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let prompt = format!(
                "{memory_section}Objective:\n{objective}\n\nRound {round}/{max_rounds}. \
                 Previous summary:\n{}\n\nAsk the next clarification question, or reply with \
                 the final technical summary and the line `enough: true` when you understand \
                 enough to plan.",
                if state.intake_summary.is_empty() {
                    "(none yet)"
                } else {
                    state.intake_summary.as_str()
                }
            );
            let reply = self
                .call_agent(state, stuck, "ask-agent", prompt, cancel)
                .await?;
            let enough = reply.to_lowercase().contains("enough: true");
            state.intake_summary = reply;
            // The agent may not conclude before round 2.
            if enough && round >= 2 {
                break;
            }
        }
        Ok(())
    }

    fn freeze_plan(&self, state: &mut RunState, plan: StagePlan, quality_score: u8) {
        self.emit(
            &state.session_id,
            OrchestratorEvent::PlanFrozen {
                plan_id: plan.plan_id.clone(),
                stage_count: plan.stages.len(),
                task_count: plan.task_count(),
                quality_score,
            },
        );
        state.plan = Some(plan);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_coding_loop(
        &self,
        state: &mut RunState,
        bus: &Arc<Mutex<TaskBus>>,
        stuck: &Arc<Mutex<StuckTracker>>,
        budget: &mut BudgetTracker,
        degradation: &mut DegradationChain,
        lifecycle: &mut BranchLifecycle,
        coding_started: Instant,
        cancel: &CancellationToken,
    ) -> Result<CodingVerdict, OrchestratorError> {
        let cfg = &self.config.orchestrator;
        let session_id = state.session_id.clone();
        let mut stage_attempts: HashMap<usize, u32> = HashMap::new();
        let mut files_seen: BTreeSet<String> =
            state.file_changes.iter().map(|c| c.path.clone()).collect();

        loop {
            let plan = state.plan.clone().expect("plan frozen before coding");
            let stage_count = plan.stages.len();
            if state.stage_index >= stage_count {
                return Ok(CodingVerdict::Finished);
            }
            if cancel.is_cancelled() {
                return Ok(CodingVerdict::Stopped(RunStatus::Stopped));
            }
            if let Some(timeout_ms) = cfg.coding_phase_timeout_ms {
                if coding_started.elapsed() >= Duration::from_millis(timeout_ms) {
                    self.emit(
                        &session_id,
                        OrchestratorEvent::PhaseTimeout {
                            phase: HybridPhase::Coding.code().to_string(),
                            timeout_ms,
                        },
                    );
                    match self.apply_degradation(state, degradation) {
                        Some(_) if state.should_stop => return Ok(CodingVerdict::Finished),
                        Some(_) => {}
                        None => {
                            return Err(OrchestratorError::PhaseTimeout {
                                phase: HybridPhase::Coding.code().to_string(),
                                timeout_ms,
                            });
                        }
                    }
                }
            }

            let i = state.stage_index;
            let stage = plan.stages[i].clone();
            let anchor = build_plan_anchor(&plan, i);

            // Seed from run-wide progress plus any task checkpoints.
            let mut seed: HashMap<String, TaskProgress> = HashMap::new();
            for task in &stage.tasks {
                if let Some(record) = state.task_progress.get(&task.task_id) {
                    seed.insert(task.task_id.clone(), record.clone());
                }
            }

            let store = self.store.clone();
            let hook_session = session_id.clone();
            let hook: TaskCompleteHook = Arc::new(move |stage_id, task_id, data| {
                if let Err(err) =
                    store.save_task_checkpoint(&hook_session, stage_id, task_id, data)
                {
                    tracing::warn!("task checkpoint write failed: {err}");
                }
            });

            let ctx = StageRunContext {
                session_id: session_id.clone(),
                working_dir: self.config.project_dir.clone(),
                plan_anchor: anchor,
                prior_context: state.prior_context.clone(),
                model: state.model.clone(),
                max_parallel: state.max_parallel,
                max_tool_rounds: cfg.max_tool_rounds,
                seed,
            };

            let outcome = self
                .barrier
                .run_stage_barrier(
                    &stage,
                    ctx,
                    Arc::clone(bus),
                    Arc::clone(stuck),
                    hook,
                    cancel,
                )
                .await;

            state.usage.add(&outcome.usage);
            if let Some(fatal) = outcome.fatal_error {
                return Err(OrchestratorError::AuthFailed(fatal));
            }
            state.merge_progress(outcome.task_progress.clone());
            merge_file_changes(
                &mut state.file_changes,
                outcome.file_changes.clone(),
                cfg.file_change_cap,
            );
            state.completion_marker_seen |= outcome.completion_marker_seen;

            if cancel.is_cancelled() {
                return Ok(CodingVerdict::Stopped(RunStatus::Stopped));
            }

            if outcome.all_success {
                // A task may propose a replacement plan mid-run; it only
                // takes effect after re-validation and a fresh freeze.
                self.try_replan(state, &outcome.task_progress);

                let summary = stage_summary(
                    &stage,
                    &state.task_progress,
                    &outcome.file_changes,
                    &mut files_seen,
                );
                state.prior_context.push('\n');
                state.prior_context.push_str(&summary);
                state.stage_index = i + 1;
                state.last_progress = (state.stage_index as f64 / stage_count as f64) * 100.0;
                state.iteration += 1;

                self.save_checkpoint(state, HybridPhase::Coding);
                self.store
                    .save_stage_checkpoint(
                        &session_id,
                        &stage.stage_id,
                        &json!({
                            "stage_id": stage.stage_id,
                            "all_success": true,
                            "success_count": outcome.success_count,
                        }),
                    )
                    .ok();
                let deleted = self.store.cleanup_checkpoints(
                    &session_id,
                    CleanupPolicy {
                        max_keep: cfg.checkpoint_max_keep,
                        keep_stage_checkpoints: cfg.keep_stage_checkpoints,
                    },
                );
                if deleted > 0 {
                    self.emit(&session_id, OrchestratorEvent::CheckpointCleaned { deleted });
                }

                if lifecycle.state().active {
                    if let Err(err) = lifecycle.commit_stage(&stage.stage_id) {
                        tracing::warn!("stage auto-commit failed: {err:#}");
                    }
                }

                if cfg.incremental_gate {
                    self.run_incremental_gate(state, &stage.stage_id, cancel).await;
                }

                match budget.check(state.usage.total(), state.stage_index, stage_count) {
                    Some(BudgetSignal::Warn { used, budget }) => {
                        self.emit(
                            &session_id,
                            OrchestratorEvent::HybridBudgetWarning {
                                used,
                                budget,
                                forecast: false,
                            },
                        );
                    }
                    Some(BudgetSignal::Forecast { predicted, budget }) => {
                        self.emit(
                            &session_id,
                            OrchestratorEvent::HybridBudgetWarning {
                                used: predicted,
                                budget,
                                forecast: true,
                            },
                        );
                    }
                    Some(BudgetSignal::Exceeded { used, budget: limit }) => {
                        self.emit(
                            &session_id,
                            OrchestratorEvent::HybridBudgetWarning {
                                used,
                                budget: limit,
                                forecast: false,
                            },
                        );
                        self.apply_degradation(state, degradation);
                        if state.should_stop || !degradation.can_degrade() {
                            return Err(OrchestratorError::BudgetExhausted {
                                budget: limit,
                                used,
                            });
                        }
                    }
                    None => {}
                }

                self.relieve_context_pressure(state, cancel).await;
            } else {
                state.recovery_count += 1;
                let attempts = stage_attempts.entry(i).or_insert(0);
                *attempts += 1;

                if *attempts > cfg.max_stage_recoveries {
                    match self.apply_degradation(state, degradation) {
                        Some(DegradationStrategy::GracefulStop) => {
                            return Ok(CodingVerdict::Finished);
                        }
                        Some(_) => {
                            // Retry the stage under the degraded regime.
                        }
                        None => {
                            return Err(OrchestratorError::StageUnrecoverable {
                                stage_id: stage.stage_id.clone(),
                                recoveries: *attempts,
                            });
                        }
                    }
                }

                // Exponential backoff, capped.
                let exponent = attempts.saturating_sub(1).min(16);
                let backoff = (cfg.backoff_base_ms.saturating_mul(1u64 << exponent))
                    .min(cfg.backoff_cap_ms);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Ok(CodingVerdict::Stopped(RunStatus::Stopped));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                }

                state.reset_failed_tasks(None);
            }
        }
    }

    /// Honor a `[REPLAN: {...}]` marker found in a task reply: re-validate
    /// and re-freeze, or reject.
    fn try_replan(&self, state: &mut RunState, progress: &HashMap<String, TaskProgress>) {
        let Some(json_text) = progress
            .values()
            .filter_map(|p| p.last_reply.as_deref())
            .find_map(extract_replan)
        else {
            return;
        };
        let Ok(raw) = serde_json::from_str::<Value>(&json_text) else {
            return;
        };
        let objective = state
            .plan
            .as_ref()
            .map(|p| p.objective.clone())
            .unwrap_or_default();
        let validation = validate_plan(&objective, &raw);
        if validation.errors.is_empty() && !validation.used_fallback {
            tracing::info!("replan accepted: {} stage(s)", validation.plan.stages.len());
            self.freeze_plan(state, validation.plan, validation.quality_score);
        } else {
            self.emit(
                &state.session_id,
                OrchestratorEvent::Alert {
                    kind: "replan_rejected".to_string(),
                    detail: validation.errors.join("; "),
                },
            );
        }
    }

    async fn run_incremental_gate(
        &self,
        state: &mut RunState,
        stage_id: &str,
        cancel: &CancellationToken,
    ) {
        let config = GatesConfig {
            build: false,
            test: false,
            review: false,
            health: false,
            budget: false,
            lint: true,
            typecheck: true,
            security: false,
            lint_autofix_command: None,
        };
        let request = GateRunRequest {
            objective: state
                .plan
                .as_ref()
                .map(|p| p.objective.clone())
                .unwrap_or_default(),
            file_changes: state.file_changes.clone(),
            config,
        };
        match self.collab.gate_runner.run_usability_gates(request, cancel).await {
            Ok(result) => {
                if let Some(usage) = result.usage {
                    state.usage.add(&usage);
                }
                self.emit(
                    &state.session_id,
                    OrchestratorEvent::HybridIncrementalGate {
                        stage_id: stage_id.to_string(),
                        passed: result.check.all_passed,
                    },
                );
            }
            Err(err) => tracing::warn!("incremental gate failed to run: {err:#}"),
        }
    }

    async fn run_debugging_loop(
        &self,
        state: &mut RunState,
        stuck: &Arc<Mutex<StuckTracker>>,
        semantic: &mut SemanticErrorTracker,
        degradation: &mut DegradationChain,
        seeded_failures: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<DebugVerdict, OrchestratorError> {
        let cfg = &self.config.orchestrator;
        let session_id = state.session_id.clone();
        let started = Instant::now();
        let plan = state.plan.clone().expect("plan frozen before debugging");
        let stage_count = plan.stages.len();

        let mut seed_note = String::new();
        if !seeded_failures.is_empty() {
            seed_note = format!(
                "Cross-review flagged these tasks:\n{}\n",
                seeded_failures
                    .iter()
                    .map(|id| format!("- {id}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
        }

        for iteration in 1..=cfg.max_debug_iterations {
            if cancel.is_cancelled() {
                return Ok(DebugVerdict::Stopped(RunStatus::Stopped));
            }
            if let Some(timeout_ms) = cfg.debugging_phase_timeout_ms {
                if started.elapsed() >= Duration::from_millis(timeout_ms) {
                    self.emit(
                        &session_id,
                        OrchestratorEvent::PhaseTimeout {
                            phase: HybridPhase::Debugging.code().to_string(),
                            timeout_ms,
                        },
                    );
                    self.apply_degradation(state, degradation);
                    if state.should_stop {
                        return Ok(DebugVerdict::Exhausted);
                    }
                }
            }

            self.emit(
                &session_id,
                OrchestratorEvent::HybridDebuggingStart { iteration },
            );

            let prompt = format!(
                "{seed_note}Verify the implemented stages and fix what is broken.\n{}\n\n\
                 When a stage is verified, emit [STAGE {}/{}: {} - COMPLETE]. If a coding task \
                 must be redone, emit [RETURN TO STAGE n] plus one [FAILED_TASK: id] line per \
                 task.",
                state.prior_context,
                stage_count,
                stage_count,
                plan.stages
                    .last()
                    .map(|s| s.name.as_str())
                    .unwrap_or("final"),
            );
            let reply = self
                .call_agent(state, stuck, "debugging-agent", prompt, cancel)
                .await?;

            // Alerts, not failures.
            let verdict = semantic.observe(&reply);
            if verdict.is_repeated {
                if let Some(message) = verdict.message.clone() {
                    self.emit(
                        &session_id,
                        OrchestratorEvent::SemanticErrorRepeated { message },
                    );
                }
            }

            if !extract_stage_complete_reports(&reply).is_empty() {
                self.emit(
                    &session_id,
                    OrchestratorEvent::HybridDebuggingComplete { iterations: iteration },
                );
                return Ok(DebugVerdict::StageComplete);
            }

            if let Some(stage_number) = extract_return_to_stage(&reply) {
                if state.coding_rollback_count >= cfg.max_coding_rollbacks {
                    self.emit(
                        &session_id,
                        OrchestratorEvent::Alert {
                            kind: "rollback_limit".to_string(),
                            detail: format!(
                                "rollback to stage {stage_number} denied after {} rollbacks",
                                state.coding_rollback_count
                            ),
                        },
                    );
                    continue;
                }
                state.coding_rollback_count += 1;
                let failed = extract_failed_task_ids(&reply);
                self.emit(
                    &session_id,
                    OrchestratorEvent::HybridReturnToCoding {
                        rollback: state.coding_rollback_count,
                        failed_tasks: failed.clone(),
                    },
                );
                if failed.is_empty() {
                    state.reset_failed_tasks(None);
                } else {
                    state.reset_failed_tasks(Some(&failed));
                }
                return Ok(DebugVerdict::Rollback(stage_number));
            }
        }

        self.emit(
            &session_id,
            OrchestratorEvent::HybridDebuggingComplete {
                iterations: cfg.max_debug_iterations,
            },
        );
        Ok(DebugVerdict::Exhausted)
    }

    async fn run_gate_loop(
        &self,
        state: &mut RunState,
        stuck: &Arc<Mutex<StuckTracker>>,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let cfg = &self.config.orchestrator;
        let session_id = state.session_id.clone();
        let objective = state
            .plan
            .as_ref()
            .map(|p| p.objective.clone())
            .unwrap_or_default();

        for attempt in 1..=cfg.max_gate_attempts {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let request = GateRunRequest {
                objective: objective.clone(),
                file_changes: state.file_changes.clone(),
                config: self.config.gates.clone(),
            };
            let result = self
                .collab
                .gate_runner
                .run_usability_gates(request, cancel)
                .await
                .map_err(OrchestratorError::Other)?;
            if let Some(usage) = result.usage {
                state.usage.add(&usage);
            }
            let check = result.check;
            self.emit(
                &session_id,
                OrchestratorEvent::GateChecked {
                    attempt,
                    all_passed: check.all_passed,
                    failures: check.failures.len(),
                },
            );

            if check.all_passed {
                state.gate_status.insert(
                    "usabilityGates".to_string(),
                    json!({"status": "pass", "attempt": attempt}),
                );
                return Ok(());
            }

            if attempt == cfg.max_gate_attempts {
                state.gate_status.insert(
                    "usabilityGates".to_string(),
                    json!({
                        "status": "fail",
                        "attempt": attempt,
                        "failures": check.summary(),
                    }),
                );
                return Ok(());
            }

            let summary = check.summary();
            match select_fix_strategy(&check.failures) {
                FixStrategy::DebugTestFailures => {
                    let prompt = format!("Analyze test failures and fix:\n{summary}");
                    self.call_agent(state, stuck, "debugging-agent", prompt, cancel)
                        .await?;
                }
                FixStrategy::FixBuildErrors => {
                    let prompt = format!("Fix build errors:\n{summary}");
                    self.call_agent(state, stuck, "coding-agent", prompt, cancel)
                        .await?;
                }
                FixStrategy::LintAutoFix => {
                    if let Some(command) = &self.config.gates.lint_autofix_command {
                        self.run_shell(command).await;
                    }
                    let prompt = format!("Fix remaining lint failures:\n{summary}");
                    self.call_agent(state, stuck, "coding-agent", prompt, cancel)
                        .await?;
                }
                FixStrategy::Generic => {
                    let prompt = format!("Fix gate failures:\n{summary}");
                    self.call_agent(state, stuck, "coding-agent", prompt, cancel)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn run_vcs_merge(
        &self,
        state: &mut RunState,
        lifecycle: &mut BranchLifecycle,
        stuck: &Arc<Mutex<StuckTracker>>,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let session_id = state.session_id.clone();
        let branch = lifecycle.state().branch.clone().unwrap_or_default();
        let base = lifecycle.state().base_branch.clone().unwrap_or_default();

        let start = lifecycle
            .start_merge()
            .map_err(|err| OrchestratorError::Vcs(format!("{err:#}")))?;
        match start {
            MergeStart::Inactive => Ok(()),
            MergeStart::Merged => {
                state.gate_status.insert(
                    "gitMerge".to_string(),
                    json!({"status": "pass", "conflictsResolved": false}),
                );
                self.emit(
                    &session_id,
                    OrchestratorEvent::GitMerged {
                        branch,
                        into: base,
                        conflicts_resolved: false,
                    },
                );
                Ok(())
            }
            MergeStart::Conflict(files) => {
                self.emit(
                    &session_id,
                    OrchestratorEvent::GitConflictResolution {
                        files: files.clone(),
                    },
                );
                let prompt = format!(
                    "A merge of '{branch}' into '{base}' stopped on conflicts. Resolve them \
                     file by file: open each file, remove the conflict markers, keep both \
                     sides' intent, then stop. Do not commit.\nConflicted files:\n{}",
                    files
                        .iter()
                        .map(|f| format!("- {f}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                );
                self.call_agent(state, stuck, "coding-agent", prompt, cancel)
                    .await?;

                let resolved = lifecycle
                    .complete_conflict_resolution()
                    .map_err(|err| OrchestratorError::Vcs(format!("{err:#}")))?;
                if resolved {
                    state.gate_status.insert(
                        "gitMerge".to_string(),
                        json!({"status": "pass", "conflictsResolved": true}),
                    );
                    self.emit(
                        &session_id,
                        OrchestratorEvent::GitMerged {
                            branch,
                            into: base,
                            conflicts_resolved: true,
                        },
                    );
                } else {
                    lifecycle
                        .abort_merge()
                        .map_err(|err| OrchestratorError::Vcs(format!("{err:#}")))?;
                    state.gate_status.insert(
                        "gitMerge".to_string(),
                        json!({"status": "warn", "reason": "merge aborted after failed resolution"}),
                    );
                }
                Ok(())
            }
        }
    }

    // =====================================================================
    // Shared helpers
    // =====================================================================

    /// One phase-level agent call: a short tool loop with stuck tracking,
    /// fatal-auth surfacing and a single compress-and-retry on context
    /// overflow.
    async fn call_agent(
        &self,
        state: &mut RunState,
        stuck: &Arc<Mutex<StuckTracker>>,
        agent_name: &str,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let spec = self.agents.expect(agent_name);
        let mut messages = vec![Message::user(prompt)];
        let mut overflow_retried = false;
        let mut last_text = String::new();

        for _round in 0..self.config.orchestrator.max_tool_rounds.max(1) {
            if cancel.is_cancelled() {
                return Ok(last_text);
            }
            let request = LlmRequest {
                agent: spec.name.to_string(),
                system: SystemPrompt::Text(spec.system_prompt.clone()),
                messages: messages.clone(),
                tools: spec.allowed_tools.clone(),
                model: state.model.clone(),
                timeout_ms: PHASE_AGENT_TIMEOUT_MS,
            };

            let response = match self.collab.llm.request(request, cancel).await {
                Ok(response) => response,
                Err(err) if err.is_fatal() => {
                    return Err(OrchestratorError::AuthFailed(err.message));
                }
                Err(err) if err.is_context_overflow() && !overflow_retried => {
                    overflow_retried = true;
                    let original = messages
                        .first()
                        .map(|m| m.content.clone())
                        .unwrap_or_default();
                    let compressed = self.compress_text(state, &original, cancel).await?;
                    messages = vec![Message::user(compressed)];
                    continue;
                }
                Err(err) => {
                    return Err(OrchestratorError::Other(anyhow!(
                        "{agent_name} request failed: {err}"
                    )));
                }
            };

            state.usage.add(&response.usage);
            if contains_completion_marker(&response.text) {
                state.completion_marker_seen = true;
            }

            if response.tool_calls.is_empty() {
                return Ok(response.text);
            }
            last_text = response.text.clone();

            let tracked: Vec<ToolCall> = response
                .tool_calls
                .iter()
                .map(|c| ToolCall::new(&c.name, c.args.clone()))
                .collect();
            let report = stuck.lock().await.track(&tracked);
            if report.is_stuck {
                if let Some(reason) = report.reason {
                    self.emit(&state.session_id, OrchestratorEvent::stuck_alert(reason));
                }
            }

            messages.push(Message::assistant(response.text));
            let ctx = ToolInvocationCtx {
                session_id: state.session_id.clone(),
                task_id: agent_name.to_string(),
                stage_id: "phase".to_string(),
                working_dir: self.config.project_dir.clone(),
            };
            let mut tool_report = String::new();
            for call in &response.tool_calls {
                match self
                    .collab
                    .tools
                    .invoke(&call.name, &call.args, &ctx, cancel)
                    .await
                {
                    Ok(outcome) => {
                        merge_file_changes(
                            &mut state.file_changes,
                            outcome.file_changes,
                            self.config.orchestrator.file_change_cap,
                        );
                        tool_report.push_str(&format!(
                            "[{}] {}\n",
                            call.name,
                            crate::util::truncate_str(&outcome.output, 2000)
                        ));
                    }
                    Err(err) => {
                        tool_report.push_str(&format!("[{}] failed: {err:#}\n", call.name));
                    }
                }
            }
            messages.push(Message::user(tool_report));
        }

        Ok(last_text)
    }

    /// Compress arbitrary text through the compression agent. Used both
    /// for pressure control and context-overflow recovery.
    async fn compress_text(
        &self,
        state: &mut RunState,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let spec = self.agents.expect("compression-agent");
        let request = LlmRequest {
            agent: spec.name.to_string(),
            system: SystemPrompt::Text(spec.system_prompt.clone()),
            messages: vec![Message::user(compression_prompt(text))],
            tools: Vec::new(),
            model: state.model.clone(),
            timeout_ms: PHASE_AGENT_TIMEOUT_MS,
        };
        let response = self
            .collab
            .llm
            .request(request, cancel)
            .await
            .map_err(|err| {
                if err.is_fatal() {
                    OrchestratorError::AuthFailed(err.message.clone())
                } else {
                    OrchestratorError::Other(anyhow!("compression failed: {err}"))
                }
            })?;
        state.usage.add(&response.usage);
        if response.text.trim().is_empty() {
            return Ok(text.to_string());
        }
        Ok(response.text)
    }

    /// When prior context outgrows the pressure limit, replace it with a
    /// compressed rendition.
    async fn relieve_context_pressure(&self, state: &mut RunState, cancel: &CancellationToken) {
        let limit = self.config.orchestrator.pressure_limit;
        if state.prior_context.len() <= limit {
            return;
        }
        let before_len = state.prior_context.len();
        let original = state.prior_context.clone();
        match self.compress_text(state, &original, cancel).await {
            Ok(compressed) => {
                state.prior_context = compressed;
                self.emit(
                    &state.session_id,
                    OrchestratorEvent::HybridContextCompressed {
                        before_len,
                        after_len: state.prior_context.len(),
                    },
                );
            }
            Err(err) => tracing::warn!("context compression failed: {err}"),
        }
    }

    /// Apply the next degradation strategy to run state.
    fn apply_degradation(
        &self,
        state: &mut RunState,
        chain: &mut DegradationChain,
    ) -> Option<DegradationStrategy> {
        let strategy = chain.apply_next(&state.model)?;
        match strategy {
            DegradationStrategy::SwitchModel => {
                if let Some(fallback) = chain.fallback_model() {
                    state.model = fallback.to_string();
                }
            }
            DegradationStrategy::ReduceScope => {
                let skipped = state.skip_non_completed_tasks();
                tracing::info!("reduce_scope skipped {skipped} task(s)");
            }
            DegradationStrategy::SerialMode => state.max_parallel = 1,
            DegradationStrategy::GracefulStop => state.should_stop = true,
        }
        self.emit(
            &state.session_id,
            OrchestratorEvent::DegradationApplied { strategy },
        );
        Some(strategy)
    }

    async fn run_shell(&self, command: &str) {
        let result = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.config.project_dir)
            .output()
            .await;
        match result {
            Ok(output) if !output.status.success() => {
                tracing::warn!(
                    "auto-fix command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("auto-fix command failed to spawn: {err}"),
        }
    }

    fn save_checkpoint(&self, state: &RunState, phase: HybridPhase) {
        let Some(plan) = &state.plan else {
            return;
        };
        let checkpoint = Checkpoint {
            session_id: state.session_id.clone(),
            saved_at: chrono::Utc::now(),
            iteration: state.iteration,
            phase: phase.code().to_string(),
            stage_index: state.stage_index,
            stage_plan: plan.clone(),
            task_progress: state.task_progress.clone(),
            prior_context: state.prior_context.clone(),
            last_progress: state.last_progress,
        };
        if let Err(err) = self.store.save_checkpoint(&checkpoint) {
            tracing::warn!("checkpoint write failed: {err}");
        }
    }

    fn fail_run(
        &self,
        state: &mut RunState,
        phase: HybridPhase,
        started: Instant,
        lifecycle: &mut BranchLifecycle,
        err: OrchestratorError,
    ) -> Result<RunResult> {
        tracing::error!("run failed in {}: {err}", phase.code());
        self.emit(
            &state.session_id,
            OrchestratorEvent::Alert {
                kind: "run_error".to_string(),
                detail: err.to_string(),
            },
        );
        let status = match &err {
            OrchestratorError::Blocked(_) => RunStatus::Blocked,
            OrchestratorError::Cancelled => RunStatus::Stopped,
            OrchestratorError::BudgetExhausted { .. } => RunStatus::BudgetExceeded,
            OrchestratorError::StageUnrecoverable { .. } => RunStatus::Aborted,
            _ => RunStatus::Error,
        };
        Ok(self.finalize(state, phase, Some(status), started, Some(lifecycle)))
    }

    fn finalize(
        &self,
        state: &mut RunState,
        phase: HybridPhase,
        status_override: Option<RunStatus>,
        started: Instant,
        lifecycle: Option<&mut BranchLifecycle>,
    ) -> RunResult {
        let status = status_override.unwrap_or(if state.completion_marker_seen {
            RunStatus::Completed
        } else {
            RunStatus::Done
        });

        let branch_state = match lifecycle {
            Some(lifecycle) => {
                // The stash is restored on every exit path.
                lifecycle.restore_stash();
                lifecycle.state().clone()
            }
            None => Default::default(),
        };

        if state.plan.is_some() {
            self.save_checkpoint(state, phase);
        }

        let stage_count = state.plan.as_ref().map(|p| p.stages.len()).unwrap_or(0);
        let recovery_suggestions = if status == RunStatus::Completed {
            None
        } else {
            Some(RecoverySuggestions::build(
                &state.session_id,
                phase.code(),
                &state.task_progress,
                &state.gate_status,
            ))
        };

        RunResult {
            session_id: state.session_id.clone(),
            status,
            phase: phase.code().to_string(),
            stage_index: state.stage_index,
            stage_count,
            task_progress: state.task_progress.clone(),
            file_changes: state.file_changes.clone(),
            gate_status: state.gate_status.clone(),
            usage: state.usage,
            progress: state.last_progress,
            recovery_count: state.recovery_count,
            coding_rollbacks: state.coding_rollback_count,
            branch_state,
            elapsed_secs: started.elapsed().as_secs(),
            recovery_suggestions,
        }
    }
}
