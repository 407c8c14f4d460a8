//! End-to-end scenarios driving the full orchestrator with scripted
//! collaborators.

use crucible::adapters::llm::{LlmAdapter, TokenUsage};
use crucible::adapters::mock::{
    MockVcs, NullSessionStore, RecordingEventSink, RecordingToolExecutor, ScriptedGateRunner,
    ScriptedLlm, ScriptedValidator,
};
use crucible::adapters::validator::ValidationReport;
use crucible::config::RunConfig;
use crucible::gates::{GateCheck, GateFailure, GateKind};
use crucible::orchestrator::{Collaborators, HybridOrchestrator, RunStatus};
use crucible::plan::TaskStatus;
use crucible::vcs::{MergeOutcome, Vcs};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    llm: Arc<ScriptedLlm>,
    gates: Arc<ScriptedGateRunner>,
    events: Arc<RecordingEventSink>,
    vcs: Arc<MockVcs>,
    orchestrator: HybridOrchestrator,
    _dir: TempDir,
}

fn harness(tune: impl FnOnce(&mut RunConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::defaults(dir.path());
    // Deterministic scripting: one task at a time, no real backoff waits.
    config.orchestrator.max_parallel = 1;
    config.orchestrator.backoff_base_ms = 1;
    config.orchestrator.backoff_cap_ms = 5;
    tune(&mut config);

    let llm = Arc::new(ScriptedLlm::new());
    let gates = Arc::new(ScriptedGateRunner::default());
    let events = Arc::new(RecordingEventSink::default());
    let vcs = Arc::new(MockVcs::default());

    let collaborators = Collaborators {
        llm: Arc::clone(&llm) as Arc<dyn LlmAdapter>,
        tools: Arc::new(RecordingToolExecutor::default()),
        sessions: Arc::new(NullSessionStore::default()),
        events: Arc::clone(&events) as Arc<dyn crucible::adapters::events::EventSink>,
        gate_runner: Arc::clone(&gates) as Arc<dyn crucible::adapters::gates::GateRunner>,
        validator: None,
        vcs: Arc::clone(&vcs) as Arc<dyn Vcs>,
    };

    Harness {
        orchestrator: HybridOrchestrator::new(config, collaborators),
        llm,
        gates,
        events,
        vcs,
        _dir: dir,
    }
}

fn single_stage_blueprint() -> String {
    r#"Architecture: one module.
```stage-plan
{
  "stages": [
    {
      "stage_id": "s1",
      "name": "Implement",
      "tasks": [
        {
          "task_id": "t1",
          "prompt": "Implement src/add.mjs exporting add(a, b)",
          "planned_files": ["src/add.mjs"],
          "acceptance": ["node --check src/add.mjs"]
        }
      ]
    }
  ]
}
```"#
        .to_string()
}

// =============================================================================
// Scenario 1: single-stage happy path
// =============================================================================

#[tokio::test]
async fn single_stage_happy_path() {
    let h = harness(|_| {});
    h.llm.push_reply("preview-agent", "small module, no conventions to worry about");
    h.llm.push_reply("blueprint-agent", single_stage_blueprint());
    h.llm.push_reply("scaffold-agent", "stub written");
    h.llm.push_reply("coding-agent", "implemented add()");
    h.llm
        .push_reply("debugging-agent", "[TASK_COMPLETE]\n[STAGE 1/1: Implement - COMPLETE]");

    let result = h
        .orchestrator
        .run(
            "Implement src/add.mjs exporting add(a, b)",
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.stage_index, 1);
    assert_eq!(result.stage_count, 1);
    assert_eq!(result.task_progress["t1"].status, TaskStatus::Completed);
    assert!(result.recovery_suggestions.is_none());

    let types = h.events.event_types();
    assert!(types.contains(&"PLAN_FROZEN".to_string()));
    assert!(types.contains(&"GATE_CHECKED".to_string()));

    // Checkpoint on disk reflects the finished coding loop.
    let checkpoint = h
        .orchestrator
        .checkpoint_store()
        .load_latest(&result.session_id)
        .unwrap();
    assert_eq!(checkpoint.stage_index, 1);
}

// =============================================================================
// Scenario 2: parallel stage with one transient retry
// =============================================================================

#[tokio::test]
async fn transient_failure_retries_within_stage() {
    let h = harness(|_| {});
    h.llm.push_reply("preview-agent", "ready");
    h.llm.push_reply(
        "blueprint-agent",
        r#"```stage-plan
{"stages": [{"stage_id": "s1", "name": "Build", "tasks": [
  {"task_id": "t1", "prompt": "first piece", "planned_files": ["src/a.rs"],
   "acceptance": ["cargo check"], "max_retries": 2},
  {"task_id": "t2", "prompt": "second piece", "planned_files": ["src/b.rs"],
   "acceptance": ["cargo check"], "max_retries": 2}
]}]}
```"#,
    );
    h.llm.push_reply("scaffold-agent", "stubs written");
    // max_parallel = 1 runs t1 then t2; t2 fails once, then recovers.
    h.llm.push_reply("coding-agent", "t1 finished");
    h.llm.push_reply("coding-agent", "ECONNRESET while pulling the schema");
    h.llm.push_reply("coding-agent", "t2 finished after reconnect");
    h.llm.push_reply("debugging-agent", "[STAGE 1/1: Build - COMPLETE]");

    let result = h
        .orchestrator
        .run("wire both pieces together", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Done);
    assert_eq!(result.recovery_count, 0);
    assert_eq!(result.task_progress["t1"].attempt, 1);
    assert_eq!(result.task_progress["t2"].attempt, 2);
    assert_eq!(result.task_progress["t2"].status, TaskStatus::Completed);
}

// =============================================================================
// Scenario 3: debugging rollback re-enters coding
// =============================================================================

#[tokio::test]
async fn debugging_rollback_preserves_completed_work() {
    let h = harness(|_| {});
    h.llm.push_reply("preview-agent", "ready");
    h.llm.push_reply(
        "blueprint-agent",
        r#"```stage-plan
{"stages": [
  {"stage_id": "s1", "name": "Core", "tasks": [
    {"task_id": "s1_t1", "prompt": "core piece", "planned_files": ["src/core.rs"],
     "acceptance": ["cargo check"]}]},
  {"stage_id": "s2", "name": "API", "tasks": [
    {"task_id": "stage2_task_3", "prompt": "api piece", "planned_files": ["src/api.rs"],
     "acceptance": ["cargo check"]}]}
]}
```"#,
    );
    h.llm.push_reply("scaffold-agent", "stubs written");
    h.llm.push_reply("coding-agent", "core finished");
    h.llm.push_reply("coding-agent", "api finished");
    h.llm.push_reply(
        "debugging-agent",
        "api layer looks wrong\n[RETURN TO STAGE 2]\n[FAILED_TASK: stage2_task_3]",
    );
    h.llm
        .push_reply("debugging-agent", "[STAGE 2/2: API - COMPLETE]");

    let result = h
        .orchestrator
        .run("core plus api", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.coding_rollbacks, 1);
    // Completed work is never demoted by a rollback.
    assert_eq!(result.task_progress["s1_t1"].status, TaskStatus::Completed);
    assert_eq!(
        result.task_progress["stage2_task_3"].status,
        TaskStatus::Completed
    );

    let rollback = h.events.find("HYBRID_RETURN_TO_CODING").unwrap();
    assert_eq!(rollback["rollback"], 1);
    assert_eq!(rollback["failed_tasks"][0], "stage2_task_3");
}

// =============================================================================
// Scenario 4: gate fix loop
// =============================================================================

#[tokio::test]
async fn gate_failure_fixed_on_second_attempt() {
    let h = harness(|_| {});
    h.gates.push_check(GateCheck::failed(vec![GateFailure {
        gate: GateKind::Test,
        reason: "2 failing".into(),
        output: None,
    }]));
    // Second pass (queue empty) defaults to all-pass.

    h.llm.push_reply("preview-agent", "ready");
    h.llm.push_reply("blueprint-agent", single_stage_blueprint());
    h.llm.push_reply("scaffold-agent", "stub written");
    h.llm.push_reply("coding-agent", "implemented");
    h.llm
        .push_reply("debugging-agent", "[STAGE 1/1: Implement - COMPLETE]");
    h.llm.push_reply("debugging-agent", "fixed the two failing tests");

    let result = h
        .orchestrator
        .run("make the tests pass", &CancellationToken::new())
        .await
        .unwrap();

    let gate_status = &result.gate_status["usabilityGates"];
    assert_eq!(gate_status["status"], "pass");
    assert_eq!(gate_status["attempt"], 2);

    // The test-gate failure selected the debugging-agent fix strategy.
    let debugging_requests = h.llm.requests_for("debugging-agent");
    assert!(
        debugging_requests
            .iter()
            .any(|r| r.messages[0].content.contains("Analyze test failures and fix"))
    );
}

// =============================================================================
// Scenario 5: merge conflict self-heal
// =============================================================================

#[tokio::test]
async fn merge_conflict_resolved_by_coding_agent() {
    let h = harness(|config| {
        config.orchestrator.vcs_enabled = true;
    });
    h.vcs.push_merge_outcome(MergeOutcome::Conflict(vec![
        "src/a.mjs".to_string(),
        "src/b.mjs".to_string(),
    ]));

    h.llm.push_reply("preview-agent", "ready");
    h.llm.push_reply("blueprint-agent", single_stage_blueprint());
    h.llm.push_reply("scaffold-agent", "stub written");
    h.llm.push_reply("coding-agent", "implemented");
    h.llm
        .push_reply("debugging-agent", "[STAGE 1/1: Implement - COMPLETE]");
    h.llm
        .push_reply("coding-agent", "conflicts resolved in both files");

    let result = h
        .orchestrator
        .run("implement and merge", &CancellationToken::new())
        .await
        .unwrap();

    let merge_status = &result.gate_status["gitMerge"];
    assert_eq!(merge_status["status"], "pass");
    assert_eq!(merge_status["conflictsResolved"], true);

    let conflict = h.events.find("GIT_CONFLICT_RESOLUTION").unwrap();
    assert_eq!(conflict["files"][0], "src/a.mjs");
    let merged = h.events.find("GIT_MERGED").unwrap();
    assert_eq!(merged["conflicts_resolved"], true);

    // Branch lifecycle ran: create, checkout, merge, delete.
    let ops = h.vcs.operations();
    assert!(ops.iter().any(|op| op.starts_with("create_branch:crucible/")));
    assert!(ops.iter().any(|op| op == "merge_abort" || op.starts_with("delete_branch:")));
}

// =============================================================================
// Scenario 6: budget forecast warning
// =============================================================================

#[tokio::test]
async fn budget_forecast_fires_while_under_warn_threshold() {
    // 150k tokens per call: preview + blueprint + scaffold + one coding
    // call put stage 1's boundary at exactly 600k of the 2000k budget.
    let llm = Arc::new(ScriptedLlm::new().with_usage_per_call(TokenUsage {
        input: 100_000,
        output: 50_000,
        cache_read: 0,
        cache_write: 0,
    }));
    let stages: Vec<String> = (1..=4)
        .map(|i| {
            format!(
                r#"{{"stage_id": "s{i}", "name": "Stage {i}", "tasks": [
                    {{"task_id": "s{i}_t1", "prompt": "piece {i}",
                      "planned_files": ["src/p{i}.rs"], "acceptance": ["cargo check"]}}]}}"#
            )
        })
        .collect();
    llm.push_reply("preview-agent", "ready");
    llm.push_reply(
        "blueprint-agent",
        format!("```stage-plan\n{{\"stages\": [{}]}}\n```", stages.join(",")),
    );
    llm.push_reply("scaffold-agent", "stubs written");
    for i in 1..=4 {
        llm.push_reply("coding-agent", format!("piece {i} finished"));
    }
    llm.push_reply("debugging-agent", "[STAGE 4/4: Stage 4 - COMPLETE]");

    let events = Arc::new(RecordingEventSink::default());
    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::defaults(dir.path());
    config.orchestrator.max_parallel = 1;
    config.orchestrator.token_budget = Some(2_000_000);
    let orchestrator = HybridOrchestrator::new(
        config,
        Collaborators {
            llm: Arc::clone(&llm) as Arc<dyn LlmAdapter>,
            tools: Arc::new(RecordingToolExecutor::default()),
            sessions: Arc::new(NullSessionStore::default()),
            events: Arc::clone(&events) as Arc<dyn crucible::adapters::events::EventSink>,
            gate_runner: Arc::new(ScriptedGateRunner::default()),
            validator: None,
            vcs: Arc::new(MockVcs::default()),
        },
    );

    let result = orchestrator
        .run("four stage build-out", &CancellationToken::new())
        .await
        .unwrap();

    assert_ne!(result.status, RunStatus::BudgetExceeded);
    let warning = events.find("HYBRID_BUDGET_WARNING").unwrap();
    assert_eq!(warning["forecast"], true);
    assert_eq!(warning["used"], 2_400_000);
}

// =============================================================================
// Completion validation (H5.5)
// =============================================================================

#[tokio::test]
async fn blocked_completion_validation_triggers_one_coding_pass() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push_reply("preview-agent", "ready");
    llm.push_reply("blueprint-agent", single_stage_blueprint());
    llm.push_reply("scaffold-agent", "stub written");
    llm.push_reply("coding-agent", "implemented");
    llm.push_reply("debugging-agent", "[STAGE 1/1: Implement - COMPLETE]");
    llm.push_reply("coding-agent", "fixed the syntax error the validator found");

    let validator = Arc::new(ScriptedValidator::default());
    validator.push_report(ValidationReport::block("src/add.mjs: unexpected token"));

    let dir = TempDir::new().unwrap();
    let mut config = RunConfig::defaults(dir.path());
    config.orchestrator.max_parallel = 1;
    let orchestrator = HybridOrchestrator::new(
        config,
        Collaborators {
            llm: Arc::clone(&llm) as Arc<dyn LlmAdapter>,
            tools: Arc::new(RecordingToolExecutor::default()),
            sessions: Arc::new(NullSessionStore::default()),
            events: Arc::new(RecordingEventSink::default()),
            gate_runner: Arc::new(ScriptedGateRunner::default()),
            validator: Some(
                validator as Arc<dyn crucible::adapters::validator::CompletionValidator>,
            ),
            vcs: Arc::new(MockVcs::default()),
        },
    );

    orchestrator
        .run("implement the adder", &CancellationToken::new())
        .await
        .unwrap();

    let coding_requests = llm.requests_for("coding-agent");
    assert!(
        coding_requests
            .iter()
            .any(|r| r.messages[0].content.contains("Completion validation blocked"))
    );
}

// =============================================================================
// Cancellation, blocking and resume
// =============================================================================

#[tokio::test]
async fn pre_cancelled_run_stops_cleanly() {
    let h = harness(|_| {});
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .orchestrator
        .run("do something big", &cancel)
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Stopped);
}

#[tokio::test]
async fn empty_objective_is_blocked() {
    let h = harness(|_| {});
    let result = h
        .orchestrator
        .run("   ", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Blocked);
    assert!(result.recovery_suggestions.is_some());
}

#[tokio::test]
async fn resume_rejects_missing_checkpoint() {
    let h = harness(|_| {});
    let err = h
        .orchestrator
        .resume("no-such-session", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no valid checkpoint"));
    assert!(h.events.find("HYBRID_CHECKPOINT_INVALID").is_some());
}

#[tokio::test]
async fn completed_run_resumes_without_rerunning_stages() {
    let h = harness(|_| {});
    h.llm.push_reply("preview-agent", "ready");
    h.llm.push_reply("blueprint-agent", single_stage_blueprint());
    h.llm.push_reply("scaffold-agent", "stub written");
    h.llm.push_reply("coding-agent", "implemented");
    h.llm
        .push_reply("debugging-agent", "[STAGE 1/1: Implement - COMPLETE]");

    let first = h
        .orchestrator
        .run("implement the adder", &CancellationToken::new())
        .await
        .unwrap();
    let coding_calls_after_first = h.llm.requests_for("coding-agent").len();

    // Resume: the stage is already terminal, so no coding calls are made.
    h.llm
        .push_reply("debugging-agent", "[STAGE 1/1: Implement - COMPLETE]");
    let resumed = h
        .orchestrator
        .resume(&first.session_id, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resumed.stage_index, 1);
    assert_eq!(
        h.llm.requests_for("coding-agent").len(),
        coding_calls_after_first
    );
    assert!(h.events.find("HYBRID_CHECKPOINT_RESUMED").is_some());
}
