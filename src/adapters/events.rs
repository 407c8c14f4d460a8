//! Observable events emitted by the orchestrator.
//!
//! Events are advisory: the sink must never propagate a failure back into
//! the orchestrator, so `emit` is infallible by contract and
//! implementations swallow their own errors.

use crate::failure::{DegradationStrategy, StuckReason};
use serde::Serialize;
use serde_json::Value;

/// Event payloads, tagged with the wire-level type names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorEvent {
    PhaseChanged {
        from: String,
        to: String,
    },
    PlanFrozen {
        plan_id: String,
        stage_count: usize,
        task_count: usize,
        quality_score: u8,
    },
    HybridPreviewStart,
    HybridPreviewComplete {
        findings_len: usize,
    },
    HybridBlueprintStart,
    HybridBlueprintComplete,
    HybridBlueprintValidated {
        errors: usize,
        warnings: usize,
        quality_score: u8,
    },
    HybridBlueprintReview {
        failed_tasks: Vec<String>,
    },
    GitBranchCreated {
        branch: String,
        base: String,
    },
    GitMerged {
        branch: String,
        into: String,
        conflicts_resolved: bool,
    },
    GitConflictResolution {
        files: Vec<String>,
    },
    ScaffoldComplete {
        files: usize,
    },
    HybridDebuggingStart {
        iteration: u32,
    },
    HybridDebuggingComplete {
        iterations: u32,
    },
    HybridReturnToCoding {
        rollback: u32,
        failed_tasks: Vec<String>,
    },
    HybridIncrementalGate {
        stage_id: String,
        passed: bool,
    },
    HybridBudgetWarning {
        used: u64,
        budget: u64,
        forecast: bool,
    },
    HybridContextCompressed {
        before_len: usize,
        after_len: usize,
    },
    HybridCheckpointResumed {
        stage_index: usize,
        iteration: u64,
    },
    HybridCheckpointInvalid,
    HybridMemoryLoaded {
        entries: usize,
    },
    HybridMemorySaved {
        entries: usize,
    },
    Alert {
        kind: String,
        detail: String,
    },
    SemanticErrorRepeated {
        message: String,
    },
    PhaseTimeout {
        phase: String,
        timeout_ms: u64,
    },
    DegradationApplied {
        strategy: DegradationStrategy,
    },
    CheckpointCleaned {
        deleted: usize,
    },
    GateChecked {
        attempt: u32,
        all_passed: bool,
        failures: usize,
    },
}

impl OrchestratorEvent {
    /// Alert for a stuck sub-agent.
    pub fn stuck_alert(reason: StuckReason) -> Self {
        Self::Alert {
            kind: "stuck".to_string(),
            detail: format!("{reason:?}"),
        }
    }

    /// Serialize to the wire payload; events are advisory, so failures
    /// collapse to null.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Host-provided event sink. Must not propagate failures to the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, session_id: &str, event: OrchestratorEvent);
}
