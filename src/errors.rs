//! Typed error hierarchy for the Crucible orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `OrchestratorError` — phase-machine and run-level failures
//! - `CheckpointError` — persistence failures in the checkpoint store
//!
//! Per-task failures never surface as errors: they become task progress
//! records with a classified category (see `failure::classifier`).

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the orchestrator subsystem (phase machine and run driver).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Objective is not actionable: {0}")]
    Blocked(String),

    #[error("Authentication failed against the model adapter: {0}")]
    AuthFailed(String),

    #[error("Token budget of {budget} exhausted ({used} used)")]
    BudgetExhausted { budget: u64, used: u64 },

    #[error("Run cancelled by the user")]
    Cancelled,

    #[error("Stage '{stage_id}' failed after {recoveries} recovery attempts")]
    StageUnrecoverable { stage_id: String, recoveries: u32 },

    #[error("Phase {phase} timed out after {timeout_ms}ms")]
    PhaseTimeout { phase: String, timeout_ms: u64 },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to create checkpoint directory {path}: {source}")]
    DirCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write checkpoint {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint for session {session_id}: {source}")]
    SerializeFailed {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session {session_id} is locked by another writer")]
    SessionLocked { session_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_error_budget_carries_amounts() {
        let err = OrchestratorError::BudgetExhausted {
            budget: 2_000_000,
            used: 2_100_000,
        };
        assert!(err.to_string().contains("2000000"));
        assert!(err.to_string().contains("2100000"));
    }

    #[test]
    fn stage_unrecoverable_carries_stage_and_count() {
        let err = OrchestratorError::StageUnrecoverable {
            stage_id: "s2".into(),
            recoveries: 3,
        };
        assert!(err.to_string().contains("s2"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn checkpoint_error_converts_to_orchestrator_error() {
        let inner = CheckpointError::SessionLocked {
            session_id: "s1".into(),
        };
        let err: OrchestratorError = inner.into();
        assert!(matches!(err, OrchestratorError::Checkpoint(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::Cancelled);
        assert_std_error(&CheckpointError::SessionLocked {
            session_id: "s".into(),
        });
    }
}
