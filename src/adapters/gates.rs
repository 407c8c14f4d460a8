//! Gate-runner contract.

use crate::adapters::llm::TokenUsage;
use crate::gates::{GateCheck, GatesConfig};
use crate::plan::FileChange;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Request for one full pass over the enabled gates.
#[derive(Debug, Clone)]
pub struct GateRunRequest {
    pub objective: String,
    pub file_changes: Vec<FileChange>,
    pub config: GatesConfig,
}

/// Result of one gate pass, with any model usage the runner incurred.
#[derive(Debug, Clone, Default)]
pub struct GateRunResult {
    pub check: GateCheck,
    pub usage: Option<TokenUsage>,
}

/// Host-provided gate runner (build/test/lint executors, review agents).
#[async_trait]
pub trait GateRunner: Send + Sync {
    async fn run_usability_gates(
        &self,
        request: GateRunRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<GateRunResult>;
}
