//! Tool-executor contract.

use crate::plan::FileChange;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Context threaded into every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocationCtx {
    pub session_id: String,
    pub task_id: String,
    pub stage_id: String,
    pub working_dir: PathBuf,
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub ok: bool,
    pub output: String,
    /// File deltas produced by writing tools.
    pub file_changes: Vec<FileChange>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            file_changes: Vec::new(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
            file_changes: Vec::new(),
        }
    }
}

/// Host-provided tool runtime. The scheduler records every invocation's
/// name and arguments into the stuck tracker before dispatching here.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolInvocationCtx,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ToolOutcome>;
}
