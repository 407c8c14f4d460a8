//! Completion-validation contract (syntax/build/test sweep before gates).

use crate::plan::FileChange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Verdict from the completion validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationVerdict {
    Pass,
    Block,
}

/// Validator report; on `Block` the orchestrator runs one coding pass with
/// the report as input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub verdict: ValidationVerdict,
    pub report: String,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            verdict: ValidationVerdict::Pass,
            report: String::new(),
        }
    }

    pub fn block(report: impl Into<String>) -> Self {
        Self {
            verdict: ValidationVerdict::Block,
            report: report.into(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == ValidationVerdict::Block
    }
}

/// Host-provided completion validator.
#[async_trait]
pub trait CompletionValidator: Send + Sync {
    async fn validate(
        &self,
        objective: &str,
        file_changes: &[FileChange],
        cancel: &CancellationToken,
    ) -> anyhow::Result<ValidationReport>;
}
