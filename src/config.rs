//! Runtime configuration for the orchestrator.
//!
//! Configuration is layered: built-in defaults, then the project's
//! `crucible.toml`, then CLI overrides. The merged result is captured in
//! an immutable `OrchestratorConfig` at construction time; the only
//! run-time mutations happen in run state through the degradation chain
//! (model switch, serial mode, stop flag), never here.

use crate::gates::GatesConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Default model when none is configured.
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_stage_recoveries() -> u32 {
    3
}

fn default_max_debug_iterations() -> u32 {
    5
}

fn default_max_coding_rollbacks() -> u32 {
    2
}

fn default_max_gate_attempts() -> u32 {
    3
}

fn default_pressure_limit() -> usize {
    24_000
}

fn default_max_tool_rounds() -> u32 {
    8
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_file_change_cap() -> usize {
    200
}

fn default_bus_max_messages() -> usize {
    500
}

fn default_stuck_history() -> usize {
    10
}

fn default_semantic_threshold() -> u32 {
    3
}

fn default_checkpoint_max_keep() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Merged orchestrator configuration. Immutable once constructed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Primary model for all sub-agents.
    pub model: String,
    /// Fallback model for the `switch_model` degradation strategy.
    pub fallback_model: Option<String>,
    /// Maximum tasks running in parallel inside a stage.
    pub max_parallel: usize,
    /// Stage recovery attempts before degradation kicks in.
    pub max_stage_recoveries: u32,
    /// Debugging-loop iterations.
    pub max_debug_iterations: u32,
    /// Debugging → coding rollbacks tolerated.
    pub max_coding_rollbacks: u32,
    /// Gate fix-and-retry attempts.
    pub max_gate_attempts: u32,
    /// Intake clarification rounds; zero disables the intake phase.
    pub max_intake_rounds: u32,
    /// Aggregate input+output token budget; None means unmetered.
    pub token_budget: Option<u64>,
    /// Prior-context length (chars) above which compression runs.
    pub pressure_limit: usize,
    /// Wall-clock cap for the whole coding loop.
    pub coding_phase_timeout_ms: Option<u64>,
    /// Wall-clock cap for the debugging loop.
    pub debugging_phase_timeout_ms: Option<u64>,
    /// Tool-call rounds allowed per task attempt.
    pub max_tool_rounds: u32,
    /// Recovery backoff base and cap.
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Most-recent file-change entries retained.
    pub file_change_cap: usize,
    /// Task-bus message capacity.
    pub bus_max_messages: usize,
    /// Stuck-tracker history window.
    pub stuck_history: usize,
    /// Semantic-error consecutive-similar threshold.
    pub semantic_threshold: u32,
    /// Create a session branch and merge it back at the end.
    pub vcs_enabled: bool,
    /// Run the incremental lint/typecheck gate after each stage.
    pub incremental_gate: bool,
    /// Run the cross-review audit after the coding loop.
    pub cross_review: bool,
    /// Run the completion validator before gates (when one is wired).
    pub completion_validation: bool,
    /// Let `reduce_scope` skip non-completed tasks.
    pub skip_non_critical: bool,
    /// Numbered checkpoints retained by cleanup.
    pub checkpoint_max_keep: usize,
    /// Keep per-stage and per-task checkpoint files on cleanup.
    pub keep_stage_checkpoints: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallback_model: None,
            max_parallel: default_max_parallel(),
            max_stage_recoveries: default_max_stage_recoveries(),
            max_debug_iterations: default_max_debug_iterations(),
            max_coding_rollbacks: default_max_coding_rollbacks(),
            max_gate_attempts: default_max_gate_attempts(),
            max_intake_rounds: 0,
            token_budget: None,
            pressure_limit: default_pressure_limit(),
            coding_phase_timeout_ms: None,
            debugging_phase_timeout_ms: None,
            max_tool_rounds: default_max_tool_rounds(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            file_change_cap: default_file_change_cap(),
            bus_max_messages: default_bus_max_messages(),
            stuck_history: default_stuck_history(),
            semantic_threshold: default_semantic_threshold(),
            vcs_enabled: false,
            incremental_gate: false,
            cross_review: false,
            completion_validation: default_true(),
            skip_non_critical: false,
            checkpoint_max_keep: default_checkpoint_max_keep(),
            keep_stage_checkpoints: default_true(),
        }
    }
}

/// On-disk `crucible.toml` layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct CrucibleToml {
    orchestrator: OrchestratorConfig,
    gates: GatesConfig,
}

/// Fully merged run configuration: orchestrator knobs plus gate toggles
/// and the directories the run operates in.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub gates: GatesConfig,
}

impl RunConfig {
    /// Load configuration for a project directory: defaults layered with
    /// `crucible.toml` when present.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self> {
        let project_dir: PathBuf = project_dir.into();
        let toml_path = project_dir.join("crucible.toml");

        let file_config = if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("Failed to read {}", toml_path.display()))?;
            toml::from_str::<CrucibleToml>(&content)
                .with_context(|| format!("Failed to parse {}", toml_path.display()))?
        } else {
            CrucibleToml::default()
        };

        Ok(Self {
            project_dir,
            orchestrator: file_config.orchestrator,
            gates: file_config.gates,
        })
    }

    /// Configuration with pure defaults, for tests and embedded use.
    pub fn defaults(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            orchestrator: OrchestratorConfig::default(),
            gates: GatesConfig::default(),
        }
    }

    /// Override the model.
    pub fn with_model(mut self, model: &str) -> Self {
        self.orchestrator.model = model.to_string();
        self
    }

    /// Override the token budget.
    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.orchestrator.token_budget = Some(budget);
        self
    }

    /// Enable or disable the session-branch lifecycle.
    pub fn with_vcs(mut self, enabled: bool) -> Self {
        self.orchestrator.vcs_enabled = enabled;
        self
    }

    /// Checkpoint directory for this project.
    pub fn checkpoint_root(&self) -> PathBuf {
        self.project_dir.join(".crucible").join("checkpoints")
    }
}
