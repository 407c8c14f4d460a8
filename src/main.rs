use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use crucible::adapters::events::{EventSink, OrchestratorEvent};
use crucible::adapters::gates::{GateRunRequest, GateRunResult, GateRunner};
use crucible::adapters::llm::{
    LlmAdapter, LlmError, LlmErrorKind, LlmRequest, LlmResponse, Message, Role, TokenUsage,
};
use crucible::adapters::session::SessionStore;
use crucible::adapters::tools::{ToolExecutor, ToolInvocationCtx, ToolOutcome};
use crucible::checkpoint::{CheckpointStore, CleanupPolicy};
use crucible::classify::classify;
use crucible::config::RunConfig;
use crucible::gates::{GateCheck, GatePreferences};
use crucible::vcs::GitVcs;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Agent CLI spawned per request; override with `CRUCIBLE_AGENT_CMD`.
const DEFAULT_AGENT_CMD: &str = "claude";

/// Rough chars-per-token ratio for usage estimates when the spawned CLI
/// reports nothing.
const CHARS_PER_TOKEN: u64 = 4;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Hybrid long-agent orchestrator for terminal AI coding")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify a prompt without running anything
    Classify {
        /// The prompt to classify
        prompt: String,
    },
    /// Run the hybrid pipeline for an objective
    Run {
        /// The objective to execute
        objective: String,
        /// Override the model
        #[arg(long)]
        model: Option<String>,
        /// Aggregate token budget
        #[arg(long)]
        token_budget: Option<u64>,
        /// Create a session branch and merge it back
        #[arg(long)]
        branch: bool,
    },
    /// Resume a session from its latest checkpoint
    Resume {
        /// Session id to resume
        session_id: String,
    },
    /// Inspect or clean checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List checkpoint files for a session
    List { session_id: String },
    /// Delete old numbered checkpoints for a session
    Clean {
        session_id: String,
        /// Numbered checkpoints to retain
        #[arg(long, default_value = "5")]
        max_keep: usize,
    },
}

/// Model adapter that spawns an agent CLI per request, writing the prompt
/// to stdin and reading the reply from stdout. The spawned CLI runs its
/// own tools, so responses never carry tool calls.
struct ProcessLlm {
    command: String,
    working_dir: PathBuf,
}

impl ProcessLlm {
    fn new(working_dir: PathBuf) -> Self {
        Self {
            command: std::env::var("CRUCIBLE_AGENT_CMD")
                .unwrap_or_else(|_| DEFAULT_AGENT_CMD.to_string()),
            working_dir,
        }
    }

    fn render_prompt(request: &LlmRequest) -> String {
        let mut prompt = format!("## SYSTEM\n{}\n", request.system.as_text());
        for message in &request.messages {
            let label = match message.role {
                Role::User => "## INPUT",
                Role::Assistant => "## PRIOR REPLY",
            };
            prompt.push_str(&format!("\n{label}\n{}\n", message.content));
        }
        prompt
    }
}

#[async_trait]
impl LlmAdapter for ProcessLlm {
    async fn request(
        &self,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, LlmError> {
        let prompt = Self::render_prompt(&request);

        let mut child = tokio::process::Command::new(&self.command)
            .arg("--print")
            .arg("--model")
            .arg(&request.model)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                LlmError::new(
                    LlmErrorKind::Unknown,
                    format!("failed to spawn {}: {err}", self.command),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|err| LlmError::new(LlmErrorKind::Unknown, err.to_string()))?;
            stdin
                .shutdown()
                .await
                .map_err(|err| LlmError::new(LlmErrorKind::Unknown, err.to_string()))?;
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(LlmError::new(LlmErrorKind::Unknown, "cancelled"));
            }
            output = child.wait_with_output() => output.map_err(|err| {
                LlmError::new(LlmErrorKind::Unknown, err.to_string())
            })?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let kind = if stderr.contains("401") || stderr.to_lowercase().contains("auth") {
                LlmErrorKind::Auth
            } else if stderr.contains("429") {
                LlmErrorKind::RateLimit
            } else {
                LlmErrorKind::Server
            };
            return Err(LlmError::new(
                kind,
                format!("{} exited with {}: {stderr}", self.command, output.status),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        Ok(LlmResponse {
            usage: TokenUsage {
                input: prompt.len() as u64 / CHARS_PER_TOKEN,
                output: text.len() as u64 / CHARS_PER_TOKEN,
                cache_read: 0,
                cache_write: 0,
            },
            text,
            tool_calls: Vec::new(),
        })
    }
}

/// Tool executor stub for the standalone binary: the spawned agent CLI
/// executes its own tools, so the core never routes calls here.
struct ExternalTools;

#[async_trait]
impl ToolExecutor for ExternalTools {
    async fn invoke(
        &self,
        name: &str,
        _args: &Value,
        _ctx: &ToolInvocationCtx,
        _cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        Ok(ToolOutcome::failure(format!(
            "tool '{name}' is executed by the agent CLI, not the orchestrator"
        )))
    }
}

/// Session store for the standalone binary: liveness only, via logs.
struct LogSessionStore;

#[async_trait]
impl SessionStore for LogSessionStore {
    async fn touch_session(&self, session_id: &str, _meta: &Value) -> Result<()> {
        tracing::debug!(session_id, "session touched");
        Ok(())
    }

    async fn mark_session_status(&self, session_id: &str, status: &str) -> Result<()> {
        tracing::info!(session_id, status, "session status");
        Ok(())
    }

    async fn get_conversation_history(
        &self,
        _session_id: &str,
        _limit: usize,
    ) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn replace_messages(&self, _session_id: &str, _messages: &[Message]) -> Result<()> {
        Ok(())
    }
}

/// Gate runner for the standalone binary: no local gate commands are
/// configured, so every enabled gate reports pass-through.
struct PassthroughGates;

#[async_trait]
impl GateRunner for PassthroughGates {
    async fn run_usability_gates(
        &self,
        request: GateRunRequest,
        _cancel: &CancellationToken,
    ) -> Result<GateRunResult> {
        tracing::info!(
            gates = ?request.config.enabled(),
            "no gate commands configured, passing through"
        );
        Ok(GateRunResult {
            check: GateCheck::passed(),
            usage: None,
        })
    }
}

/// Event sink printing wire payloads as JSON lines.
struct StdoutEventSink;

impl EventSink for StdoutEventSink {
    fn emit(&self, session_id: &str, event: OrchestratorEvent) {
        let mut payload = event.to_payload();
        if let Some(map) = payload.as_object_mut() {
            map.insert("session_id".to_string(), session_id.into());
        }
        println!("{payload}");
    }
}

fn build_collaborators(project_dir: &PathBuf) -> crucible::orchestrator::Collaborators {
    crucible::orchestrator::Collaborators {
        llm: Arc::new(ProcessLlm::new(project_dir.clone())),
        tools: Arc::new(ExternalTools),
        sessions: Arc::new(LogSessionStore),
        events: Arc::new(StdoutEventSink),
        gate_runner: Arc::new(PassthroughGates),
        validator: None,
        vcs: Arc::new(GitVcs),
    }
}

fn project_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.project_dir {
        Some(dir) => dir
            .canonicalize()
            .context("Failed to resolve project directory"),
        None => std::env::current_dir().context("Failed to read current directory"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Classify { ref prompt } => {
            let classification = classify(prompt);
            println!("{}", serde_json::to_string_pretty(&classification)?);
            Ok(())
        }
        Commands::Run {
            ref objective,
            ref model,
            token_budget,
            branch,
        } => {
            let dir = project_dir(&cli)?;
            let mut config = RunConfig::load(&dir)?;
            if let Some(model) = model {
                config = config.with_model(model);
            }
            if let Some(budget) = token_budget {
                config = config.with_token_budget(budget);
            }
            if branch {
                config = config.with_vcs(true);
            }
            // Per-user gate preferences override the project defaults.
            if let Some(prefs_path) = GatePreferences::default_path() {
                if prefs_path.exists() {
                    GatePreferences::load(&prefs_path).apply(&mut config.gates);
                }
            }

            let classification = classify(objective);
            tracing::info!(
                mode = ?classification.mode,
                confidence = ?classification.confidence,
                reason = classification.reason,
                "objective classified"
            );

            let orchestrator = crucible::orchestrator::HybridOrchestrator::new(
                config,
                build_collaborators(&dir),
            );
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_cancel.cancel();
                }
            });

            let result = orchestrator.run(objective, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Resume { ref session_id } => {
            let dir = project_dir(&cli)?;
            let config = RunConfig::load(&dir)?;
            let orchestrator = crucible::orchestrator::HybridOrchestrator::new(
                config,
                build_collaborators(&dir),
            );
            let cancel = CancellationToken::new();
            let result = orchestrator.resume(session_id, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Checkpoints { ref command } => {
            let dir = project_dir(&cli)?;
            let store = CheckpointStore::for_project(&dir);
            match command {
                CheckpointCommands::List { session_id } => {
                    let names = store.list_checkpoints(session_id);
                    if names.is_empty() {
                        println!("no checkpoints for session {session_id}");
                    }
                    for name in names {
                        println!("{name}");
                    }
                }
                CheckpointCommands::Clean {
                    session_id,
                    max_keep,
                } => {
                    let deleted = store.cleanup_checkpoints(
                        session_id,
                        CleanupPolicy {
                            max_keep: *max_keep,
                            keep_stage_checkpoints: true,
                        },
                    );
                    println!("deleted {deleted} checkpoint file(s)");
                }
            }
            Ok(())
        }
    }
}
