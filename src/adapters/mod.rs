//! Contracts consumed from external collaborators.
//!
//! The orchestrator core never talks to a model provider, a tool runtime,
//! a session database or a terminal directly. It consumes these traits;
//! the host application wires concrete implementations in. `mock` holds
//! scripted implementations used by the scenario tests.

pub mod events;
pub mod gates;
pub mod llm;
pub mod mock;
pub mod session;
pub mod tools;
pub mod validator;

pub use events::{EventSink, OrchestratorEvent};
pub use gates::GateRunner;
pub use llm::{
    LlmAdapter, LlmError, LlmErrorKind, LlmRequest, LlmResponse, Message, Role, SystemBlock,
    SystemPrompt, TokenUsage, ToolCallRequest,
};
pub use session::SessionStore;
pub use tools::{ToolExecutor, ToolInvocationCtx, ToolOutcome};
pub use validator::{CompletionValidator, ValidationReport, ValidationVerdict};
