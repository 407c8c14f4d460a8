//! Session-store contract: conversation history and session liveness.

use crate::adapters::llm::Message;
use async_trait::async_trait;
use serde_json::Value;

/// Host-provided session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Update session metadata and its last-touched timestamp.
    async fn touch_session(&self, session_id: &str, meta: &Value) -> anyhow::Result<()>;

    /// Record a session status ("running", "stopped", "completed", ...).
    async fn mark_session_status(&self, session_id: &str, status: &str) -> anyhow::Result<()>;

    /// The most recent `limit` conversation messages.
    async fn get_conversation_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>>;

    /// Replace the stored conversation wholesale (used after compaction).
    async fn replace_messages(&self, session_id: &str, messages: &[Message])
    -> anyhow::Result<()>;
}
