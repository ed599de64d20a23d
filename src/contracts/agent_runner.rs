use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized event stream shape every concrete agent implementation must
/// translate its own wire format into (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text { content: String },
    ToolUse { tool: String, input: Value },
    ToolResult { tool: String, result: Value, is_error: bool },
    Error { message: String },
    Complete { summary: CompletionSummary },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub turns: u32,
    pub tools_used: u32,
    pub files_modified: u32,
    pub exit_code: i32,
    pub summary: String,
}

/// Returned by `start`/`resume`; owns the event stream for one agent-side
/// run. `events` is consumed exactly once by the `AgentAdapter`.
pub struct SessionHandle {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub events: async_channel::Receiver<AgentEvent>,
}

/// Opaque per-run configuration handed to `start`/`resume`. Concrete agents
/// interpret this however they need to (model name, tool allowlist, working
/// directory); the core treats it as assembled-prompt-plus-knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunConfig {
    pub user_prompt: String,
    pub system_prompt: String,
    pub working_directory: std::path::PathBuf,
}

/// The agent contract (§4.4, §6). Implementations wrap a concrete coding
/// agent process (Claude, Codex, a mock) behind this narrow interface.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Whether `send_message` enqueues on a live stream (`true`) or the
    /// supervisor must close-and-restart to deliver feedback (`false`).
    fn supports_streaming_input(&self) -> bool;

    async fn start(&self, config: AgentRunConfig) -> anyhow::Result<SessionHandle>;

    async fn send_message(&self, session_id: &str, message: &str) -> anyhow::Result<()>;

    /// Idempotent: a second call while already stopped is a no-op.
    async fn stop(&self, session_id: &str) -> anyhow::Result<()>;

    async fn resume(&self, session_id: &str, config: AgentRunConfig) -> anyhow::Result<SessionHandle>;

    async fn is_running(&self, session_id: &str) -> anyhow::Result<bool>;
}
