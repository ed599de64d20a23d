use crate::model::Activity;
use async_trait::async_trait;
use serde_json::Value;

/// Inbound events a renderer can raise back at the session that owns it.
/// Modeled as a channel rather than callback registration, per the
/// no-event-emitter-inheritance design note.
#[derive(Debug, Clone)]
pub enum RendererSignal {
    UserInput { session_id: String, text: String },
    StopRequest { session_id: String },
}

/// The renderer contract (§6). Terminal TUI, browser WebSocket, or a test
/// double all implement this; the supervisor never knows which.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn attach_session(&self, session_id: &str, metadata: Value) -> anyhow::Result<()>;

    /// Failures here are never fatal to the session (§4.6) — the caller
    /// downgrades an `Err` to a `warning` activity.
    async fn push_activity(&self, session_id: &str, activity: Activity) -> anyhow::Result<()>;

    async fn detach_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Stream of user-input and stop-request signals raised by whatever is
    /// on the other end of this renderer (terminal, browser socket, test
    /// harness).
    fn inbound(&self) -> async_channel::Receiver<RendererSignal>;
}
