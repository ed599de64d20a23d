use crate::model::Session;
use async_trait::async_trait;

/// The persistence contract (§6). `<home>/sessions/<scope>/<sessionId>.json`
/// layout and backward-compatible unknown-field preservation are the
/// concrete backend's concern; the core only calls this interface.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn persist(&self, session: &Session) -> anyhow::Result<()>;

    async fn load(&self, session_id: &str) -> anyhow::Result<Option<Session>>;

    async fn list(&self) -> anyhow::Result<Vec<String>>;

    async fn remove(&self, session_id: &str) -> anyhow::Result<()>;
}
