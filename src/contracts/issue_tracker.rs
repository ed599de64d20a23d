use crate::model::{AgentSignal, Attachment, Comment, Issue, WebhookEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub team_id: Option<String>,
}

/// Events surfaced by `IssueTracker::watch_issues`. `WebhookEvent` already
/// covers the same variants for the HTTP ingress path; this is the
/// streaming-subscription counterpart of the same union.
pub type IssueEvent = WebhookEvent;

/// The tracker contract (§6). Wire formats are tracker-specific; the core
/// observes only this interface.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, id: &str) -> anyhow::Result<Issue>;

    async fn list_assigned_issues(
        &self,
        member_id: &str,
        filters: Option<&str>,
    ) -> anyhow::Result<Vec<Issue>>;

    async fn update_issue_state(&self, id: &str, new_state: &str) -> anyhow::Result<()>;

    async fn add_comment(
        &self,
        issue_id: &str,
        body: &str,
        parent_id: Option<&str>,
        author: &str,
    ) -> anyhow::Result<Comment>;

    async fn get_comments(&self, issue_id: &str) -> anyhow::Result<Vec<Comment>>;

    async fn get_attachments(&self, issue_id: &str) -> anyhow::Result<Vec<Attachment>>;

    async fn send_signal(&self, issue_id: &str, signal: AgentSignal) -> anyhow::Result<()>;

    async fn get_member(&self, id: &str) -> anyhow::Result<Member>;

    async fn list_labels(&self, team_id: Option<&str>) -> anyhow::Result<Vec<Label>>;

    /// Subscribes to tracker-side changes for `member_id`. The returned
    /// receiver is the streaming counterpart of the webhook path; a
    /// `SessionManager` watching a tracker directly (rather than through
    /// `WebhookIngress`) drains this channel.
    async fn watch_issues(&self, member_id: &str) -> anyhow::Result<async_channel::Receiver<IssueEvent>>;
}
