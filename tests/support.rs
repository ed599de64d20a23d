use async_trait::async_trait;
use orchestration_core::contracts::{
    AgentEvent, AgentRunConfig, AgentRunner, CompletionSummary, IssueEvent, Label, Member,
    Renderer, RendererSignal, SessionHandle, SessionStorage,
};
use orchestration_core::model::{Activity, AgentSignal, Attachment, Comment, Issue, Session, WebhookEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

#[derive(Default)]
pub struct FakeTracker {
    pub comments_posted: StdMutex<Vec<String>>,
}

#[async_trait]
impl orchestration_core::contracts::IssueTracker for FakeTracker {
    async fn get_issue(&self, id: &str) -> anyhow::Result<Issue> {
        Ok(Issue {
            id: id.to_string(),
            identifier: "TEAM-1".into(),
            repository_id: "repo-1".into(),
            title: "Add unit tests for parser".into(),
            description: "The parser module lacks coverage.".into(),
            state: "in-progress".into(),
            labels: vec![],
            comments: vec![],
            priority: None,
            url: None,
        })
    }
    async fn list_assigned_issues(&self, _member_id: &str, _filters: Option<&str>) -> anyhow::Result<Vec<Issue>> {
        Ok(vec![])
    }
    async fn update_issue_state(&self, _id: &str, _new_state: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn add_comment(
        &self,
        _issue_id: &str,
        body: &str,
        _parent_id: Option<&str>,
        _author: &str,
    ) -> anyhow::Result<Comment> {
        self.comments_posted.lock().unwrap().push(body.to_string());
        Ok(Comment {
            id: "c1".into(),
            author: "orchestration-core".into(),
            body: body.to_string(),
            created_at: chrono::Utc::now(),
            parent_comment_id: None,
            is_root: true,
        })
    }
    async fn get_comments(&self, _issue_id: &str) -> anyhow::Result<Vec<Comment>> {
        Ok(vec![])
    }
    async fn get_attachments(&self, _issue_id: &str) -> anyhow::Result<Vec<Attachment>> {
        Ok(vec![])
    }
    async fn send_signal(&self, _issue_id: &str, _signal: AgentSignal) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_member(&self, id: &str) -> anyhow::Result<Member> {
        Ok(Member { id: id.to_string(), name: "bot".into(), email: None })
    }
    async fn list_labels(&self, _team_id: Option<&str>) -> anyhow::Result<Vec<Label>> {
        Ok(vec![])
    }
    async fn watch_issues(&self, _member_id: &str) -> anyhow::Result<async_channel::Receiver<IssueEvent>> {
        let (_tx, rx) = async_channel::unbounded();
        Ok(rx)
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    pub pushed: StdMutex<Vec<Activity>>,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn attach_session(&self, _session_id: &str, _metadata: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
    async fn push_activity(&self, _session_id: &str, activity: Activity) -> anyhow::Result<()> {
        self.pushed.lock().unwrap().push(activity);
        Ok(())
    }
    async fn detach_session(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn inbound(&self) -> async_channel::Receiver<RendererSignal> {
        let (_tx, rx) = async_channel::unbounded();
        rx
    }
}

#[derive(Default)]
pub struct FakeStorage {
    pub persisted: StdMutex<Vec<Session>>,
}

#[async_trait]
impl SessionStorage for FakeStorage {
    async fn persist(&self, session: &Session) -> anyhow::Result<()> {
        self.persisted.lock().unwrap().push(session.clone());
        Ok(())
    }
    async fn load(&self, _session_id: &str) -> anyhow::Result<Option<Session>> {
        Ok(None)
    }
    async fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
    async fn remove(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A runner whose event script is provided up front (one `Vec<AgentEvent>`
/// per subroutine attempt, consumed in order across `start`/`resume`
/// calls), used to drive the seed end-to-end scenarios deterministically.
pub struct ScriptedRunner {
    scripts: StdMutex<Vec<Vec<AgentEvent>>>,
    call_index: AtomicUsize,
    streaming: bool,
}

impl ScriptedRunner {
    pub fn new(scripts: Vec<Vec<AgentEvent>>, streaming: bool) -> Self {
        Self {
            scripts: StdMutex::new(scripts),
            call_index: AtomicUsize::new(0),
            streaming,
        }
    }

    async fn next_handle(&self) -> SessionHandle {
        let idx = self.call_index.fetch_add(1, Ordering::SeqCst);
        let script = {
            let scripts = self.scripts.lock().unwrap();
            scripts.get(idx).cloned().unwrap_or_else(|| {
                vec![AgentEvent::Complete {
                    summary: CompletionSummary {
                        turns: 1,
                        tools_used: 0,
                        files_modified: 0,
                        exit_code: 0,
                        summary: "done".into(),
                    },
                }]
            })
        };
        let (tx, rx) = async_channel::unbounded();
        for event in script {
            tx.send(event).await.unwrap();
        }
        SessionHandle {
            id: format!("agent-session-{idx}"),
            started_at: chrono::Utc::now(),
            events: rx,
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    fn supports_streaming_input(&self) -> bool {
        self.streaming
    }
    async fn start(&self, _config: AgentRunConfig) -> anyhow::Result<SessionHandle> {
        Ok(self.next_handle().await)
    }
    async fn send_message(&self, _session_id: &str, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn stop(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn resume(&self, _session_id: &str, _config: AgentRunConfig) -> anyhow::Result<SessionHandle> {
        Ok(self.next_handle().await)
    }
    async fn is_running(&self, _session_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub fn text(content: &str) -> AgentEvent {
    AgentEvent::Text { content: content.to_string() }
}

pub fn complete(exit_code: i32) -> AgentEvent {
    AgentEvent::Complete {
        summary: CompletionSummary {
            turns: 1,
            tools_used: 0,
            files_modified: 0,
            exit_code,
            summary: "done".into(),
        },
    }
}

#[allow(dead_code)]
pub fn noop_webhook_event(issue: Issue) -> WebhookEvent {
    WebhookEvent::Assigned { issue }
}

#[allow(dead_code)]
pub fn arc_tracker() -> Arc<FakeTracker> {
    Arc::new(FakeTracker::default())
}
