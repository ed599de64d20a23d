//! Public façade (§4.8). Owns admission control, routes signals to
//! supervisors, and watches the tracker. Grounded on the teacher's
//! `MasterClaude` (`orchestrator/mod.rs`): `DashMap` registry of live
//! workers, `async_channel::bounded` admission queue, single admission
//! task draining it, `generate_status_report`-style snapshot.

use crate::config::CoreConfig;
use crate::contracts::{AgentRunner, IssueTracker, Renderer};
use crate::model::{AgentSignal, Session, WebhookEvent};
use crate::procedure::Procedure;
use crate::session_store::SessionStore;
use crate::session_supervisor::{SessionSupervisor, SupervisorOutcome};
use crate::shutdown::ShutdownToken;
use crate::webhook_ingress::EventDispatch;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

/// Observer-facing events (§4.8 "Events emitted"). The core itself never
/// depends on these; they exist for callers who want visibility.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Started,
    SessionStarted { session_id: String, issue_id: String },
    SessionCompleted { session_id: String, issue_id: String },
    SessionFailed { session_id: String, issue_id: String, error: String },
    Error { error: String, context: String },
}

#[derive(Debug, Default, Clone)]
pub struct StatusReport {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub webhook_dedup_hits: u64,
    pub live_sessions: usize,
    pub queue_depth: usize,
}

struct QueuedStart {
    issue_id: String,
    repository_id: String,
    working_directory: std::path::PathBuf,
    procedure: Procedure,
}

struct SupervisorHandle {
    signal_tx: mpsc::Sender<AgentSignal>,
}

/// Admits sessions under `maxConcurrentSessions`, owns all live
/// supervisors, and is the single point of contact for both the webhook
/// ingress and a direct tracker-watch loop.
pub struct SessionManager {
    config: Arc<CoreConfig>,
    store: Arc<SessionStore>,
    tracker: Arc<dyn IssueTracker>,
    renderer: Arc<dyn Renderer>,
    runner: Arc<dyn AgentRunner>,
    supervisors: DashMap<String, SupervisorHandle>,
    admission_tx: async_channel::Sender<QueuedStart>,
    admission_rx: async_channel::Receiver<QueuedStart>,
    outcome_tx: mpsc::UnboundedSender<SupervisorOutcome>,
    /// Fan-out of every `SupervisorOutcome`, independent of the internal
    /// outcome loop's bookkeeping. Consumed by `orchestrator_supervisor` to
    /// gate further task launches on child-session results (§4.5.2).
    outcome_broadcast: tokio::sync::broadcast::Sender<SupervisorOutcome>,
    shutdown: ShutdownToken,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    webhook_dedup_hits: AtomicU64,
    /// Mirrors the admission loop's in-memory pending backlog (items held
    /// back because their repository is at capacity), since those items are
    /// no longer sitting in `admission_rx` once dequeued for scanning.
    queued_depth: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: Arc<CoreConfig>,
        store: Arc<SessionStore>,
        tracker: Arc<dyn IssueTracker>,
        renderer: Arc<dyn Renderer>,
        runner: Arc<dyn AgentRunner>,
    ) -> Arc<Self> {
        let (admission_tx, admission_rx) = async_channel::bounded(config.max_queue_depth);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (outcome_broadcast, _) = tokio::sync::broadcast::channel(256);

        let manager = Arc::new(Self {
            config,
            store,
            tracker,
            renderer,
            runner,
            supervisors: DashMap::new(),
            admission_tx,
            admission_rx,
            outcome_tx,
            outcome_broadcast,
            shutdown: ShutdownToken::new(),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            webhook_dedup_hits: AtomicU64::new(0),
            queued_depth: AtomicU64::new(0),
        });

        manager.clone().spawn_admission_loop();
        manager.clone().spawn_outcome_loop(outcome_rx);
        manager
    }

    /// Scans the whole pending backlog on every wake-up instead of blocking
    /// on the head of the queue, so one repository at capacity never
    /// head-of-line-blocks starts queued for other repositories (§4.8's cap
    /// is per repository; a single saturated repository must not starve the
    /// rest).
    fn spawn_admission_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut pending: Vec<QueuedStart> = Vec::new();
            let mut recheck = tokio::time::interval(Duration::from_millis(50));

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    queued = self.admission_rx.recv() => {
                        match queued {
                            Ok(queued) => pending.push(queued),
                            Err(_) => break,
                        }
                    }
                    _ = recheck.tick() => {}
                }

                let mut i = 0;
                while i < pending.len() {
                    if self.store.count_non_terminal(&pending[i].repository_id) < self.config.max_concurrent_sessions {
                        let queued = pending.remove(i);
                        self.launch(queued).await;
                    } else {
                        i += 1;
                    }
                }
                self.queued_depth.store(pending.len() as u64, Ordering::Relaxed);
            }
        });
    }

    fn spawn_outcome_loop(self: Arc<Self>, mut outcome_rx: mpsc::UnboundedReceiver<SupervisorOutcome>) {
        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                let _ = self.outcome_broadcast.send(outcome.clone());
                match outcome {
                    SupervisorOutcome::Started { session_id, issue_id } => {
                        self.sessions_started.fetch_add(1, Ordering::Relaxed);
                        info!(session_id, issue_id, "session started");
                    }
                    SupervisorOutcome::Completed { session_id, issue_id } => {
                        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
                        self.supervisors.remove(&session_id);
                        self.store.remove(&session_id);
                        info!(session_id, issue_id, "session completed");
                    }
                    SupervisorOutcome::Failed { session_id, issue_id, error } => {
                        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
                        self.supervisors.remove(&session_id);
                        self.store.remove(&session_id);
                        warn!(session_id, issue_id, error, "session failed");
                    }
                    SupervisorOutcome::Canceled { session_id, issue_id } => {
                        self.supervisors.remove(&session_id);
                        self.store.remove(&session_id);
                        info!(session_id, issue_id, "session canceled");
                    }
                }
            }
        });
    }

    async fn launch(self: &Arc<Self>, queued: QueuedStart) {
        let session = Session::new(
            queued.issue_id.clone(),
            queued.repository_id,
            queued.working_directory,
            queued.procedure.initial_state(),
        );
        let session_id = session.id.clone();

        if let Err(e) = self.store.insert_if_absent(session) {
            warn!(issue_id = %queued.issue_id, error = %e, "admission failed");
            return;
        }

        let (signal_tx, signal_rx) = mpsc::channel(32);
        self.supervisors
            .insert(session_id.clone(), SupervisorHandle { signal_tx });

        let adapter = Arc::new(crate::agent_adapter::AgentAdapter::new(
            self.runner.clone(),
            self.config.event_buffer_high_watermark,
            self.config.stop_grace_period,
        ));

        let supervisor = SessionSupervisor::new(
            session_id,
            queued.issue_id,
            self.store.clone(),
            self.tracker.clone(),
            self.renderer.clone(),
            adapter,
            self.config.clone(),
            self.outcome_tx.clone(),
            self.shutdown.child(),
        );

        tokio::spawn(supervisor.run(signal_rx));
    }

    /// Translates a watched/webhook-delivered event into the appropriate
    /// admission or routing action (§4.8).
    pub async fn handle_event(&self, event: WebhookEvent) -> anyhow::Result<()> {
        match event {
            WebhookEvent::Assigned { issue } => {
                let repository_id = issue.repository_id.clone();
                if self.store.count_non_terminal(&repository_id) >= self.config.max_concurrent_sessions {
                    if self.admission_tx.try_send(QueuedStart {
                        issue_id: issue.id.clone(),
                        repository_id: repository_id.clone(),
                        working_directory: self.config.home_directory.join("work").join(&issue.id),
                        procedure: Procedure::FullDevelopment,
                    }).is_err() {
                        self.tracker
                            .add_comment(
                                &issue.id,
                                "Admission queue is full; this issue will be retried once capacity frees up.",
                                None,
                                "orchestration-core",
                            )
                            .await
                            .ok();
                        warn!(issue_id = %issue.id, "admission queue full, rejected");
                    }
                } else {
                    self.admission_tx
                        .send(QueuedStart {
                            issue_id: issue.id.clone(),
                            repository_id,
                            working_directory: self.config.home_directory.join("work").join(&issue.id),
                            procedure: Procedure::FullDevelopment,
                        })
                        .await
                        .ok();
                }
            }
            WebhookEvent::Unassigned { issue } => {
                self.route_stop(&issue.id).await;
            }
            WebhookEvent::CommentAdded { issue, comment } => {
                self.route_signal(
                    &issue.id,
                    AgentSignal::Feedback {
                        message: comment.body,
                        attachments: None,
                    },
                )
                .await;
            }
            WebhookEvent::StateChanged { issue, .. } => {
                info!(issue_id = %issue.id, "issue state changed");
            }
            WebhookEvent::Signal { issue, signal } => {
                self.route_signal(&issue.id, signal).await;
            }
        }
        Ok(())
    }

    async fn route_signal(&self, issue_id: &str, signal: AgentSignal) {
        let Some(session) = self.store.get_by_issue(issue_id) else {
            warn!(issue_id, "signal for issue with no live session");
            return;
        };
        if let Some(handle) = self.supervisors.get(&session.id) {
            let _ = handle.signal_tx.send(signal).await;
        }
    }

    async fn route_stop(&self, issue_id: &str) {
        self.route_signal(issue_id, AgentSignal::Stop { reason: None }).await;
    }

    /// Direct-call admission entry point (bypasses the HTTP ingress),
    /// equivalent to an `assigned` webhook.
    pub async fn start_session(
        &self,
        issue_id: String,
        repository_id: String,
        working_directory: std::path::PathBuf,
        procedure: Procedure,
    ) -> anyhow::Result<()> {
        self.admission_tx
            .send(QueuedStart {
                issue_id,
                repository_id,
                working_directory,
                procedure,
            })
            .await
            .map_err(|_| anyhow::anyhow!("admission channel closed"))
    }

    /// Stop signal for a live session by issue id (idempotent, P8).
    pub async fn stop_session(&self, issue_id: &str) {
        self.route_stop(issue_id).await;
    }

    /// Starts the orchestrator procedure for a parent issue's sub-issue
    /// graph (§4.5.2): launches one child session per unblocked `impl`/
    /// `verify` task, gating further launches on each task's result.
    pub fn start_orchestrator(
        self: &Arc<Self>,
        parent_issue_id: String,
        repository_id: String,
        working_directory: std::path::PathBuf,
        sub_issues: &[crate::procedure::orchestrator_graph::SubIssueSpec],
    ) {
        let supervisor = crate::orchestrator_supervisor::OrchestratorSupervisor::new(
            parent_issue_id.clone(),
            repository_id,
            working_directory,
            self.clone(),
            sub_issues,
        );
        tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                warn!(parent_issue_id, error = %e, "orchestrator procedure failed");
            }
        });
    }

    pub fn note_dedup_hit(&self) {
        self.webhook_dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribes to every session's terminal/start outcome, independent of
    /// `self.supervisors`' own bookkeeping. Used by `orchestrator_supervisor`
    /// to gate further task launches on a child session's result.
    pub fn subscribe_outcomes(&self) -> tokio::sync::broadcast::Receiver<SupervisorOutcome> {
        self.outcome_broadcast.subscribe()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            webhook_dedup_hits: self.webhook_dedup_hits.load(Ordering::Relaxed),
            live_sessions: self.store.count_non_terminal_all(),
            queue_depth: self.admission_rx.len() + self.queued_depth.load(Ordering::Relaxed) as usize,
        }
    }

    /// Broadcasts stop to all supervisors, waits up to `shutdownGrace`, then
    /// hard-cancels the rest (§4.8).
    pub async fn stop(&self) {
        let session_ids: Vec<String> = self.supervisors.iter().map(|r| r.key().clone()).collect();
        for session_id in &session_ids {
            if let Some(handle) = self.supervisors.get(session_id) {
                let _ = handle.signal_tx.send(AgentSignal::Stop { reason: Some("shutdown".into()) }).await;
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while tokio::time::Instant::now() < deadline {
            if self.supervisors.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.shutdown.cancel();
    }
}

#[async_trait::async_trait]
impl EventDispatch for SessionManager {
    async fn handle_event(&self, event: WebhookEvent) -> anyhow::Result<()> {
        SessionManager::handle_event(self, event).await
    }

    fn note_dedup_hit(&self) {
        SessionManager::note_dedup_hit(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{AgentRunConfig, IssueEvent, Label, Member, SessionHandle};
    use crate::model::{Attachment, Comment, Issue};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeTracker {
        comments_posted: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn get_issue(&self, id: &str) -> anyhow::Result<Issue> {
            Ok(Issue {
                id: id.to_string(),
                identifier: "TEAM-1".into(),
                repository_id: "repo-1".into(),
                title: "t".into(),
                description: "".into(),
                state: "open".into(),
                labels: vec![],
                comments: vec![],
                priority: None,
                url: None,
            })
        }
        async fn list_assigned_issues(&self, _m: &str, _f: Option<&str>) -> anyhow::Result<Vec<Issue>> {
            Ok(vec![])
        }
        async fn update_issue_state(&self, _id: &str, _s: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn add_comment(&self, _issue_id: &str, body: &str, _p: Option<&str>, _a: &str) -> anyhow::Result<Comment> {
            self.comments_posted.lock().unwrap().push(body.to_string());
            Ok(Comment {
                id: "c1".into(),
                author: "bot".into(),
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

    struct FakeRenderer;
    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn attach_session(&self, _s: &str, _m: serde_json::Value) -> anyhow::Result<()> {
            Ok(())
        }
        async fn push_activity(&self, _s: &str, _a: crate::model::Activity) -> anyhow::Result<()> {
            Ok(())
        }
        async fn detach_session(&self, _s: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn inbound(&self) -> async_channel::Receiver<crate::contracts::RendererSignal> {
            let (_tx, rx) = async_channel::unbounded();
            rx
        }
    }

    struct ImmediateCompleteRunner;
    #[async_trait]
    impl AgentRunner for ImmediateCompleteRunner {
        fn supports_streaming_input(&self) -> bool {
            false
        }
        async fn start(&self, _config: AgentRunConfig) -> anyhow::Result<SessionHandle> {
            let (tx, rx) = async_channel::unbounded();
            tx.send(crate::contracts::AgentEvent::Complete {
                summary: crate::contracts::CompletionSummary {
                    turns: 1,
                    tools_used: 0,
                    files_modified: 0,
                    exit_code: 0,
                    summary: "done".into(),
                },
            })
            .await
            .unwrap();
            Ok(SessionHandle {
                id: "agent-1".into(),
                started_at: chrono::Utc::now(),
                events: rx,
            })
        }
        async fn send_message(&self, _s: &str, _m: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self, _s: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn resume(&self, _s: &str, config: AgentRunConfig) -> anyhow::Result<SessionHandle> {
            self.start(config).await
        }
        async fn is_running(&self, _s: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct FakeStorage;
    #[async_trait]
    impl crate::contracts::SessionStorage for FakeStorage {
        async fn persist(&self, _s: &Session) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load(&self, _s: &str) -> anyhow::Result<Option<Session>> {
            Ok(None)
        }
        async fn list(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn remove(&self, _s: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn admission_respects_concurrency_cap() {
        let config = Arc::new(CoreConfig {
            max_concurrent_sessions: 1,
            home_directory: PathBuf::from("/tmp"),
            ..CoreConfig::default()
        });
        let store = Arc::new(SessionStore::new(Arc::new(FakeStorage)));
        let manager = SessionManager::new(
            config,
            store.clone(),
            Arc::new(FakeTracker::default()),
            Arc::new(FakeRenderer),
            Arc::new(ImmediateCompleteRunner),
        );

        manager
            .start_session("ISSUE-1".into(), "repo".into(), PathBuf::from("/tmp/work"), Procedure::SimpleQuestion)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let report = manager.status_report();
        assert!(report.sessions_started >= 1 || report.sessions_completed >= 1);
    }
}
