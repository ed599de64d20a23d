//! Per-session lifecycle owner (§4.6). Grounded on the teacher's
//! `tokio::select!`-driven bridge loop in `coordination/ai_message_bus.rs`
//! and the `MasterClaude` message-handling loop in `orchestrator/mod.rs`,
//! generalized to one task per session instead of one shared bridge.

use crate::agent_adapter::{AdapterEvent, AgentAdapter};
use crate::config::CoreConfig;
use crate::contracts::{AgentRunConfig, IssueTracker, Renderer, RendererSignal};
use crate::model::{ActivityKind, AgentSignal, SessionState, SubroutineUnit};
use crate::procedure::{Procedure, ProcedureEngine, StepOutcome, ValidatorVerdict};
use crate::prompt_assembler::{PromptAssembler, PromptInputs, PromptKind};
use crate::session_store::SessionStore;
use crate::shutdown::ShutdownToken;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{error, info, warn};

const RETRY_BACKOFFS: [u64; 3] = [1, 4, 16];

/// Outbound message a supervisor posts to its manager, replacing the
/// cyclic supervisor<->manager back-pointer with message passing (§9
/// design note).
#[derive(Debug, Clone)]
pub enum SupervisorOutcome {
    Started { session_id: String, issue_id: String },
    Completed { session_id: String, issue_id: String },
    Failed { session_id: String, issue_id: String, error: String },
    Canceled { session_id: String, issue_id: String },
}

pub struct SessionSupervisor {
    session_id: String,
    issue_id: String,
    store: Arc<SessionStore>,
    tracker: Arc<dyn IssueTracker>,
    renderer: Arc<dyn Renderer>,
    adapter: Arc<AgentAdapter>,
    config: Arc<CoreConfig>,
    outcome_tx: mpsc::UnboundedSender<SupervisorOutcome>,
    shutdown: ShutdownToken,
}

impl SessionSupervisor {
    pub fn new(
        session_id: String,
        issue_id: String,
        store: Arc<SessionStore>,
        tracker: Arc<dyn IssueTracker>,
        renderer: Arc<dyn Renderer>,
        adapter: Arc<AgentAdapter>,
        config: Arc<CoreConfig>,
        outcome_tx: mpsc::UnboundedSender<SupervisorOutcome>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            session_id,
            issue_id,
            store,
            tracker,
            renderer,
            adapter,
            config,
            outcome_tx,
            shutdown,
        }
    }

    /// Runs the supervisor's main loop to completion. Consumes `self`: one
    /// task owns exactly one run. `signal_rx` is the single-consumer
    /// tracker-signal channel; `stop` signals preempt everything else.
    pub async fn run(mut self, mut signal_rx: mpsc::Receiver<AgentSignal>) {
        info!(session_id = %self.session_id, "supervisor starting");
        let _ = self
            .store
            .update(&self.session_id, |s| s.state = SessionState::Starting);
        let _ = self.outcome_tx.send(SupervisorOutcome::Started {
            session_id: self.session_id.clone(),
            issue_id: self.issue_id.clone(),
        });

        let outcome = self.drive(&mut signal_rx).await;

        let final_state = match &outcome {
            Ok(()) => SessionState::Completed,
            Err(SupervisorHalt::Canceled) => SessionState::Canceled,
            Err(SupervisorHalt::Failed(_)) => SessionState::Failed,
        };
        let _ = self
            .store
            .update(&self.session_id, |s| s.state = final_state);

        let message = match outcome {
            Ok(()) => SupervisorOutcome::Completed {
                session_id: self.session_id.clone(),
                issue_id: self.issue_id.clone(),
            },
            Err(SupervisorHalt::Canceled) => SupervisorOutcome::Canceled {
                session_id: self.session_id.clone(),
                issue_id: self.issue_id.clone(),
            },
            Err(SupervisorHalt::Failed(reason)) => {
                self.post_failure_comment(&reason).await;
                SupervisorOutcome::Failed {
                    session_id: self.session_id.clone(),
                    issue_id: self.issue_id.clone(),
                    error: reason,
                }
            }
        };
        let _ = self.outcome_tx.send(message);
        info!(session_id = %self.session_id, "supervisor finished");
    }

    async fn drive(&mut self, signal_rx: &mut mpsc::Receiver<AgentSignal>) -> Result<(), SupervisorHalt> {
        let _ = self
            .store
            .update(&self.session_id, |s| s.state = SessionState::Running);

        loop {
            let Some(session) = self.store.get(&self.session_id) else {
                return Err(SupervisorHalt::Failed("session vanished from store".into()));
            };
            if session.procedure.is_complete() {
                return Ok(());
            }
            let unit = session
                .procedure
                .current_unit()
                .expect("checked not complete above")
                .clone();

            match unit {
                SubroutineUnit::Single(name) => self.run_subroutine(&name, signal_rx).await?,
                SubroutineUnit::Parallel(members) => self.run_parallel_group(&members, signal_rx).await?,
            }
        }
    }

    /// Runs every member of a parallel subroutine group concurrently (§4.5,
    /// the debugger's three reproduce attempts) and joins before the
    /// procedure advances. Each member gets its own agent run and its own
    /// cancellation scope, cascading from both global shutdown and an
    /// explicit `stop` observed here; `signal_rx` is single-consumer so
    /// members themselves never read from it directly.
    async fn run_parallel_group(
        &mut self,
        members: &[String],
        signal_rx: &mut mpsc::Receiver<AgentSignal>,
    ) -> Result<(), SupervisorHalt> {
        let group_token = self.shutdown.child();
        let mut set: JoinSet<(String, Result<(), String>)> = JoinSet::new();
        for member in members {
            let member = member.clone();
            let session_id = self.session_id.clone();
            let issue_id = self.issue_id.clone();
            let store = self.store.clone();
            let tracker = self.tracker.clone();
            let renderer = self.renderer.clone();
            let adapter = self.adapter.clone();
            let config = self.config.clone();
            let token = group_token.child();
            set.spawn(async move {
                let outcome = Self::run_member(
                    session_id, issue_id, store, tracker, renderer, adapter, config, member.clone(), token,
                )
                .await;
                (member, outcome)
            });
        }

        let mut failures = Vec::new();
        let mut stopped = false;
        let renderer_rx = self.renderer.inbound();

        while !set.is_empty() {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled(), if !group_token.is_cancelled() => {
                    group_token.cancel();
                }

                Some(signal) = signal_rx.recv() => {
                    match signal {
                        AgentSignal::Stop { .. } => {
                            stopped = true;
                            group_token.cancel();
                        }
                        AgentSignal::Feedback { message, .. } => {
                            let _ = self.store.update(&self.session_id, |s| {
                                s.metadata.insert("pending_feedback".into(), serde_json::json!(message));
                            });
                        }
                        AgentSignal::Start => {}
                    }
                }

                Ok(signal) = renderer_rx.recv() => {
                    if let RendererSignal::StopRequest { session_id } = &signal {
                        if *session_id == self.session_id {
                            stopped = true;
                            group_token.cancel();
                        }
                    }
                }

                joined = set.join_next() => {
                    match joined {
                        Some(Ok((member, Ok(())))) => {
                            info!(session_id = %self.session_id, member, "reproduce attempt finished");
                        }
                        Some(Ok((member, Err(reason)))) => {
                            warn!(session_id = %self.session_id, member, reason, "reproduce attempt failed");
                            failures.push(format!("{}: {}", member, reason));
                        }
                        Some(Err(join_err)) => {
                            failures.push(format!("reproduce attempt task panicked: {}", join_err));
                        }
                        None => {}
                    }
                }
            }
        }

        if stopped || self.shutdown.is_cancelled() {
            return Err(SupervisorHalt::Canceled);
        }
        if !failures.is_empty() {
            return Err(SupervisorHalt::Failed(format!(
                "parallel group failed: {}",
                failures.join("; ")
            )));
        }

        let result = self.store.update(&self.session_id, |session| {
            ProcedureEngine::complete_parallel_group(&mut session.procedure);
        });
        result.map_err(|e| SupervisorHalt::Failed(e.to_string()))?;
        Ok(())
    }

    /// One independent member of a parallel group: a fresh (never resumed)
    /// agent run, cancelable only through `token` since the group's members
    /// don't share the supervisor's single-consumer signal channel.
    #[allow(clippy::too_many_arguments)]
    async fn run_member(
        session_id: String,
        issue_id: String,
        store: Arc<SessionStore>,
        tracker: Arc<dyn IssueTracker>,
        renderer: Arc<dyn Renderer>,
        adapter: Arc<AgentAdapter>,
        config: Arc<CoreConfig>,
        subroutine: String,
        token: ShutdownToken,
    ) -> Result<(), String> {
        let session = store.get(&session_id).ok_or_else(|| "session missing".to_string())?;
        let issue = tracker.get_issue(&issue_id).await.map_err(|e| e.to_string())?;

        let label_plugins = HashMap::new();
        let assembled = PromptAssembler::assemble(&PromptInputs {
            kind: PromptKind::NewAssignment,
            session: &session,
            issue: &issue,
            subroutine: &subroutine,
            subroutine_body: subroutine_prompt_body(&subroutine),
            user_comment: None,
            attachments: None,
            repository_working_dir: &session.working_directory.display().to_string(),
            repository_base_branch: "main",
            label_plugins: &label_plugins,
        });

        let run_config = AgentRunConfig {
            user_prompt: assembled.user_prompt,
            system_prompt: assembled.system_prompt,
            working_directory: session.working_directory.clone(),
        };

        let (agent_session_id, mut events) = adapter.start(run_config).await.map_err(|e| e.to_string())?;
        let mut batch = CommentBatch::new(config.comment_batch_window);
        // Same cadence as `attempt_subroutine`'s own keepalive so a
        // parallel-group member can't hold a batched comment unposted past
        // its configured flush deadline just because it never sees a tool
        // event (§4.6).
        let mut keepalive = interval(config.comment_batch_window);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    adapter.stop(&agent_session_id).await.ok();
                    batch.flush(&tracker, &issue_id).await;
                    return Err(format!("{} canceled", subroutine));
                }

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            let activity = store
                                .update(&session_id, |s| s.push_activity(event.kind.clone()))
                                .map_err(|e| e.to_string())?
                                .activities
                                .last()
                                .cloned()
                                .expect("just pushed");
                            if let Err(e) = renderer.push_activity(&session_id, activity).await {
                                warn!(session_id = %session_id, subroutine = %subroutine, error = %e, "renderer push failed");
                            }
                            match event.kind {
                                ActivityKind::Text { content } => batch.push(content),
                                ActivityKind::ToolUse { .. } | ActivityKind::ToolResult { .. } => {
                                    batch.flush(&tracker, &issue_id).await;
                                }
                                ActivityKind::Error { message } => {
                                    batch.flush(&tracker, &issue_id).await;
                                    return Err(message);
                                }
                                ActivityKind::Complete { exit_code, .. } => {
                                    batch.flush(&tracker, &issue_id).await;
                                    return if exit_code == 0 {
                                        Ok(())
                                    } else {
                                        Err(format!("{} reported non-zero exit", subroutine))
                                    };
                                }
                                ActivityKind::Warning { .. } | ActivityKind::Summary { .. } => {}
                            }
                        }
                        None => {
                            batch.flush(&tracker, &issue_id).await;
                            return Err("agent event stream closed".into());
                        }
                    }
                }

                _ = keepalive.tick() => {
                    batch.flush_if_stale(&tracker, &issue_id).await;
                }
            }
        }
    }

    async fn run_subroutine(
        &mut self,
        subroutine: &str,
        signal_rx: &mut mpsc::Receiver<AgentSignal>,
    ) -> Result<(), SupervisorHalt> {
        let mut retries_used = 0u32;
        loop {
            match self.attempt_subroutine(subroutine, signal_rx).await {
                Ok(outcome) => return self.apply_outcome(subroutine, outcome),
                Err(SubroutineFailure::AgentError(reason)) => {
                    if retries_used >= self.config.max_retries {
                        return Err(SupervisorHalt::Failed(format!(
                            "{} ({} retries exhausted)",
                            reason, retries_used
                        )));
                    }
                    let backoff = RETRY_BACKOFFS[retries_used as usize % RETRY_BACKOFFS.len()];
                    warn!(session_id = %self.session_id, subroutine, backoff, "retrying after agent error");
                    let _ = self.store.update(&self.session_id, |s| s.retry_count += 1);
                    retries_used += 1;
                    sleep(Duration::from_secs(backoff)).await;
                }
                Err(SubroutineFailure::Canceled) => return Err(SupervisorHalt::Canceled),
            }
        }
    }

    fn apply_outcome(
        &mut self,
        subroutine: &str,
        verdict: Option<ValidatorVerdict>,
    ) -> Result<(), SupervisorHalt> {
        let is_validated = Procedure::is_validated(subroutine);
        let max_iterations = self.config.max_iterations;
        let continue_on_max_retries = self.config.continue_on_max_retries;

        let result = self.store.update(&self.session_id, |session| {
            if is_validated {
                let _ = ProcedureEngine::complete_subroutine(
                    &mut session.procedure,
                    max_iterations,
                    continue_on_max_retries,
                    verdict,
                );
            } else {
                session.procedure.advance();
            }
        });

        let session = result.map_err(|e| SupervisorHalt::Failed(e.to_string()))?;
        if let Some(current) = session.procedure.current_subroutine() {
            if let Some(loop_state) = session.procedure.validation.get(current) {
                if loop_state.outcome == crate::model::ValidationOutcome::FailedMaxRetries {
                    return Err(SupervisorHalt::Failed(format!(
                        "subroutine {} failed after max validation retries",
                        current
                    )));
                }
            }
        }
        Ok(())
    }

    /// Runs one pass of `subroutine`: assembles the prompt, starts or
    /// resumes the agent, pumps its events to renderer/tracker/persistence
    /// in order, and returns once the agent emits `complete` or an error,
    /// or a `stop` signal preempts.
    async fn attempt_subroutine(
        &mut self,
        subroutine: &str,
        signal_rx: &mut mpsc::Receiver<AgentSignal>,
    ) -> Result<Option<ValidatorVerdict>, SubroutineFailure> {
        let session = self
            .store
            .get(&self.session_id)
            .ok_or_else(|| SubroutineFailure::AgentError("session missing".into()))?;

        let issue = self
            .tracker
            .get_issue(&self.issue_id)
            .await
            .map_err(|e| SubroutineFailure::AgentError(e.to_string()))?;

        let prompt_kind = if session.agent_session_id.is_some() {
            PromptKind::Continuation
        } else {
            PromptKind::NewAssignment
        };
        let label_plugins = HashMap::new();
        let assembled = PromptAssembler::assemble(&PromptInputs {
            kind: prompt_kind,
            session: &session,
            issue: &issue,
            subroutine,
            subroutine_body: subroutine_prompt_body(subroutine),
            user_comment: None,
            attachments: None,
            repository_working_dir: &session.working_directory.display().to_string(),
            repository_base_branch: "main",
            label_plugins: &label_plugins,
        });

        let run_config = AgentRunConfig {
            user_prompt: assembled.user_prompt,
            system_prompt: assembled.system_prompt,
            working_directory: session.working_directory.clone(),
        };

        let (agent_session_id, mut events) = if let Some(existing) = &session.agent_session_id {
            self.adapter
                .resume(existing, run_config)
                .await
                .map_err(|e| SubroutineFailure::AgentError(e.to_string()))?
        } else {
            self.adapter
                .start(run_config)
                .await
                .map_err(|e| SubroutineFailure::AgentError(e.to_string()))?
        };
        let _ = self
            .store
            .update(&self.session_id, |s| s.agent_session_id = Some(agent_session_id.clone()));

        let _ = self
            .store
            .update(&self.session_id, |s| s.state = SessionState::AwaitingAgent);

        let mut batch = CommentBatch::new(self.config.comment_batch_window);
        // Ticks at the same cadence as the batch window so a pending batch
        // is never held past its configured flush deadline (§4.6).
        let mut keepalive = interval(self.config.comment_batch_window);
        let mut contract_violations = 0u32;
        let renderer_rx = self.renderer.inbound();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    self.adapter.stop(&agent_session_id).await.ok();
                    return Err(SubroutineFailure::Canceled);
                }

                Some(signal) = signal_rx.recv() => {
                    if let AgentSignal::Stop { .. } = &signal {
                        self.adapter.stop(&agent_session_id).await.ok();
                        batch.flush(&self.tracker, &self.issue_id).await;
                        return Err(SubroutineFailure::Canceled);
                    }
                    self.handle_signal(signal, &agent_session_id).await;
                }

                Ok(signal) = renderer_rx.recv() => {
                    match signal {
                        RendererSignal::StopRequest { session_id } if session_id == self.session_id => {
                            self.adapter.stop(&agent_session_id).await.ok();
                            batch.flush(&self.tracker, &self.issue_id).await;
                            return Err(SubroutineFailure::Canceled);
                        }
                        RendererSignal::UserInput { session_id, text } if session_id == self.session_id => {
                            if self.adapter.supports_streaming_input() {
                                let _ = self.adapter.send_message(&agent_session_id, &text).await;
                            } else {
                                let _ = self.store.update(&self.session_id, |s| {
                                    s.metadata.insert("pending_feedback".into(), serde_json::json!(text));
                                });
                            }
                        }
                        _ => {}
                    }
                }

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            let outcome = self
                                .handle_activity(event.kind, subroutine, &mut batch, &mut contract_violations)
                                .await?;
                            if let Some(verdict) = outcome {
                                batch.flush(&self.tracker, &self.issue_id).await;
                                return Ok(verdict);
                            }
                        }
                        None => {
                            batch.flush(&self.tracker, &self.issue_id).await;
                            return Err(SubroutineFailure::AgentError("agent event stream closed".into()));
                        }
                    }
                }

                _ = keepalive.tick() => {
                    batch.flush_if_stale(&self.tracker, &self.issue_id).await;
                }
            }
        }
    }

    async fn handle_signal(&mut self, signal: AgentSignal, agent_session_id: &str) {
        match signal {
            AgentSignal::Feedback { message, .. } => {
                if self.adapter.supports_streaming_input() {
                    let _ = self.adapter.send_message(agent_session_id, &message).await;
                } else {
                    // Applied after the current subroutine completes: store
                    // it as pending session metadata for the next prompt.
                    let _ = self.store.update(&self.session_id, |s| {
                        s.metadata
                            .insert("pending_feedback".into(), serde_json::json!(message));
                    });
                }
            }
            AgentSignal::Start | AgentSignal::Stop { .. } => {}
        }
    }

    async fn handle_activity(
        &mut self,
        kind: ActivityKind,
        subroutine: &str,
        batch: &mut CommentBatch,
        contract_violations: &mut u32,
    ) -> Result<Option<Option<ValidatorVerdict>>, SubroutineFailure> {
        let activity = self
            .store
            .update(&self.session_id, |s| {
                s.push_activity(kind.clone());
            })
            .map_err(|e| SubroutineFailure::AgentError(e.to_string()))?
            .activities
            .last()
            .cloned()
            .expect("just pushed");

        if let Err(e) = self.renderer.push_activity(&self.session_id, activity.clone()).await {
            warn!(session_id = %self.session_id, error = %e, "renderer push failed");
            let _ = self.store.update(&self.session_id, |s| {
                s.push_activity(ActivityKind::Warning {
                    message: format!("renderer error: {}", e),
                });
            });
        }

        match kind {
            ActivityKind::Text { content } => {
                batch.push(content);
                Ok(None)
            }
            ActivityKind::ToolUse { .. } | ActivityKind::ToolResult { .. } => {
                batch.flush(&self.tracker, &self.issue_id).await;
                Ok(None)
            }
            ActivityKind::Warning { .. } => Ok(None),
            ActivityKind::Error { message } => {
                *contract_violations += 1;
                if *contract_violations > 3 {
                    Err(SubroutineFailure::AgentError(message))
                } else {
                    Ok(None)
                }
            }
            ActivityKind::Complete { exit_code, .. } => {
                let pass = exit_code == 0;
                if Procedure::is_validated(subroutine) {
                    Ok(Some(Some(ValidatorVerdict {
                        pass,
                        reason: if pass {
                            "agent reported success".into()
                        } else {
                            "agent reported non-zero exit".into()
                        },
                    })))
                } else if pass {
                    Ok(Some(None))
                } else {
                    Err(SubroutineFailure::AgentError("subroutine failed".into()))
                }
            }
            ActivityKind::Summary { .. } => Ok(None),
        }
    }

    async fn post_failure_comment(&self, reason: &str) {
        let session = self.store.get(&self.session_id);
        let retries = session.map(|s| s.retry_count).unwrap_or(0);
        let body = format!("Session failed: {}. ({} retries exhausted.)", reason, retries);
        if let Err(e) = self.tracker.add_comment(&self.issue_id, &body, None, "orchestration-core").await {
            error!(session_id = %self.session_id, error = %e, "failed to post failure comment");
        }
    }
}

enum SupervisorHalt {
    Canceled,
    Failed(String),
}

enum SubroutineFailure {
    AgentError(String),
    Canceled,
}

fn subroutine_prompt_body(subroutine: &str) -> &'static str {
    match subroutine {
        "question-investigation" => "Investigate the question raised in the issue.",
        "question-answer" => "Answer the question directly and concisely.",
        "doc-implementation" => "Implement the requested documentation change.",
        "coding-activity" => "Implement the requested code change.",
        "verifications" => "Run tests and linters; report pass/fail.",
        "changelog-update" => "Update the changelog.",
        "git-commit" => "Commit the change.",
        "gh-pr" => "Open a pull request.",
        "concise-summary" => "Summarize the work performed, concisely.",
        "reproduce-1" | "reproduce-2" | "reproduce-3" => "Attempt to reproduce the reported bug.",
        "fix" => "Fix the root cause of the reproduced bug.",
        _ => "Perform the subroutine.",
    }
}

/// Coalesces consecutive `text` activities within `window` into one tracker
/// comment (§4.6). Tool activities flush any pending batch first.
struct CommentBatch {
    window: Duration,
    pending: Vec<String>,
    opened_at: Option<Instant>,
}

impl CommentBatch {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
            opened_at: None,
        }
    }

    fn push(&mut self, text: String) {
        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.push(text);
    }

    async fn flush_if_stale(&mut self, tracker: &Arc<dyn IssueTracker>, issue_id: &str) {
        if let Some(opened) = self.opened_at {
            if opened.elapsed() >= self.window {
                self.flush(tracker, issue_id).await;
            }
        }
    }

    async fn flush(&mut self, tracker: &Arc<dyn IssueTracker>, issue_id: &str) {
        if self.pending.is_empty() {
            return;
        }
        let body = self.pending.join("\n\n");
        self.pending.clear();
        self.opened_at = None;

        let mut attempt = 0;
        loop {
            match tracker.add_comment(issue_id, &body, None, "orchestration-core").await {
                Ok(_) => break,
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    warn!(issue_id, attempt, error = %e, "retrying tracker comment post");
                    let jitter_ms = 100 * attempt + rand::random::<u64>() % 50;
                    sleep(Duration::from_millis(jitter_ms)).await;
                }
                Err(e) => {
                    warn!(issue_id, error = %e, "dropping tracker comment after retries");
                    break;
                }
            }
        }
    }
}
