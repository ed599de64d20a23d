//! Normalizes a concrete `AgentRunner`'s event stream into uniform
//! `Activity` records, with backpressure (§4.4). Grounded on the teacher's
//! `tokio::select!`-driven message loops in `coordination/ai_message_bus.rs`,
//! generalized from a coordination bridge into a single-producer adapter.

use crate::contracts::{AgentEvent, AgentRunConfig, AgentRunner, CompletionSummary, SessionHandle};
use crate::model::ActivityKind;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// Normalized activity plus an optional directive for the consumer
/// (currently only used to signal buffer-drop warnings inline).
pub struct AdapterEvent {
    pub kind: ActivityKind,
}

/// Runs one agent session, translating its raw `AgentEvent`s into
/// `ActivityKind`s and applying the backpressure policy from §4.4.
pub struct AgentAdapter {
    runner: Arc<dyn AgentRunner>,
    high_watermark: usize,
    stop_grace_period: Duration,
}

impl AgentAdapter {
    pub fn new(runner: Arc<dyn AgentRunner>, high_watermark: usize, stop_grace_period: Duration) -> Self {
        Self {
            runner,
            high_watermark,
            stop_grace_period,
        }
    }

    pub fn supports_streaming_input(&self) -> bool {
        self.runner.supports_streaming_input()
    }

    /// Starts the agent and returns the adapter-side session id plus a
    /// consumer channel of normalized activities. Backpressure is applied
    /// inside the pump task, not on the caller.
    pub async fn start(
        &self,
        config: AgentRunConfig,
    ) -> anyhow::Result<(String, mpsc::Receiver<AdapterEvent>)> {
        let handle = self.runner.start(config).await?;
        Ok(self.spawn_pump(handle))
    }

    pub async fn resume(
        &self,
        session_id: &str,
        config: AgentRunConfig,
    ) -> anyhow::Result<(String, mpsc::Receiver<AdapterEvent>)> {
        let handle = self.runner.resume(session_id, config).await?;
        Ok(self.spawn_pump(handle))
    }

    fn spawn_pump(&self, handle: SessionHandle) -> (String, mpsc::Receiver<AdapterEvent>) {
        let id = handle.id.clone();
        let (tx, rx) = mpsc::channel(self.high_watermark);
        let high_watermark = self.high_watermark;
        let events = handle.events;

        tokio::spawn(async move {
            // Bounded holding buffer to implement the "drop oldest
            // non-tool event" overflow policy: tool-use/tool-result events
            // are always forwarded, text/error/summary events are held here
            // while the channel is full and re-offered to it as soon as
            // capacity frees up, oldest first. An event is only ever
            // counted as dropped when it is evicted from this buffer to
            // make room for a newer one, never merely for having to wait.
            let mut overflow: VecDeque<ActivityKind> = VecDeque::new();
            let mut dropped = 0u64;

            while let Ok(event) = events.recv().await {
                let kind = normalize(event);

                if !overflow.is_empty() {
                    drain_overflow(&tx, &mut overflow);
                }

                match tx.try_send(AdapterEvent { kind: kind.clone() }) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        if kind.is_tool_activity() {
                            // Never dropped, but anything still buffered is
                            // strictly older than this event — flush it
                            // first (blocking) so emission order holds,
                            // then send the tool event itself.
                            if drain_overflow_blocking(&tx, &mut overflow).await.is_err() {
                                break;
                            }
                            if tx.send(AdapterEvent { kind }).await.is_err() {
                                break;
                            }
                        } else {
                            overflow.push_back(kind);
                            if overflow.len() > high_watermark {
                                overflow.pop_front();
                                dropped += 1;
                            }
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }

            // The agent is done producing; nothing still buffered was
            // actually dropped; there's simply no more backpressure racing
            // it, so block until the consumer has taken all of it (or is
            // gone).
            while let Some(kind) = overflow.pop_front() {
                if tx.send(AdapterEvent { kind }).await.is_err() {
                    break;
                }
            }

            if dropped > 0 {
                warn!(dropped, "adapter dropped non-tool events under backpressure");
                let _ = tx
                    .send(AdapterEvent {
                        kind: ActivityKind::Warning {
                            message: format!("dropped {} events under backpressure", dropped),
                        },
                    })
                    .await;
            }
        });

        (id, rx)
    }

    pub async fn send_message(&self, session_id: &str, message: &str) -> anyhow::Result<()> {
        self.runner.send_message(session_id, message).await
    }

    /// Idempotent stop (P8): a second call while already stopped resolves
    /// the same way the first does because `AgentRunner::stop` is itself
    /// required to be idempotent.
    pub async fn stop(&self, session_id: &str) -> anyhow::Result<bool> {
        self.runner.stop(session_id).await?;
        let waited = timeout(self.stop_grace_period, self.wait_until_stopped(session_id)).await;
        match waited {
            Ok(Ok(())) => {
                info!(session_id, "agent stopped within grace period");
                Ok(true)
            }
            _ => {
                warn!(session_id, "agent did not confirm stop within grace period");
                Ok(false)
            }
        }
    }

    async fn wait_until_stopped(&self, session_id: &str) -> anyhow::Result<()> {
        loop {
            if !self.runner.is_running(session_id).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Re-offers buffered events to `tx`, oldest first, stopping at the first
/// one that still doesn't fit.
fn drain_overflow(tx: &mpsc::Sender<AdapterEvent>, overflow: &mut VecDeque<ActivityKind>) {
    while let Some(kind) = overflow.pop_front() {
        match tx.try_send(AdapterEvent { kind }) {
            Ok(()) => continue,
            Err(mpsc::error::TrySendError::Full(AdapterEvent { kind })) => {
                overflow.push_front(kind);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                overflow.clear();
                break;
            }
        }
    }
}

/// Like `drain_overflow` but blocks until every buffered event is sent,
/// oldest first. Used before a never-dropped tool event so it can never
/// overtake older buffered events still waiting for room.
async fn drain_overflow_blocking(
    tx: &mpsc::Sender<AdapterEvent>,
    overflow: &mut VecDeque<ActivityKind>,
) -> Result<(), ()> {
    while let Some(kind) = overflow.pop_front() {
        if tx.send(AdapterEvent { kind }).await.is_err() {
            overflow.clear();
            return Err(());
        }
    }
    Ok(())
}

fn normalize(event: AgentEvent) -> ActivityKind {
    match event {
        AgentEvent::Text { content } => ActivityKind::Text { content },
        AgentEvent::ToolUse { tool, input } => ActivityKind::ToolUse { tool, input },
        AgentEvent::ToolResult { tool, result, is_error } => ActivityKind::ToolResult {
            tool,
            result,
            is_error,
        },
        AgentEvent::Error { message } => ActivityKind::Error { message },
        AgentEvent::Complete { summary } => ActivityKind::Complete {
            turns: summary.turns,
            tools_used: summary.tools_used,
            files_modified: summary.files_modified,
            exit_code: summary.exit_code,
            summary: summary.summary,
        },
    }
}
