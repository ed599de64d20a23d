//! Core data model (§3): Issue, Comment, Attachment, Session, Activity,
//! ProcedureState, ValidationLoopState, WebhookEvent, AgentSignal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// An issue as observed through the `IssueTracker` contract. Immutable from
/// the core's view except via tracker mutations the core explicitly requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub id: String,
    pub identifier: String,
    /// The repository/project this issue belongs to, distinct from the
    /// issue's own id — §4.8's admission cap is per repository, not per
    /// issue.
    pub repository_id: String,
    pub title: String,
    pub description: String,
    pub state: String,
    pub labels: Vec<String>,
    pub comments: Vec<Comment>,
    pub priority: Option<String>,
    pub url: Option<String>,
}

impl Issue {
    /// Case-insensitive label membership check, used by attachment routing
    /// (§4.3) and procedure selection.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub parent_comment_id: Option<String>,
    pub is_root: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub local_path: PathBuf,
    pub mime_type: String,
    pub size_bytes: u64,
    pub issue_id: String,
}

/// Lifecycle states of a `SessionSupervisor` (§4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    AwaitingAgent,
    Completed,
    Failed,
    Canceled,
}

impl SessionState {
    /// §3 invariant: at most `maxConcurrentSessions` supervisors may sit in
    /// `starting`, `running`, or `awaiting-agent` at once.
    pub fn is_non_terminal_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::AwaitingAgent
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Canceled
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::AwaitingAgent => "awaiting-agent",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// One unit of agent-produced output or system-produced annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub kind: ActivityKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Text { content: String },
    ToolUse { tool: String, input: serde_json::Value },
    ToolResult {
        tool: String,
        result: serde_json::Value,
        is_error: bool,
    },
    Error { message: String },
    Warning { message: String },
    Complete {
        turns: u32,
        tools_used: u32,
        files_modified: u32,
        exit_code: i32,
        summary: String,
    },
    Summary { text: String },
}

impl ActivityKind {
    /// Tool-use/tool-result activities are never dropped under backpressure (§4.4).
    pub fn is_tool_activity(&self) -> bool {
        matches!(self, ActivityKind::ToolUse { .. } | ActivityKind::ToolResult { .. })
    }

    /// Consecutive `text` activities are the only ones eligible for tracker
    /// comment coalescing (§4.6).
    pub fn is_text(&self) -> bool {
        matches!(self, ActivityKind::Text { .. })
    }
}

/// Per-subroutine bounded retry structure judged by a separate validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<ValidationAttempt>,
    pub outcome: ValidationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationAttempt {
    pub iteration: u32,
    pub passed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationOutcome {
    InProgress,
    Passed,
    FailedMaxRetries,
}

impl ValidationLoopState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 1,
            max_iterations,
            history: Vec::new(),
            outcome: ValidationOutcome::InProgress,
        }
    }

    /// Records one validator verdict; returns `true` if the loop should
    /// continue to another iteration.
    pub fn record(&mut self, passed: bool, reason: String, continue_on_max_retries: bool) -> bool {
        self.history.push(ValidationAttempt {
            iteration: self.iteration,
            passed,
            reason,
        });

        if passed {
            self.outcome = ValidationOutcome::Passed;
            return false;
        }

        if self.iteration >= self.max_iterations {
            self.outcome = ValidationOutcome::FailedMaxRetries;
            return continue_on_max_retries && false;
        }

        self.iteration += 1;
        true
    }
}

/// One step of a procedure: either a single subroutine, or a set of
/// subroutines that run concurrently and are joined before the procedure
/// advances (§4.5, the `debugger` procedure's `reproduce×3 (parallel)`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubroutineUnit {
    Single(String),
    Parallel(Vec<String>),
}

impl SubroutineUnit {
    /// Subroutine names contained in this unit, in declaration order.
    pub fn members(&self) -> Vec<&str> {
        match self {
            SubroutineUnit::Single(name) => vec![name.as_str()],
            SubroutineUnit::Parallel(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for SubroutineUnit {
    fn from(name: &str) -> Self {
        SubroutineUnit::Single(name.to_string())
    }
}

impl From<String> for SubroutineUnit {
    fn from(name: String) -> Self {
        SubroutineUnit::Single(name)
    }
}

/// Active subroutine progression for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureState {
    pub procedure_name: String,
    pub subroutines: Vec<SubroutineUnit>,
    pub current_index: usize,
    pub validation: HashMap<String, ValidationLoopState>,
}

impl ProcedureState {
    pub fn new(procedure_name: impl Into<String>, subroutines: Vec<SubroutineUnit>) -> Self {
        Self {
            procedure_name: procedure_name.into(),
            subroutines,
            current_index: 0,
            validation: HashMap::new(),
        }
    }

    pub fn current_unit(&self) -> Option<&SubroutineUnit> {
        self.subroutines.get(self.current_index)
    }

    /// Convenience accessor for the common case of a single-subroutine step;
    /// `None` both past the end and when the current step is a parallel group.
    pub fn current_subroutine(&self) -> Option<&str> {
        match self.current_unit()? {
            SubroutineUnit::Single(name) => Some(name.as_str()),
            SubroutineUnit::Parallel(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.subroutines.len()
    }

    /// §8 P7: index must be non-decreasing.
    pub fn advance(&mut self) {
        if self.current_index < self.subroutines.len() {
            self.current_index += 1;
        }
    }
}

/// A live or persisted agent session (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub issue_id: String,
    pub repository_id: String,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub retry_count: u32,
    pub agent_session_id: Option<String>,
    pub activities: Vec<Activity>,
    pub procedure: ProcedureState,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(
        issue_id: impl Into<String>,
        repository_id: impl Into<String>,
        working_directory: PathBuf,
        procedure: ProcedureState,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            issue_id: issue_id.into(),
            repository_id: repository_id.into(),
            working_directory,
            created_at: Utc::now(),
            state: SessionState::Idle,
            retry_count: 0,
            agent_session_id: None,
            activities: Vec::new(),
            procedure,
            metadata: HashMap::new(),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.activities.last().map(|a| a.sequence + 1).unwrap_or(0)
    }

    /// Appends an activity, assigning the next monotonic sequence number.
    /// §3 invariant: every agent-produced activity appears exactly once, in
    /// emission order.
    pub fn push_activity(&mut self, kind: ActivityKind) -> &Activity {
        let activity = Activity {
            sequence: self.next_sequence(),
            created_at: Utc::now(),
            kind,
        };
        self.activities.push(activity);
        self.activities.last().unwrap()
    }
}

/// Discriminated webhook variants (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookEvent {
    Assigned { issue: Issue },
    Unassigned { issue: Issue },
    CommentAdded { issue: Issue, comment: Comment },
    StateChanged { issue: Issue, previous_state: String },
    Signal { issue: Issue, signal: AgentSignal },
}

impl WebhookEvent {
    pub fn issue(&self) -> &Issue {
        match self {
            WebhookEvent::Assigned { issue }
            | WebhookEvent::Unassigned { issue }
            | WebhookEvent::CommentAdded { issue, .. }
            | WebhookEvent::StateChanged { issue, .. }
            | WebhookEvent::Signal { issue, .. } => issue,
        }
    }
}

/// Directional signals flowing from the tracker side toward a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentSignal {
    Start,
    Stop { reason: Option<String> },
    Feedback {
        message: String,
        attachments: Option<Vec<Attachment>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_sequence_is_monotonic() {
        let mut session = Session::new(
            "ISSUE-1",
            "repo-1",
            PathBuf::from("/tmp/work"),
            ProcedureState::new("simple-question", vec!["question-investigation".into()]),
        );
        session.push_activity(ActivityKind::Text {
            content: "first".into(),
        });
        session.push_activity(ActivityKind::Text {
            content: "second".into(),
        });
        assert_eq!(session.activities[0].sequence, 0);
        assert_eq!(session.activities[1].sequence, 1);
    }

    #[test]
    fn procedure_advance_is_non_decreasing() {
        let mut state = ProcedureState::new("doc-edit", vec!["a".into(), "b".into()]);
        assert_eq!(state.current_index, 0);
        state.advance();
        assert_eq!(state.current_index, 1);
        assert!(!state.is_complete());
        state.advance();
        assert!(state.is_complete());
    }

    #[test]
    fn validation_loop_passes_before_max() {
        let mut vl = ValidationLoopState::new(4);
        assert!(vl.record(false, "nope".into(), false));
        assert_eq!(vl.iteration, 2);
        assert!(!vl.record(true, "ok".into(), false));
        assert_eq!(vl.outcome, ValidationOutcome::Passed);
    }

    #[test]
    fn validation_loop_fails_at_max_without_continue() {
        let mut vl = ValidationLoopState::new(2);
        assert!(vl.record(false, "nope".into(), false));
        assert!(!vl.record(false, "still nope".into(), false));
        assert_eq!(vl.outcome, ValidationOutcome::FailedMaxRetries);
    }

    #[test]
    fn label_match_is_case_insensitive() {
        let issue = Issue {
            id: "1".into(),
            identifier: "TEAM-1".into(),
            repository_id: "repo-1".into(),
            title: "t".into(),
            description: String::new(),
            state: "open".into(),
            labels: vec!["Bug".into()],
            comments: vec![],
            priority: None,
            url: None,
        };
        assert!(issue.has_label("bug"));
        assert!(!issue.has_label("feature"));
    }
}
