//! Orchestrator procedure execution (§4.5.2): launches an independent
//! child session per unblocked task in an `OrchestratorGraph`, gating
//! further launches on each task's result. Grounded on the same
//! `SessionManager::start_session` admission path every other session
//! uses — the graph only decides *when* to call it, not how a session
//! runs once launched.

use crate::procedure::orchestrator_graph::{OrchestratorGraph, SubIssueSpec, TaskId, TaskKind};
use crate::procedure::Procedure;
use crate::session_manager::SessionManager;
use crate::session_supervisor::SupervisorOutcome;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs one orchestrator procedure to completion: builds a task graph from
/// `sub_issues`, launches every initially-unblocked task, and launches more
/// as each completed task's dependents unblock, until the graph is done or
/// a task fails.
pub struct OrchestratorSupervisor {
    parent_issue_id: String,
    repository_id: String,
    working_directory: PathBuf,
    manager: Arc<SessionManager>,
    graph: OrchestratorGraph,
}

impl OrchestratorSupervisor {
    pub fn new(
        parent_issue_id: String,
        repository_id: String,
        working_directory: PathBuf,
        manager: Arc<SessionManager>,
        sub_issues: &[SubIssueSpec],
    ) -> Self {
        Self {
            parent_issue_id,
            repository_id,
            working_directory,
            manager,
            graph: OrchestratorGraph::build(sub_issues),
        }
    }

    /// The synthetic issue id a task's child session is tracked under:
    /// `<parent>::<sub-issue>::<impl|verify>`.
    fn child_issue_id(&self, task: &TaskId) -> String {
        child_issue_id(&self.parent_issue_id, task)
    }

    fn procedure_for(kind: TaskKind) -> Procedure {
        match kind {
            TaskKind::Impl => Procedure::FullDevelopment,
            TaskKind::Verify => Procedure::Verification,
        }
    }

    /// Drives the graph to completion. Returns `Err` with the first task
    /// failure or cancellation encountered; sibling tasks already launched
    /// are left running (the manager's own shutdown path tears them down).
    pub async fn run(mut self) -> Result<(), String> {
        let mut outcomes = self.manager.subscribe_outcomes();
        let mut launched: HashMap<String, TaskId> = HashMap::new();

        loop {
            if self.graph.is_complete() {
                return Ok(());
            }

            for task in self.graph.unblocked_tasks() {
                let child_issue_id = self.child_issue_id(&task);
                if launched.contains_key(&child_issue_id) {
                    continue;
                }
                let procedure = Self::procedure_for(task.kind);
                info!(
                    parent = %self.parent_issue_id,
                    task = %child_issue_id,
                    procedure = procedure.name(),
                    "launching orchestrator task"
                );
                if let Err(e) = self
                    .manager
                    .start_session(
                        child_issue_id.clone(),
                        self.repository_id.clone(),
                        self.working_directory.clone(),
                        procedure,
                    )
                    .await
                {
                    warn!(parent = %self.parent_issue_id, task = %child_issue_id, error = %e, "failed to launch orchestrator task");
                    continue;
                }
                launched.insert(child_issue_id, task);
            }

            match outcomes.recv().await {
                Ok(SupervisorOutcome::Completed { issue_id, .. }) => {
                    if let Some(task) = launched.remove(&issue_id) {
                        self.graph.mark_completed(task);
                    }
                }
                Ok(SupervisorOutcome::Failed { issue_id, error, .. }) => {
                    if launched.contains_key(&issue_id) {
                        return Err(format!("orchestrator task {} failed: {}", issue_id, error));
                    }
                }
                Ok(SupervisorOutcome::Canceled { issue_id, .. }) => {
                    if launched.contains_key(&issue_id) {
                        return Err(format!("orchestrator task {} canceled", issue_id));
                    }
                }
                Ok(SupervisorOutcome::Started { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "orchestrator outcome broadcast lagged; rechecking unblocked tasks");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err("session manager shut down before orchestrator completed".into());
                }
            }
        }
    }
}

fn child_issue_id(parent_issue_id: &str, task: &TaskId) -> String {
    let kind = match task.kind {
        TaskKind::Impl => "impl",
        TaskKind::Verify => "verify",
    };
    format!("{}::{}::{}", parent_issue_id, task.sub_issue_id, kind)
}
