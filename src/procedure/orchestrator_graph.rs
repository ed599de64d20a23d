//! §4.5.2 Orchestrator procedure: builds a DAG of `{impl, verify}` task
//! pairs from a set of sub-issues with optional `dependsOn` references, and
//! tracks which tasks are unblocked for launch. Grounded on the teacher's
//! `orchestrator/mod.rs` task queue (`async_channel::bounded` admission),
//! generalized into an explicit dependency graph instead of a flat queue.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Impl,
    Verify,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub sub_issue_id: String,
    pub kind: TaskKind,
}

#[derive(Debug, Clone)]
pub struct SubIssueSpec {
    pub id: String,
    pub depends_on: Vec<String>,
}

/// A DAG of `impl`/`verify` task pairs, one pair per sub-issue.
/// `verify_i` always depends on `impl_i`; `impl_j` depends on `verify_i`
/// iff sub-issue `j` declares `dependsOn` referencing sub-issue `i`.
/// Unknown dependency ids are silently ignored (§4.5.2).
pub struct OrchestratorGraph {
    dependencies: HashMap<TaskId, Vec<TaskId>>,
    completed: HashSet<TaskId>,
}

impl OrchestratorGraph {
    pub fn build(sub_issues: &[SubIssueSpec]) -> Self {
        let known_ids: HashSet<&str> = sub_issues.iter().map(|s| s.id.as_str()).collect();
        let mut dependencies = HashMap::new();

        for sub_issue in sub_issues {
            let impl_task = TaskId {
                sub_issue_id: sub_issue.id.clone(),
                kind: TaskKind::Impl,
            };
            let verify_task = TaskId {
                sub_issue_id: sub_issue.id.clone(),
                kind: TaskKind::Verify,
            };

            let impl_deps: Vec<TaskId> = sub_issue
                .depends_on
                .iter()
                .filter(|dep| known_ids.contains(dep.as_str()))
                .map(|dep| TaskId {
                    sub_issue_id: dep.clone(),
                    kind: TaskKind::Verify,
                })
                .collect();

            dependencies.insert(impl_task.clone(), impl_deps);
            dependencies.insert(verify_task, vec![impl_task]);
        }

        Self {
            dependencies,
            completed: HashSet::new(),
        }
    }

    /// Tasks whose dependencies are all completed and that are not
    /// themselves already completed.
    pub fn unblocked_tasks(&self) -> Vec<TaskId> {
        self.dependencies
            .keys()
            .filter(|task| !self.completed.contains(task))
            .filter(|task| {
                self.dependencies[task]
                    .iter()
                    .all(|dep| self.completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    pub fn mark_completed(&mut self, task: TaskId) {
        self.completed.insert(task);
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.dependencies.len()
    }
}
