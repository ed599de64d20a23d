//! External collaborator contracts (§6). The core depends only on these
//! traits; concrete trackers, agents, renderers, and storage backends live
//! outside this crate and are injected at construction time (teacher's
//! `ProviderExecutor` seam, generalized to four contracts instead of one).

mod agent_runner;
mod issue_tracker;
mod renderer;
mod storage;

pub use agent_runner::{AgentEvent, AgentRunner, CompletionSummary, SessionHandle};
pub use issue_tracker::{IssueEvent, IssueTracker, Label, Member};
pub use renderer::{Renderer, RendererSignal};
pub use storage::SessionStorage;
