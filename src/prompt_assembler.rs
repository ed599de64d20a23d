//! Deterministic prompt composition (§4.3). A pure function of its inputs:
//! identical inputs produce identical output strings, tested by string
//! equality (§8 round-trip laws). Grounded on the teacher's
//! `providers/claude_code.rs` prompt-building functions (boundary-reminder
//! text per role), generalized into ordered, named sections.

use crate::model::{Attachment, Comment, Issue, Session};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    NewAssignment,
    NewStreaming,
    Continuation,
    Fallback,
}

pub struct PromptInputs<'a> {
    pub kind: PromptKind,
    pub session: &'a Session,
    pub issue: &'a Issue,
    pub subroutine: &'a str,
    pub subroutine_body: &'a str,
    pub user_comment: Option<&'a str>,
    pub attachments: Option<&'a [Attachment]>,
    pub repository_working_dir: &'a str,
    pub repository_base_branch: &'a str,
    /// Repository config mapping label name (case-insensitive) -> plugin paths.
    pub label_plugins: &'a HashMap<String, Vec<String>>,
}

pub struct AssembledPrompt {
    pub user_prompt: String,
    pub system_prompt: String,
    /// Recognized components used, for test assertion (§4.3).
    pub components_used: Vec<&'static str>,
    /// Deduplicated, active plugin paths from the issue's labels.
    pub plugin_paths: Vec<String>,
}

pub struct PromptAssembler;

impl PromptAssembler {
    /// Assembles the user+system prompt pair per §4.3's component order and
    /// prompt-type selection rules.
    pub fn assemble(inputs: &PromptInputs<'_>) -> AssembledPrompt {
        let mut components_used = Vec::new();
        let user_prompt = match inputs.kind {
            PromptKind::Continuation => {
                components_used.push("user_comment");
                Self::continuation_prompt(inputs, &mut components_used)
            }
            PromptKind::NewAssignment | PromptKind::NewStreaming | PromptKind::Fallback => {
                Self::full_context_prompt(inputs, &mut components_used)
            }
        };

        let system_prompt = match inputs.kind {
            PromptKind::Continuation => String::new(),
            _ => Self::system_prompt(inputs, &mut components_used),
        };

        AssembledPrompt {
            user_prompt,
            system_prompt,
            components_used,
            plugin_paths: Self::resolve_plugins(inputs.issue, inputs.label_plugins),
        }
    }

    fn full_context_prompt(inputs: &PromptInputs<'_>, components_used: &mut Vec<&'static str>) -> String {
        let mut sections = Vec::new();

        components_used.push("context");
        sections.push(format!(
            "<context>\nrepository: {}\nworking_directory: {}\nbase_branch: {}\n</context>",
            inputs.session.repository_id, inputs.repository_working_dir, inputs.repository_base_branch
        ));

        components_used.push("linear_issue");
        sections.push(render_issue_section(inputs.issue));

        components_used.push("linear_comments");
        sections.push(render_comments_section(&inputs.issue.comments));

        components_used.push("subroutine_body");
        sections.push(format!(
            "<subroutine name=\"{}\">\n{}\n</subroutine>",
            inputs.subroutine, inputs.subroutine_body
        ));

        if matches!(inputs.kind, PromptKind::NewStreaming) {
            components_used.push("invitation_turn");
            sections.push(
                "<invitation>\nYou may begin working now. Respond with your first action.\n</invitation>"
                    .to_string(),
            );
        }

        if let Some(attachments) = inputs.attachments {
            if !attachments.is_empty() {
                components_used.push("attachment_manifest");
                sections.push(render_attachment_manifest(attachments));
            }
        }

        sections.join("\n\n")
    }

    fn continuation_prompt(inputs: &PromptInputs<'_>, components_used: &mut Vec<&'static str>) -> String {
        let mut sections = Vec::new();
        if let Some(comment) = inputs.user_comment {
            sections.push(comment.to_string());
        }
        if let Some(attachments) = inputs.attachments {
            if !attachments.is_empty() {
                components_used.push("attachment_manifest");
                sections.push(render_attachment_manifest(attachments));
            }
        }
        sections.join("\n\n")
    }

    fn system_prompt(inputs: &PromptInputs<'_>, components_used: &mut Vec<&'static str>) -> String {
        components_used.push("task_management_block");
        components_used.push("situation_assessment_block");
        components_used.push("execution_instructions_block");

        let mut prompt = String::new();
        prompt.push_str(
            "You are an autonomous coding agent operating inside a managed session.\n\
             Track your own task list; report progress through tool calls and text.\n",
        );
        prompt.push_str(&format!(
            "\nCurrent subroutine: {}. Issue: {} ({}).\n",
            inputs.subroutine, inputs.issue.identifier, inputs.issue.title
        ));
        prompt.push_str(
            "\nExecute the subroutine to completion, then emit a completion event summarizing \
             turns taken, tools used, and files modified.\n",
        );

        if let Some(extension) = subroutine_extension(inputs.subroutine) {
            components_used.push("subroutine_extension");
            prompt.push_str("\n");
            prompt.push_str(extension);
            prompt.push('\n');
        }

        prompt
    }

    fn resolve_plugins(issue: &Issue, label_plugins: &HashMap<String, Vec<String>>) -> Vec<String> {
        let mut resolved = BTreeSet::new();
        for label in &issue.labels {
            let lower = label.to_lowercase();
            for (configured_label, paths) in label_plugins {
                if configured_label.to_lowercase() == lower {
                    for path in paths {
                        resolved.insert(path.clone());
                    }
                }
            }
        }
        resolved.into_iter().collect()
    }
}

fn render_issue_section(issue: &Issue) -> String {
    format!(
        "<linear_issue>\nid: {}\nidentifier: {}\ntitle: {}\ndescription: {}\nstate: {}\npriority: {}\nurl: {}\n</linear_issue>",
        issue.id,
        issue.identifier,
        issue.title,
        issue.description,
        issue.state,
        issue.priority.as_deref().unwrap_or("none"),
        issue.url.as_deref().unwrap_or("none"),
    )
}

fn render_comments_section(comments: &[Comment]) -> String {
    if comments.is_empty() {
        return "<linear_comments>\nNo comments yet.\n</linear_comments>".to_string();
    }
    let mut body = String::from("<linear_comments>\n");
    for comment in comments {
        body.push_str(&format!("- {} ({}): {}\n", comment.author, comment.created_at, comment.body));
    }
    body.push_str("</linear_comments>");
    body
}

fn render_attachment_manifest(attachments: &[Attachment]) -> String {
    let mut body = String::from("<attachments>\n");
    for (i, attachment) in attachments.iter().enumerate() {
        body.push_str(&format!(
            "{}. {} ({}, {} bytes) -> {}\n",
            i + 1,
            attachment.url,
            attachment.mime_type,
            attachment.size_bytes,
            attachment.local_path.display()
        ));
    }
    body.push_str("</attachments>");
    body
}

fn subroutine_extension(subroutine: &str) -> Option<&'static str> {
    match subroutine {
        "verifications" => Some("Run the project's test suite and linters; do not proceed on failure."),
        "git-commit" => Some("Commit your changes with a descriptive message; do not push."),
        "gh-pr" => Some("Open a pull request summarizing the change set."),
        "changelog-update" => Some("Append an entry to the changelog describing this change."),
        _ => None,
    }
}
