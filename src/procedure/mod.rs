//! Procedure/subroutine state machine (§4.5). Grounded on the teacher's
//! `orchestrator/mod.rs` task-queue stepping logic, generalized from a
//! single task queue into named subroutine presets with per-subroutine
//! validation loops.

pub mod orchestrator_graph;

use crate::model::{ProcedureState, SubroutineUnit, ValidationLoopState};

/// Named procedure presets (§4.5). The orchestrator procedure launches one
/// of these per task in a sub-issue graph rather than being a preset
/// itself — `Verification` is the single-subroutine procedure it assigns
/// to `verify` tasks, `FullDevelopment` the one it assigns to `impl` tasks
/// (see `orchestrator_graph` and `crate::orchestrator_supervisor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    SimpleQuestion,
    DocEdit,
    FullDevelopment,
    Debugger,
    Verification,
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::SimpleQuestion => "simple-question",
            Procedure::DocEdit => "doc-edit",
            Procedure::FullDevelopment => "full-development",
            Procedure::Debugger => "debugger",
            Procedure::Verification => "verification",
        }
    }

    /// Procedure steps in order. Most steps are a single subroutine; the
    /// debugger's three reproduce attempts run concurrently and are joined
    /// before the procedure advances to `fix` (§4.5).
    pub fn subroutine_units(&self) -> Vec<SubroutineUnit> {
        match self {
            Procedure::SimpleQuestion => vec![
                SubroutineUnit::from("question-investigation"),
                SubroutineUnit::from("question-answer"),
            ],
            Procedure::DocEdit => vec![
                SubroutineUnit::from("doc-implementation"),
                SubroutineUnit::from("concise-summary"),
            ],
            Procedure::FullDevelopment => vec![
                SubroutineUnit::from("coding-activity"),
                SubroutineUnit::from("verifications"),
                SubroutineUnit::from("changelog-update"),
                SubroutineUnit::from("git-commit"),
                SubroutineUnit::from("gh-pr"),
                SubroutineUnit::from("concise-summary"),
            ],
            Procedure::Debugger => vec![
                SubroutineUnit::Parallel(vec![
                    "reproduce-1".to_string(),
                    "reproduce-2".to_string(),
                    "reproduce-3".to_string(),
                ]),
                SubroutineUnit::from("fix"),
                SubroutineUnit::from("verifications"),
                SubroutineUnit::from("git-commit"),
                SubroutineUnit::from("concise-summary"),
            ],
            Procedure::Verification => vec![SubroutineUnit::from("verifications")],
        }
    }

    /// Flattened subroutine names, in step order, for callers that only
    /// care about identity/membership rather than grouping (e.g. progress
    /// display, `is_validated` lookups).
    pub fn subroutines(&self) -> Vec<String> {
        self.subroutine_units()
            .iter()
            .flat_map(|unit| unit.members())
            .map(String::from)
            .collect()
    }

    /// Subroutines whose outcome must be judged by a separate validator run
    /// before the procedure may advance (§4.5).
    pub fn is_validated(subroutine: &str) -> bool {
        matches!(subroutine, "verifications" | "coding-activity" | "fix")
    }

    pub fn initial_state(&self) -> ProcedureState {
        ProcedureState::new(self.name(), self.subroutine_units())
    }
}

/// Outcome of stepping the engine once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Still on the same subroutine, awaiting more validation iterations.
    AwaitingValidation,
    /// Advanced to the next subroutine (or completed, if none remain).
    Advanced,
    /// The subroutine's validation exhausted retries and
    /// `continueOnMaxRetries=false`; the procedure (and its session) fails.
    Failed,
}

pub struct ValidatorVerdict {
    pub pass: bool,
    pub reason: String,
}

/// Stateless stepping logic over a `ProcedureState` (state lives on the
/// `Session`; this is pure transition logic so it is trivially testable).
pub struct ProcedureEngine;

impl ProcedureEngine {
    /// Applies one subroutine completion event: a non-validated subroutine
    /// advances immediately; a validated one records `verdict` into its
    /// `ValidationLoopState` and advances only on pass or exhausted-with-continue.
    pub fn complete_subroutine(
        state: &mut ProcedureState,
        max_iterations: u32,
        continue_on_max_retries: bool,
        verdict: Option<ValidatorVerdict>,
    ) -> StepOutcome {
        let Some(subroutine) = state.current_subroutine().map(String::from) else {
            return StepOutcome::Advanced;
        };

        if !Procedure::is_validated(&subroutine) {
            state.advance();
            return StepOutcome::Advanced;
        }

        let verdict = verdict.unwrap_or(ValidatorVerdict {
            pass: true,
            reason: "no validator configured".into(),
        });

        let loop_state = state
            .validation
            .entry(subroutine.clone())
            .or_insert_with(|| ValidationLoopState::new(max_iterations));

        let should_continue_iterating = loop_state.record(verdict.pass, verdict.reason, continue_on_max_retries);

        if should_continue_iterating {
            return StepOutcome::AwaitingValidation;
        }

        match loop_state.outcome {
            crate::model::ValidationOutcome::Passed => {
                state.advance();
                StepOutcome::Advanced
            }
            crate::model::ValidationOutcome::FailedMaxRetries => {
                if continue_on_max_retries {
                    state.advance();
                    StepOutcome::Advanced
                } else {
                    StepOutcome::Failed
                }
            }
            crate::model::ValidationOutcome::InProgress => StepOutcome::AwaitingValidation,
        }
    }

    /// Advances past a completed parallel group. None of the debugger's
    /// reproduce attempts are validated subroutines (§4.5), so there is no
    /// per-member retry loop to run here — once every member has reported
    /// in, the procedure simply moves to the next step.
    pub fn complete_parallel_group(state: &mut ProcedureState) -> StepOutcome {
        state.advance();
        StepOutcome::Advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_development_lists_expected_subroutines() {
        let subs = Procedure::FullDevelopment.subroutines();
        assert_eq!(
            subs,
            vec![
                "coding-activity",
                "verifications",
                "changelog-update",
                "git-commit",
                "gh-pr",
                "concise-summary",
            ]
        );
    }

    #[test]
    fn debugger_groups_reproduce_attempts_in_parallel() {
        let units = Procedure::Debugger.subroutine_units();
        assert_eq!(
            units[0],
            SubroutineUnit::Parallel(vec![
                "reproduce-1".to_string(),
                "reproduce-2".to_string(),
                "reproduce-3".to_string(),
            ])
        );
        assert_eq!(units[1], SubroutineUnit::from("fix"));
        // flattened view still exposes every member by name, in order.
        let subs = Procedure::Debugger.subroutines();
        assert_eq!(
            subs,
            vec!["reproduce-1", "reproduce-2", "reproduce-3", "fix", "verifications", "git-commit", "concise-summary"]
        );
    }

    #[test]
    fn completing_a_parallel_group_advances_past_it() {
        let mut state = Procedure::Debugger.initial_state();
        assert_eq!(state.current_index, 0);
        let outcome = ProcedureEngine::complete_parallel_group(&mut state);
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.current_index, 1);
        assert_eq!(state.current_subroutine(), Some("fix"));
    }

    #[test]
    fn unvalidated_subroutine_advances_immediately() {
        let mut state = Procedure::DocEdit.initial_state();
        let outcome = ProcedureEngine::complete_subroutine(&mut state, 4, false, None);
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.current_index, 1);
    }

    #[test]
    fn validated_subroutine_retries_then_advances_on_iteration_four() {
        let mut state = Procedure::FullDevelopment.initial_state();
        // coding-activity is validated; fail three times, pass on the fourth.
        for _ in 0..3 {
            let outcome = ProcedureEngine::complete_subroutine(
                &mut state,
                4,
                false,
                Some(ValidatorVerdict {
                    pass: false,
                    reason: "not yet".into(),
                }),
            );
            assert_eq!(outcome, StepOutcome::AwaitingValidation);
        }
        assert_eq!(state.current_index, 0);

        let outcome = ProcedureEngine::complete_subroutine(
            &mut state,
            4,
            false,
            Some(ValidatorVerdict {
                pass: true,
                reason: "looks good".into(),
            }),
        );
        assert_eq!(outcome, StepOutcome::Advanced);
        assert_eq!(state.current_index, 1);
    }

    #[test]
    fn exhausted_validation_without_continue_fails() {
        let mut state = Procedure::FullDevelopment.initial_state();
        let mut last = StepOutcome::AwaitingValidation;
        for _ in 0..2 {
            last = ProcedureEngine::complete_subroutine(
                &mut state,
                2,
                false,
                Some(ValidatorVerdict {
                    pass: false,
                    reason: "nope".into(),
                }),
            );
        }
        assert_eq!(last, StepOutcome::Failed);
        assert_eq!(state.current_index, 0);
    }

    #[test]
    fn exhausted_validation_with_continue_advances() {
        let mut state = Procedure::FullDevelopment.initial_state();
        let mut last = StepOutcome::AwaitingValidation;
        for _ in 0..2 {
            last = ProcedureEngine::complete_subroutine(
                &mut state,
                2,
                true,
                Some(ValidatorVerdict {
                    pass: false,
                    reason: "nope".into(),
                }),
            );
        }
        assert_eq!(last, StepOutcome::Advanced);
        assert_eq!(state.current_index, 1);
    }
}
