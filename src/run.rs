//! The mutable state of one execution: status, current state, variables,
//! pending question, and evidence. Mutated only through the methods below,
//! matching the teacher crate's preference for owning types over bags of
//! public fields mutated ad hoc.

use crate::evidence::{Evidence, EvidenceLog};
use crate::ids::RunId;
use crate::state_machine::State;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Overall run status. Invariant R1: `status = Paused` iff a question is
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// A question raised to a human. Empty `options` means free-form input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub options: Vec<String>,
}

/// Risk classification of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum RiskLevel {
    None,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Metadata describing a tool's safety characteristics, read by the policy
/// gates and the resilient executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ToolAnnotations {
    pub read_only: bool,
    pub destructive: bool,
    pub idempotent: bool,
    pub cacheable: bool,
    pub risk_level: RiskLevel,
}

impl ToolAnnotations {
    /// A safe, side-effect-free, retryable default.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            destructive: false,
            idempotent: true,
            cacheable: true,
            risk_level: RiskLevel::None,
        }
    }

    /// Conservative defaults for a tool with side effects.
    pub fn destructive() -> Self {
        Self {
            read_only: false,
            destructive: true,
            idempotent: false,
            cacheable: false,
            risk_level: RiskLevel::High,
        }
    }
}

/// A planner's instruction to the engine for the current step. Dispatch is
/// by variant tag; there is no virtual "execute" method on a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decision {
    CallTool {
        tool_name: String,
        input: Bytes,
        reason: String,
    },
    Transition {
        to_state: State,
        reason: String,
    },
    AskHuman {
        question: String,
        options: Vec<String>,
    },
    Finish {
        result: Bytes,
        summary: String,
    },
    Fail {
        reason: String,
    },
}

/// The mutable state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub goal: String,
    pub current_state: State,
    pub status: RunStatus,
    pub vars: HashMap<String, serde_json::Value>,
    pub evidence: EvidenceLog,
    pub pending_question: Option<Question>,
    pub result: Option<Bytes>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, goal: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            goal: goal.into(),
            current_state: State::Intake,
            status: RunStatus::Pending,
            vars: HashMap::new(),
            evidence: EvidenceLog::new(),
            pending_question: None,
            result: None,
            error: None,
            start_time: now,
            end_time: None,
        }
    }

    /// Marks a freshly constructed run as actively executing.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn add_evidence(&mut self, evidence: Evidence) {
        self.evidence.append(evidence);
    }

    pub fn ask_human(&mut self, question: Question) {
        self.pending_question = Some(question);
        self.status = RunStatus::Paused;
    }

    /// Consumes the pending question and returns the run to `Running`.
    /// Invariant R1 requires callers to only do this once they have a
    /// response to append as evidence.
    pub fn clear_pending_question(&mut self) -> Option<Question> {
        let question = self.pending_question.take();
        self.status = RunStatus::Running;
        question
    }

    pub fn transition_to(&mut self, state: State) {
        self.current_state = state;
    }

    pub fn complete(&mut self, result: Bytes, now: DateTime<Utc>) {
        self.current_state = State::Done;
        self.status = RunStatus::Completed;
        self.result = Some(result);
        self.end_time = Some(now);
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.current_state = State::Failed;
        self.status = RunStatus::Failed;
        self.error = Some(reason.into());
        self.end_time = Some(now);
    }

    pub fn has_pending_question(&self) -> bool {
        self.pending_question.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SystemClock;

    fn new_run() -> Run {
        Run::new(RunId::new(&SystemClock), "test goal", Utc::now())
    }

    #[test]
    fn pending_question_invariant_holds_across_ask_and_clear() {
        let mut run = new_run();
        assert!(!run.has_pending_question());
        assert_eq!(run.status, RunStatus::Pending);

        run.ask_human(Question {
            text: "Which?".into(),
            options: vec!["A".into(), "B".into()],
        });
        assert!(run.has_pending_question());
        assert_eq!(run.status, RunStatus::Paused);

        let question = run.clear_pending_question().unwrap();
        assert_eq!(question.text, "Which?");
        assert!(!run.has_pending_question());
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn complete_and_fail_set_terminal_state() {
        let mut run = new_run();
        run.complete(Bytes::from_static(b"done"), Utc::now());
        assert_eq!(run.current_state, State::Done);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.end_time.is_some());

        let mut run = new_run();
        run.fail("boom", Utc::now());
        assert_eq!(run.current_state, State::Failed);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }
}
