//! Canonical run lifecycle: a closed set of states, a transition table, and
//! per-state tool eligibility. Encoded as data (a table), not subclasses.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One of the canonical states a run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Intake,
    Explore,
    Decide,
    Act,
    Validate,
    Done,
    Failed,
}

impl State {
    /// Every state in the closed enum, leaves-last, for callers that need
    /// to enumerate eligibility across the whole lifecycle.
    pub const ALL: [State; 7] = [
        State::Intake,
        State::Explore,
        State::Decide,
        State::Act,
        State::Validate,
        State::Done,
        State::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The state machine for one run: transition table plus per-state tool
/// eligibility. Transitions reject self-loops — they are not real
/// transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: State,
    valid_transitions: HashMap<State, Vec<State>>,
    allowed_tools: HashMap<State, HashSet<String>>,
}

impl StateMachine {
    /// Builds the default transition table described in the spec: a cycle
    /// back to `Explore` from `Validate`, and every non-terminal state able
    /// to reach `Failed`.
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();
        valid_transitions.insert(State::Intake, vec![State::Explore, State::Failed]);
        valid_transitions.insert(
            State::Explore,
            vec![State::Decide, State::Explore, State::Failed],
        );
        valid_transitions.insert(State::Decide, vec![State::Act, State::Failed]);
        valid_transitions.insert(State::Act, vec![State::Validate, State::Failed]);
        valid_transitions.insert(
            State::Validate,
            vec![State::Explore, State::Done, State::Failed],
        );
        valid_transitions.insert(State::Done, vec![]);
        valid_transitions.insert(State::Failed, vec![]);

        Self {
            current: State::Intake,
            valid_transitions,
            allowed_tools: HashMap::new(),
        }
    }

    /// Overrides the transition table, e.g. for tests or runtime
    /// reconfiguration of eligibility.
    pub fn with_transitions(mut self, table: HashMap<State, Vec<State>>) -> Self {
        self.valid_transitions = table;
        self
    }

    pub fn with_allowed_tools(mut self, allowed_tools: HashMap<State, HashSet<String>>) -> Self {
        self.allowed_tools = allowed_tools;
        self
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Read-only view of tools eligible in the current state.
    pub fn allowed_tools(&self) -> HashSet<&str> {
        self.allowed_tools
            .get(&self.current)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_valid_transition(&self, from: State, to: State) -> bool {
        if from == to {
            return false;
        }
        self.valid_transitions
            .get(&from)
            .map(|transitions| transitions.contains(&to))
            .unwrap_or(false)
    }

    /// Validates and applies `(current, to)`. Leaves `current` untouched on
    /// failure.
    pub fn transition(&mut self, to: State) -> Result<(), PolicyError> {
        if !self.is_valid_transition(self.current, to) {
            return Err(PolicyError::InvalidTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        self.current = to;
        Ok(())
    }

    /// Restores `current` without re-running entry actions; used when
    /// resuming a paused run.
    pub fn resume_from(&mut self, state: State) {
        self.current = state;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_machine_starts_at_intake() {
        let machine = StateMachine::new();
        assert_eq!(machine.current(), State::Intake);
        assert!(!machine.is_terminal());
    }

    #[test]
    fn explore_to_validate_cycle_is_allowed() {
        let mut machine = StateMachine::new();
        machine.transition(State::Explore).unwrap();
        machine.transition(State::Decide).unwrap();
        machine.transition(State::Act).unwrap();
        machine.transition(State::Validate).unwrap();
        machine.transition(State::Explore).unwrap();
        assert_eq!(machine.current(), State::Explore);
    }

    #[test]
    fn every_non_terminal_state_can_reach_failed() {
        for state in [
            State::Intake,
            State::Explore,
            State::Decide,
            State::Act,
            State::Validate,
        ] {
            let mut machine = StateMachine::new().with_transitions({
                let mut table = HashMap::new();
                table.insert(state, vec![State::Failed]);
                table
            });
            machine.resume_from(state);
            assert!(machine.transition(State::Failed).is_ok(), "{state} -> Failed");
        }
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_is_unchanged() {
        let mut machine = StateMachine::new();
        assert!(machine.transition(State::Act).is_err());
        assert_eq!(machine.current(), State::Intake);
    }

    #[test]
    fn self_transitions_are_rejected_even_when_listed() {
        let mut machine = StateMachine::new();
        machine.resume_from(State::Explore);
        assert!(!machine.is_valid_transition(State::Explore, State::Explore));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let machine = StateMachine::new();
        assert!(!machine.is_valid_transition(State::Done, State::Explore));
        assert!(!machine.is_valid_transition(State::Failed, State::Explore));
    }

    #[test]
    fn allowed_tools_reflects_current_state() {
        let mut allowed = HashMap::new();
        let mut explore_tools = HashSet::new();
        explore_tools.insert("read_file".to_string());
        allowed.insert(State::Explore, explore_tools);

        let mut machine = StateMachine::new().with_allowed_tools(allowed);
        assert!(machine.allowed_tools().is_empty());
        machine.transition(State::Explore).unwrap();
        assert!(machine.allowed_tools().contains("read_file"));
    }
}
