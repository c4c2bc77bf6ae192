//! Eligibility and transition-validity gates (C6). The `Approver` collaborator
//! itself lives in [`crate::interfaces`] since it is an external party, not a
//! table the engine owns.

use crate::error::PolicyError;
use crate::state_machine::{State, StateMachine};
use std::collections::{HashMap, HashSet};

/// Per-state tool eligibility, checked before any tool dispatch.
pub trait Eligibility: Send + Sync {
    fn is_allowed(&self, state: State, tool_name: &str) -> bool;
}

/// Table-backed default eligibility gate: a plain `state -> set<tool>` map,
/// mirroring how the teacher's `PolicyGate` is just a table the engine
/// interprets rather than a dispatch hierarchy.
#[derive(Debug, Clone, Default)]
pub struct EligibilityTable {
    allowed: HashMap<State, HashSet<String>>,
}

impl EligibilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, state: State, tool_name: impl Into<String>) -> Self {
        self.allowed.entry(state).or_default().insert(tool_name.into());
        self
    }
}

impl Eligibility for EligibilityTable {
    fn is_allowed(&self, state: State, tool_name: &str) -> bool {
        self.allowed
            .get(&state)
            .map(|set| set.contains(tool_name))
            .unwrap_or(false)
    }
}

/// Transition validity, layered on top of [`StateMachine`]'s table so it can
/// be reconfigured independently of a running machine instance.
pub trait TransitionPolicy: Send + Sync {
    fn is_valid(&self, from: State, to: State) -> bool;
}

impl TransitionPolicy for StateMachine {
    fn is_valid(&self, from: State, to: State) -> bool {
        self.is_valid_transition(from, to)
    }
}

/// Checks a requested transition against a [`TransitionPolicy`], returning
/// the spec's `InvalidTransition` error kind on rejection.
pub fn check_transition(
    policy: &dyn TransitionPolicy,
    from: State,
    to: State,
) -> Result<(), PolicyError> {
    if policy.is_valid(from, to) {
        Ok(())
    } else {
        Err(PolicyError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Checks tool eligibility, returning the spec's `NotEligible` error kind on
/// rejection.
pub fn check_eligibility(
    eligibility: &dyn Eligibility,
    state: State,
    tool_name: &str,
) -> Result<(), PolicyError> {
    if eligibility.is_allowed(state, tool_name) {
        Ok(())
    } else {
        Err(PolicyError::NotEligible {
            state: state.to_string(),
            tool_name: tool_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_table_only_allows_registered_pairs() {
        let table = EligibilityTable::new().allow(State::Explore, "read_file");
        assert!(table.is_allowed(State::Explore, "read_file"));
        assert!(!table.is_allowed(State::Intake, "read_file"));
        assert!(!table.is_allowed(State::Explore, "write_file"));
    }

    #[test]
    fn check_eligibility_surfaces_not_eligible() {
        let table = EligibilityTable::new().allow(State::Explore, "read_file");
        assert!(check_eligibility(&table, State::Explore, "read_file").is_ok());
        let err = check_eligibility(&table, State::Intake, "read_file").unwrap_err();
        assert!(matches!(err, PolicyError::NotEligible { .. }));
    }

    #[test]
    fn check_transition_surfaces_invalid_transition() {
        let machine = StateMachine::new();
        assert!(check_transition(&machine, State::Intake, State::Explore).is_ok());
        let err = check_transition(&machine, State::Intake, State::Act).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidTransition { .. }));
    }
}
