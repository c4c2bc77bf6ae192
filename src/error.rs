//! Error taxonomy for the orchestration engine.
//!
//! One umbrella [`EngineError`] aggregates per-subsystem error enums via
//! `#[from]`, so call sites can propagate with `?` while callers can still
//! match on the specific subsystem that failed.

use crate::ids::RunId;
use std::time::Duration;
use thiserror::Error;

/// Top-level error returned by the engine and its collaborators.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("control flow: {0}")]
    ControlFlow(#[from] ControlFlowError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Eligibility, approval, transition, and budget gates.
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("tool {tool_name:?} is not eligible in state {state:?}")]
    NotEligible { state: String, tool_name: String },

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("budget {name:?} exceeded: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        name: String,
        requested: u64,
        remaining: u64,
    },

    #[error("approval denied for tool {tool_name:?}: {reason}")]
    ApprovalDenied { tool_name: String, reason: String },

    #[error("approver unavailable: {0}")]
    ApprovalError(String),
}

/// Failures from the bulkhead/timeout/circuit-breaker/retry wrapper.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit open for {tool_name:?}")]
    CircuitOpen { tool_name: String },

    #[error("bulkhead full: {max_concurrent} concurrent executions already in flight")]
    BulkheadFull { max_concurrent: usize },

    #[error("underlying tool failed: {0}")]
    ToolFailed(String),
}

/// Append-only ledger/evidence failures.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("ledger store unavailable for run {run_id}: {reason}")]
    StoreUnavailable { run_id: RunId, reason: String },

    #[error("non-dense sequence for run {run_id}: expected {expected}, got {got}")]
    SequenceGap {
        run_id: RunId,
        expected: u64,
        got: u64,
    },
}

/// Errors surfaced by a `Planner` implementation.
#[derive(Error, Debug, Clone)]
pub enum PlannerError {
    #[error("planner failed: {0}")]
    Failed(String),

    #[error("planner returned an unknown decision type: {0}")]
    UnknownDecisionType(String),
}

/// Sentinels and bookkeeping errors around the step loop's control flow.
#[derive(Error, Debug, Clone)]
pub enum ControlFlowError {
    #[error("run is awaiting human input")]
    AwaitingHumanInput,

    #[error("exceeded max steps ({0})")]
    MaxStepsExceeded(u64),

    #[error("run was cancelled")]
    Cancelled,

    #[error("run has no pending question")]
    NoPendingQuestion,

    #[error("human input {input:?} is not one of the offered options {options:?}")]
    InvalidHumanInput {
        input: String,
        options: Vec<String>,
    },
}

/// Tool lookup/execution failures surfaced above the resilient executor.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool failed: {0}")]
    Failed(#[from] ResilienceError),
}

/// Failures from optional store collaborators.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
