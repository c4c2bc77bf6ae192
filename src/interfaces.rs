//! Contracts for every collaborator the core consumes: planners, tools,
//! approvers, and optional stores. Each is an `async_trait` so concrete
//! adapters (LLM clients, vector databases, relational stores) can live in
//! separate crates without the core depending on them.

use crate::budget::BudgetSnapshot;
use crate::error::{EngineError, PlannerError, StorageError};
use crate::evidence::Evidence;
use crate::ids::RunId;
use crate::ledger::LedgerEntry;
use crate::run::{Decision, ToolAnnotations};
use crate::state_machine::State;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Everything a planner needs to make one decision, and nothing it could
/// use to perform a side effect. Planners are side-effect-free by
/// contract; only the core writes to any store.
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub run_id: &'a RunId,
    pub current_state: State,
    pub evidence: &'a [Evidence],
    pub allowed_tools: Vec<&'a str>,
    pub budgets: BudgetSnapshot,
    pub vars: &'a HashMap<String, serde_json::Value>,
}

/// Proposes the next [`Decision`] for a run. May block; must honor
/// cancellation via the ambient `tokio` task's own cancellation handling.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<Decision, PlannerError>;
}

/// Outcome of a single tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub output: Bytes,
    pub metadata: HashMap<String, String>,
    pub duration: Duration,
    pub cached: bool,
}

/// A single callable capability. Implementations must honor the passed
/// `CancellationToken` promptly.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn annotations(&self) -> ToolAnnotations;

    async fn execute(
        &self,
        cancellation: tokio_util::sync::CancellationToken,
        input: Bytes,
    ) -> Result<ToolOutcome, EngineError>;
}

/// Read-mostly lookup of registered tools. Mutation, if supported, must be
/// externally synchronized by the implementation.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Tool>>;
    fn list(&self) -> Vec<std::sync::Arc<dyn Tool>>;
}

/// A request for human/system sign-off before a risky tool call proceeds.
#[derive(Debug, Clone)]
pub struct ApprovalRequest<'a> {
    pub run_id: &'a RunId,
    pub tool_name: &'a str,
    pub input: &'a Bytes,
    pub annotations: ToolAnnotations,
    pub reason: &'a str,
}

/// Called only for tools meeting the risk predicate (destructive or
/// `risk_level >= High`). May block.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, request: ApprovalRequest<'_>) -> Result<bool, EngineError>;
}

/// Batch-append support for durable ledgers. Absence must degrade
/// gracefully to the in-memory [`crate::ledger::Ledger`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entries: &[LedgerEntry]) -> Result<(), StorageError>;
}

/// Durable event stream, independent of the ledger's in-memory default.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, run_id: &RunId, events: &[crate::events::Event]) -> Result<(), StorageError>;
    async fn load_events(&self, run_id: &RunId) -> Result<Vec<crate::events::Event>, StorageError>;
    async fn load_events_from(
        &self,
        run_id: &RunId,
        seq: u64,
    ) -> Result<Vec<crate::events::Event>, StorageError>;

    /// Live feed of events appended for `run_id` from this point on, for
    /// UIs and telemetry following a run in progress. Best-effort: a slow
    /// subscriber can lag and miss events (`RecvError::Lagged`); callers
    /// that need a gap-free history should fall back to `load_events_from`.
    async fn subscribe(
        &self,
        run_id: &RunId,
    ) -> Result<tokio::sync::broadcast::Receiver<crate::events::Event>, StorageError>;
}

/// Enables pausing a run across process boundaries.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn snapshot(&self, run: &crate::run::Run) -> Result<(), StorageError>;
    async fn load(&self, run_id: &RunId) -> Result<Option<crate::run::Run>, StorageError>;
}

/// A stable handle to a large tool output stored out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRef(pub String);

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, bytes: Bytes) -> Result<ArtifactRef, StorageError>;
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes, StorageError>;
}

/// Keyed by `(tool_name, canonical(input))`, governed by
/// `annotations.cacheable`.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;
    async fn put(&self, key: &str, value: Bytes);
}

/// Opaque to the core; exposed only to tools. The engine never calls this
/// trait directly.
pub trait KnowledgeStore: Send + Sync {}
