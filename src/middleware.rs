//! Ordered, composable interceptor pipeline around tool calls.
//!
//! Middlewares do not hold back-references to the engine; the engine
//! assembles an [`ExecutionContext`] per call and passes it through the
//! chain by value, breaking the engine <-> middleware <-> context cycle.

use crate::budget::BudgetSnapshot;
use crate::error::{EngineError, PolicyError};
use crate::ids::RunId;
use crate::interfaces::{Approver, ApprovalRequest, Tool};
use crate::run::ToolAnnotations;
use crate::state_machine::State;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one tool-call middleware invocation needs; built fresh by the
/// engine for every call.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub current_state: State,
    pub tool: Arc<dyn Tool>,
    pub input: Bytes,
    pub reason: String,
    pub budget_snapshot: BudgetSnapshot,
    pub vars: HashMap<String, serde_json::Value>,
}

/// Outcome of running the chain: either the tool's output, or an error.
pub type ChainResult = Result<crate::interfaces::ToolOutcome, EngineError>;

/// The next link in the chain, invoked by a middleware that chooses to
/// proceed.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn Fn(ExecutionContext) -> futures::future::BoxFuture<'a, ChainResult> + Sync),
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: ExecutionContext) -> ChainResult {
        match self.middlewares.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    middlewares: rest,
                    terminal: self.terminal,
                };
                first.handle(ctx, next).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// One interceptor stage. Implementations call `next.run(ctx)` to proceed,
/// or short-circuit by returning an error without calling it.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: ExecutionContext, next: Next<'_>) -> ChainResult;
}

/// Stores middlewares in insertion order and folds them into one callable
/// chain whose terminal callee is the resilient executor invocation.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn push(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn run<'a, T>(&'a self, ctx: ExecutionContext, terminal: T) -> ChainResult
    where
        T: Fn(ExecutionContext) -> futures::future::BoxFuture<'a, ChainResult> + Sync + 'a,
    {
        let next = Next {
            middlewares: &self.middlewares,
            terminal: &terminal,
        };
        next.run(ctx).await
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Fails with `NotEligible` if the tool is not allowed in the current
/// state.
pub struct EligibilityMiddleware {
    pub eligibility: Arc<dyn crate::policy::Eligibility>,
}

#[async_trait]
impl Middleware for EligibilityMiddleware {
    async fn handle(&self, ctx: ExecutionContext, next: Next<'_>) -> ChainResult {
        crate::policy::check_eligibility(&*self.eligibility, ctx.current_state, ctx.tool.name())
            .map_err(EngineError::Policy)?;
        next.run(ctx).await
    }
}

/// The three ledger-worthy moments of an approval check, mirroring
/// [`LoggingEvent`]'s shape for the tool-call lifecycle.
#[derive(Debug, Clone, Copy)]
pub enum ApprovalEvent {
    Requested,
    Granted,
    Denied,
}

/// For destructive or high-risk tools, asks the [`Approver`]; fails with
/// `ApprovalDenied` on refusal. Tools that don't meet the risk predicate
/// never invoke the approver and never raise an `on_event` callback.
pub struct ApprovalMiddleware<F = fn(&str, ApprovalEvent)>
where
    F: Fn(&str, ApprovalEvent) + Send + Sync,
{
    pub approver: Arc<dyn Approver>,
    pub on_event: F,
}

impl ApprovalMiddleware<fn(&str, ApprovalEvent)> {
    /// An approval gate with no ledger-recording side effects, for callers
    /// (tests, ad hoc chains) that don't need `ApprovalRequested`/
    /// `ApprovalGranted`/`ApprovalDenied` ledger entries.
    pub fn silent(approver: Arc<dyn Approver>) -> Self {
        Self {
            approver,
            on_event: |_, _| {},
        }
    }
}

#[async_trait]
impl<F> Middleware for ApprovalMiddleware<F>
where
    F: Fn(&str, ApprovalEvent) + Send + Sync,
{
    async fn handle(&self, ctx: ExecutionContext, next: Next<'_>) -> ChainResult {
        let annotations = ctx.tool.annotations();
        let requires_approval =
            annotations.destructive || annotations.risk_level >= crate::run::RiskLevel::High;

        if requires_approval {
            let tool_name = ctx.tool.name().to_string();
            (self.on_event)(&tool_name, ApprovalEvent::Requested);
            let approved = self
                .approver
                .approve(ApprovalRequest {
                    run_id: &ctx.run_id,
                    tool_name: ctx.tool.name(),
                    input: &ctx.input,
                    annotations,
                    reason: &ctx.reason,
                })
                .await
                .map_err(|err| EngineError::Policy(PolicyError::ApprovalError(err.to_string())))?;
            if !approved {
                (self.on_event)(&tool_name, ApprovalEvent::Denied);
                return Err(EngineError::Policy(PolicyError::ApprovalDenied {
                    tool_name,
                    reason: "approver declined the request".to_string(),
                }));
            }
            (self.on_event)(&tool_name, ApprovalEvent::Granted);
        }
        next.run(ctx).await
    }
}

/// Wraps the inner call with timing and `tracing` instrumentation; records
/// `ToolCalled`/`ToolSucceeded`/`ToolFailed` via the supplied callback so the
/// engine can mirror them into the ledger.
pub struct LoggingMiddleware<F>
where
    F: Fn(&str, LoggingEvent) + Send + Sync,
{
    pub on_event: F,
}

#[derive(Debug, Clone, Copy)]
pub enum LoggingEvent {
    Called,
    Succeeded,
    Failed,
}

#[async_trait]
impl<F> Middleware for LoggingMiddleware<F>
where
    F: Fn(&str, LoggingEvent) + Send + Sync,
{
    async fn handle(&self, ctx: ExecutionContext, next: Next<'_>) -> ChainResult {
        let tool_name = ctx.tool.name().to_string();
        (self.on_event)(&tool_name, LoggingEvent::Called);
        tracing::info!(tool = %tool_name, "dispatching tool call");

        let result = next.run(ctx).await;
        match &result {
            Ok(_) => {
                (self.on_event)(&tool_name, LoggingEvent::Succeeded);
                tracing::info!(tool = %tool_name, "tool call succeeded");
            }
            Err(err) => {
                (self.on_event)(&tool_name, LoggingEvent::Failed);
                tracing::warn!(tool = %tool_name, error = %err, "tool call failed");
            }
        }
        result
    }
}
