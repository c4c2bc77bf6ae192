//! The step loop: glues identifiers, evidence, budget, ledger, state
//! machine, policy gates, middleware chain, and resilient executor into a
//! single deterministic, resumable execution.

use crate::budget::BudgetLedger;
use crate::config::{EngineConfig, StoragePolicy};
use crate::error::{ControlFlowError, EngineError, LedgerError, PolicyError};
use crate::events::Event;
use crate::evidence::{Evidence, EvidenceKind};
use crate::ids::{Clock, RunId, SystemClock};
use crate::interfaces::{Approver, EventStore, LedgerStore, PlanRequest, Planner, ToolRegistry};
use crate::ledger::{Ledger, LedgerEntry, LedgerKind};
use crate::middleware::{
    ApprovalMiddleware, EligibilityMiddleware, ExecutionContext, LoggingMiddleware,
    MiddlewareChain,
};
use crate::policy::{check_transition, Eligibility};
use crate::resilience::ResilientExecutor;
use crate::run::{Decision, Question, Run, RunStatus};
use crate::state_machine::{State, StateMachine};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Glues the collaborators together; holds only process-wide shared
/// resources (resilient executor, ledger, registries). Value-owning
/// configuration replaces deep constructor injection (SPEC design note).
pub struct Engine {
    config: EngineConfig,
    planner: Arc<dyn Planner>,
    tool_registry: Arc<dyn ToolRegistry>,
    eligibility: Arc<dyn Eligibility>,
    approver: Arc<dyn Approver>,
    ledger: Arc<Ledger>,
    executor: ResilientExecutor,
    clock: Arc<dyn Clock>,
    event_store: Option<Arc<dyn EventStore>>,
    ledger_store: Option<Arc<dyn LedgerStore>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        planner: Arc<dyn Planner>,
        tool_registry: Arc<dyn ToolRegistry>,
        eligibility: Arc<dyn Eligibility>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        let executor = ResilientExecutor::new(
            config.resilience.max_concurrent_tool_calls,
            config.resilience.tool_timeout,
            config.resilience.circuit_breaker_failure_threshold,
            config.resilience.circuit_breaker_open_timeout,
            config.resilience.retry.clone().into(),
        );
        Self {
            config,
            planner,
            tool_registry,
            eligibility,
            approver,
            ledger: Arc::new(Ledger::new()),
            executor,
            clock: Arc::new(SystemClock),
            event_store: None,
            ledger_store: None,
        }
    }

    /// Layers a durable [`EventStore`] under the in-memory ledger. Under
    /// `StoragePolicy::Mandatory` an append failure here fails the run that
    /// produced it instead of silently continuing with a durability gap.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Layers a durable [`LedgerStore`] under the in-memory ledger. Same
    /// `StoragePolicy` semantics as [`Engine::with_event_store`].
    pub fn with_ledger_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.ledger_store = Some(store);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Derives the state machine's per-state `allowed_tools` map from the
    /// same `Eligibility` gate `EligibilityMiddleware` enforces, so the
    /// table advertised to planners via `PlanRequest.allowed_tools` can
    /// never drift out of sync with what a `CallTool` decision actually
    /// checks. Recomputed per run so registry additions are picked up.
    fn derive_allowed_tools(&self) -> HashMap<State, HashSet<String>> {
        let mut table: HashMap<State, HashSet<String>> = HashMap::new();
        for tool in self.tool_registry.list() {
            for state in State::ALL {
                if self.eligibility.is_allowed(state, tool.name()) {
                    table.entry(state).or_default().insert(tool.name().to_string());
                }
            }
        }
        table
    }

    /// Mirrors one ledger entry to whichever durable stores are configured.
    /// The two stores are independent; either being absent or failing
    /// does not affect the other.
    async fn persist(&self, entry: &LedgerEntry) -> Result<(), crate::error::StorageError> {
        if let Some(store) = &self.event_store {
            let event = Event::new(
                entry.run_id.clone(),
                entry.sequence,
                entry.timestamp,
                entry.kind.clone(),
                entry.payload.clone(),
            );
            store.append(&entry.run_id, std::slice::from_ref(&event)).await?;
        }
        if let Some(store) = &self.ledger_store {
            store.append(std::slice::from_ref(entry)).await?;
        }
        Ok(())
    }

    /// Records one ledger fact and mirrors it durably. Under
    /// `StoragePolicy::Mandatory`, a storage failure is turned into a
    /// `LedgerError::StoreUnavailable` for the caller to fail the run with —
    /// this crate's only mandatory-storage gate (spec's replay/audit
    /// guarantee is worthless if the durable copy can silently fall behind
    /// the in-memory one). Under `StoragePolicy::Optional` the failure is
    /// logged and the in-memory entry stands on its own.
    async fn record(
        &self,
        run_id: &RunId,
        timestamp: DateTime<Utc>,
        kind: LedgerKind,
        payload: serde_json::Value,
    ) -> (LedgerEntry, Option<EngineError>) {
        let entry = self.ledger.record(run_id, timestamp, kind, payload);
        if let Err(err) = self.persist(&entry).await {
            tracing::warn!(run_id = %run_id, error = %err, "storage backend unavailable for ledger entry");
            if self.config.storage_policy == StoragePolicy::Mandatory {
                let engine_err = EngineError::Ledger(LedgerError::StoreUnavailable {
                    run_id: run_id.clone(),
                    reason: err.to_string(),
                });
                return (entry, Some(engine_err));
            }
        }
        (entry, None)
    }

    /// Appends `evidence` to the run's evidence log and records the matching
    /// `EvidenceAdded` ledger entry in the same call, so the two can never
    /// drift apart (L2 completeness) and [`crate::events::replay`] — which
    /// reconstructs evidence purely from this payload — always has
    /// `evidence_kind`/`source`/`content` to work with. Returns a storage
    /// error if durable persistence is mandatory and unavailable.
    async fn add_evidence_with_ledger(&self, run: &mut Run, evidence: Evidence) -> Option<EngineError> {
        let kind = match evidence.kind {
            EvidenceKind::ToolResult => "ToolResult",
            EvidenceKind::HumanInput => "HumanInput",
            EvidenceKind::Observation => "Observation",
        };
        let payload = json!({
            "evidence_kind": kind,
            "source": evidence.source,
            "content": String::from_utf8_lossy(&evidence.content),
        });
        let timestamp = evidence.timestamp;
        run.add_evidence(evidence);
        let (_, storage_err) = self.record(&run.id, timestamp, LedgerKind::EvidenceAdded, payload).await;
        storage_err
    }

    /// Starts a fresh run and drives it to terminal or pause.
    pub async fn run(
        &self,
        goal: impl Into<String>,
        cancellation: CancellationToken,
    ) -> (Run, Option<EngineError>) {
        self.run_with_vars(goal, HashMap::new(), cancellation).await
    }

    /// Same as [`Engine::run`], pre-seeding the run's variable map.
    pub async fn run_with_vars(
        &self,
        goal: impl Into<String>,
        vars: HashMap<String, serde_json::Value>,
        cancellation: CancellationToken,
    ) -> (Run, Option<EngineError>) {
        let now = chrono::Utc::now();
        let run_id = RunId::new(self.clock.as_ref());
        let mut run = Run::new(run_id, goal, now);
        for (key, value) in vars {
            run.set_var(key, value);
        }
        run.start();

        let (_, storage_err) = self
            .record(
                &run.id,
                now,
                LedgerKind::RunStarted,
                json!({ "goal": run.goal, "vars": run.vars }),
            )
            .await;
        if let Some(err) = storage_err {
            run.fail(err.to_string(), now);
            return (run, Some(err));
        }

        let budget = BudgetLedger::new(self.config.budgets.clone());
        let mut state_machine = StateMachine::new().with_allowed_tools(self.derive_allowed_tools());

        let error = self
            .step_loop(&mut run, &mut state_machine, &budget, &cancellation)
            .await;
        (run, error)
    }

    /// Requires a paused run with a pending question; validates `input`,
    /// appends a `HumanInput` evidence carrying both question and response,
    /// clears the question, and re-enters the step loop with a fresh
    /// budget and ledger segment.
    pub async fn resume_with_input(
        &self,
        mut run: Run,
        input: impl Into<String>,
        cancellation: CancellationToken,
    ) -> (Run, Option<EngineError>) {
        let input = input.into();
        let question = match run.pending_question.clone() {
            Some(q) => q,
            None => return (run, Some(EngineError::ControlFlow(ControlFlowError::NoPendingQuestion))),
        };

        if !question.options.is_empty() && !question.options.contains(&input) {
            return (
                run,
                Some(EngineError::ControlFlow(ControlFlowError::InvalidHumanInput {
                    input,
                    options: question.options,
                })),
            );
        }

        let now = chrono::Utc::now();
        let payload = json!({ "question": question.text.clone(), "response": input.clone() });
        if let Some(err) = self
            .add_evidence_with_ledger(
                &mut run,
                Evidence::human_input("human", bytes::Bytes::from(payload.to_string()), now),
            )
            .await
        {
            run.fail(err.to_string(), now);
            return (run, Some(err));
        }
        run.clear_pending_question();

        let (_, storage_err) = self
            .record(&run.id, now, LedgerKind::HumanInputResponse, payload)
            .await;
        if let Some(err) = storage_err {
            run.fail(err.to_string(), now);
            return (run, Some(err));
        }
        let (_, storage_err) = self.record(&run.id, now, LedgerKind::RunResumed, json!({})).await;
        if let Some(err) = storage_err {
            run.fail(err.to_string(), now);
            return (run, Some(err));
        }

        let budget = BudgetLedger::new(self.config.budgets.clone());
        let mut state_machine = StateMachine::new().with_allowed_tools(self.derive_allowed_tools());
        state_machine.resume_from(run.current_state);

        let error = self
            .step_loop(&mut run, &mut state_machine, &budget, &cancellation)
            .await;
        (run, error)
    }

    async fn step_loop(
        &self,
        run: &mut Run,
        state_machine: &mut StateMachine,
        budget: &BudgetLedger,
        cancellation: &CancellationToken,
    ) -> Option<EngineError> {
        let mut steps_taken: u64 = 0;

        loop {
            if state_machine.is_terminal() {
                return None;
            }

            if cancellation.is_cancelled() {
                let now = chrono::Utc::now();
                run.fail("cancelled", now);
                self.ledger.record(
                    &run.id,
                    now,
                    LedgerKind::RunFailed,
                    json!({ "reason": "cancelled" }),
                );
                tracing::warn!(run_id = %run.id, "run cancelled");
                return Some(EngineError::ControlFlow(ControlFlowError::Cancelled));
            }

            if steps_taken >= self.config.max_steps {
                let now = chrono::Utc::now();
                run.fail("max steps exceeded", now);
                self.ledger.record(
                    &run.id,
                    now,
                    LedgerKind::RunFailed,
                    json!({ "reason": "max_steps_exceeded" }),
                );
                return Some(EngineError::ControlFlow(ControlFlowError::MaxStepsExceeded(
                    self.config.max_steps,
                )));
            }
            steps_taken += 1;

            let evidence_snapshot: Vec<crate::evidence::Evidence> =
                run.evidence.iter().cloned().collect();
            let decision = {
                let allowed_tools = state_machine.allowed_tools().into_iter().collect();
                let request = PlanRequest {
                    run_id: &run.id,
                    current_state: state_machine.current(),
                    evidence: &evidence_snapshot,
                    allowed_tools,
                    budgets: budget.snapshot(),
                    vars: &run.vars,
                };
                self.planner.plan(request).await
            };

            let decision = match decision {
                Ok(decision) => decision,
                Err(err) => {
                    let now = chrono::Utc::now();
                    run.fail(format!("planner error: {err}"), now);
                    self.ledger.record(
                        &run.id,
                        now,
                        LedgerKind::RunFailed,
                        json!({ "reason": "planner_error", "detail": err.to_string() }),
                    );
                    return Some(EngineError::Planner(err));
                }
            };

            let now = chrono::Utc::now();
            self.ledger.record(
                &run.id,
                now,
                LedgerKind::DecisionMade,
                decision_payload(&decision),
            );

            match self
                .dispatch(run, state_machine, budget, &decision, cancellation)
                .await
            {
                DispatchOutcome::Continue => continue,
                DispatchOutcome::Paused => return Some(EngineError::ControlFlow(ControlFlowError::AwaitingHumanInput)),
                DispatchOutcome::Terminal => return None,
                DispatchOutcome::Error(err) => return Some(err),
            }
        }
    }

    async fn dispatch(
        &self,
        run: &mut Run,
        state_machine: &mut StateMachine,
        budget: &BudgetLedger,
        decision: &Decision,
        cancellation: &CancellationToken,
    ) -> DispatchOutcome {
        match decision {
            Decision::CallTool {
                tool_name,
                input,
                reason,
            } => {
                self.dispatch_call_tool(run, state_machine, budget, tool_name, input.clone(), reason, cancellation)
                    .await
            }
            Decision::Transition { to_state, reason: _ } => {
                self.dispatch_transition(run, state_machine, *to_state).await
            }
            Decision::AskHuman { question, options } => {
                let now = chrono::Utc::now();
                self.ledger.record(
                    &run.id,
                    now,
                    LedgerKind::HumanInputRequested,
                    json!({ "text": question, "options": options }),
                );
                run.ask_human(Question {
                    text: question.clone(),
                    options: options.clone(),
                });
                let (_, storage_err) = self
                    .record(&run.id, now, LedgerKind::RunPaused, json!({ "text": question, "options": options }))
                    .await;
                tracing::info!(run_id = %run.id, "run paused awaiting human input");
                match storage_err {
                    Some(err) => DispatchOutcome::Error(err),
                    None => DispatchOutcome::Paused,
                }
            }
            Decision::Finish { result, summary } => {
                match check_transition(&*state_machine, state_machine.current(), State::Done) {
                    Ok(()) => {
                        state_machine.transition(State::Done).ok();
                        let now = chrono::Utc::now();
                        run.transition_to(State::Done);
                        run.complete(result.clone(), now);
                        let (_, storage_err) = self
                            .record(
                                &run.id,
                                now,
                                LedgerKind::RunCompleted,
                                json!({ "summary": summary, "result": String::from_utf8_lossy(result) }),
                            )
                            .await;
                        match storage_err {
                            Some(err) => {
                                run.fail(err.to_string(), now);
                                tracing::error!(run_id = %run.id, error = %err, "run completed but durable storage is unavailable");
                                DispatchOutcome::Error(err)
                            }
                            None => {
                                tracing::info!(run_id = %run.id, "run completed");
                                DispatchOutcome::Terminal
                            }
                        }
                    }
                    Err(err) => self.fail_with(run, err).await,
                }
            }
            Decision::Fail { reason } => {
                state_machine.transition(State::Failed).ok();
                let now = chrono::Utc::now();
                run.transition_to(State::Failed);
                run.fail(reason.clone(), now);
                self.ledger.record(
                    &run.id,
                    now,
                    LedgerKind::RunFailed,
                    json!({ "reason": reason }),
                );
                tracing::error!(run_id = %run.id, reason = %reason, "run failed by planner decision");
                DispatchOutcome::Terminal
            }
        }
    }

    async fn dispatch_transition(
        &self,
        run: &mut Run,
        state_machine: &mut StateMachine,
        to_state: State,
    ) -> DispatchOutcome {
        let from = state_machine.current();
        match state_machine.transition(to_state) {
            Ok(()) => {
                run.transition_to(to_state);
                let now = chrono::Utc::now();
                let (_, storage_err) = self
                    .record(
                        &run.id,
                        now,
                        LedgerKind::StateTransitioned,
                        json!({ "from": from.to_string(), "to": to_state.to_string() }),
                    )
                    .await;
                tracing::info!(run_id = %run.id, from = %from, to = %to_state, "state transition");
                match storage_err {
                    Some(err) => self.fail_with(run, err).await,
                    None => DispatchOutcome::Continue,
                }
            }
            Err(err) => self.fail_with(run, err).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_call_tool(
        &self,
        run: &mut Run,
        state_machine: &mut StateMachine,
        budget: &BudgetLedger,
        tool_name: &str,
        input: bytes::Bytes,
        reason: &str,
        cancellation: &CancellationToken,
    ) -> DispatchOutcome {
        if !budget.can_consume("tool_calls", 1) {
            let now = chrono::Utc::now();
            self.ledger.record(
                &run.id,
                now,
                LedgerKind::BudgetExhausted,
                json!({ "name": "tool_calls" }),
            );
            return self
                .fail_with(
                    run,
                    PolicyError::BudgetExceeded {
                        name: "tool_calls".to_string(),
                        requested: 1,
                        remaining: 0,
                    },
                )
                .await;
        }

        let tool = match self.tool_registry.get(tool_name) {
            Some(tool) => tool,
            None => {
                let now = chrono::Utc::now();
                run.fail(format!("tool not found: {tool_name}"), now);
                self.ledger.record(
                    &run.id,
                    now,
                    LedgerKind::RunFailed,
                    json!({ "reason": "tool_not_found", "tool_name": tool_name }),
                );
                return DispatchOutcome::Error(EngineError::Tool(crate::error::ToolError::NotFound(
                    tool_name.to_string(),
                )));
            }
        };

        let ctx = ExecutionContext {
            run_id: run.id.clone(),
            current_state: state_machine.current(),
            tool: tool.clone(),
            input: input.clone(),
            reason: reason.to_string(),
            budget_snapshot: budget.snapshot(),
            vars: run.vars.clone(),
        };

        let ledger = self.ledger.clone();
        let run_id_for_log = run.id.clone();
        let ledger_for_approval = self.ledger.clone();
        let run_id_for_approval = run.id.clone();
        let chain = MiddlewareChain::new()
            .push(Arc::new(EligibilityMiddleware {
                eligibility: self.eligibility.clone(),
            }))
            .push(Arc::new(ApprovalMiddleware {
                approver: self.approver.clone(),
                on_event: move |tool_name: &str, event| {
                    let kind = match event {
                        crate::middleware::ApprovalEvent::Requested => LedgerKind::ApprovalRequested,
                        crate::middleware::ApprovalEvent::Granted => LedgerKind::ApprovalGranted,
                        crate::middleware::ApprovalEvent::Denied => LedgerKind::ApprovalDenied,
                    };
                    ledger_for_approval.record(
                        &run_id_for_approval,
                        chrono::Utc::now(),
                        kind,
                        json!({ "tool_name": tool_name }),
                    );
                },
            }))
            .push(Arc::new(LoggingMiddleware {
                on_event: move |tool_name: &str, event| {
                    let kind = match event {
                        crate::middleware::LoggingEvent::Called => LedgerKind::ToolCalled,
                        crate::middleware::LoggingEvent::Succeeded => LedgerKind::ToolSucceeded,
                        crate::middleware::LoggingEvent::Failed => LedgerKind::ToolFailed,
                    };
                    ledger.record(
                        &run_id_for_log,
                        chrono::Utc::now(),
                        kind,
                        json!({ "tool_name": tool_name }),
                    );
                },
            }));

        let executor = self.executor.clone();
        let cancellation = cancellation.clone();
        let result = chain
            .run(ctx, move |ctx| {
                let executor = executor.clone();
                let cancellation = cancellation.clone();
                Box::pin(async move {
                    let annotations = ctx.tool.annotations();
                    let tool = ctx.tool.clone();
                    let input = ctx.input.clone();
                    executor
                        .call(tool.name(), annotations, move || {
                            let tool = tool.clone();
                            let input = input.clone();
                            let cancellation = cancellation.clone();
                            async move {
                                tool.execute(cancellation, input)
                                    .await
                                    .map_err(|e| crate::error::ResilienceError::ToolFailed(e.to_string()))
                            }
                        })
                        .await
                        .map(|outcome| outcome.value)
                        .map_err(crate::error::EngineError::from)
                })
            })
            .await;

        match result {
            Ok(outcome) => {
                let consumed = budget.consume("tool_calls", 1);
                let now = chrono::Utc::now();
                if let Some(err) = self
                    .add_evidence_with_ledger(
                        run,
                        Evidence::tool_result(tool_name.to_string(), outcome.output.clone(), now),
                    )
                    .await
                {
                    return self.fail_with(run, err).await;
                }
                if let Ok(remaining) = consumed {
                    self.ledger.record(
                        &run.id,
                        now,
                        LedgerKind::BudgetConsumed,
                        json!({ "name": "tool_calls", "remaining": remaining }),
                    );
                }
                DispatchOutcome::Continue
            }
            Err(err) => self.fail_with(run, err).await,
        }
    }

    /// Fails `run` and records `RunFailed`. Persistence here is always
    /// best-effort regardless of `StoragePolicy`: a run that is already
    /// failing must still finish failing even if the durable store is the
    /// thing that's down.
    async fn fail_with(&self, run: &mut Run, err: impl Into<EngineError>) -> DispatchOutcome {
        let err = err.into();
        let now = chrono::Utc::now();
        run.fail(err.to_string(), now);
        let entry = self.ledger.record(
            &run.id,
            now,
            LedgerKind::RunFailed,
            json!({ "reason": err.to_string() }),
        );
        if let Err(storage_err) = self.persist(&entry).await {
            tracing::warn!(run_id = %run.id, error = %storage_err, "storage backend unavailable for RunFailed entry");
        }
        tracing::error!(run_id = %run.id, error = %err, "run failed");
        DispatchOutcome::Error(err)
    }
}

enum DispatchOutcome {
    Continue,
    Paused,
    Terminal,
    Error(EngineError),
}

fn decision_payload(decision: &Decision) -> serde_json::Value {
    match decision {
        Decision::CallTool { tool_name, reason, .. } => {
            json!({ "type": "call_tool", "tool_name": tool_name, "reason": reason })
        }
        Decision::Transition { to_state, reason } => {
            json!({ "type": "transition", "to_state": to_state.to_string(), "reason": reason })
        }
        Decision::AskHuman { question, options } => {
            json!({ "type": "ask_human", "question": question, "options": options })
        }
        Decision::Finish { summary, .. } => json!({ "type": "finish", "summary": summary }),
        Decision::Fail { reason } => json!({ "type": "fail", "reason": reason }),
    }
}
