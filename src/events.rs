//! Derivable event types and deterministic replay of a run from its event
//! log.

use crate::evidence::{Evidence, EvidenceKind};
use crate::ids::{EventId, RunId};
use crate::ledger::LedgerKind;
use crate::run::{Question, Run, RunStatus};
use crate::state_machine::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A replayable record mirroring a ledger entry; the wire contract for
/// external consumers (formatters, UIs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LedgerKind,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        run_id: RunId,
        sequence: u64,
        timestamp: DateTime<Utc>,
        kind: LedgerKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            run_id,
            sequence,
            timestamp,
            kind,
            payload,
        }
    }
}

/// Reconstructs a [`Run`] deterministically by folding an event stream.
/// Idempotent and order-preserving; a state-mutating event observed before
/// `RunStarted` is silently skipped (defensive against corrupt streams).
pub fn replay(events: &[Event]) -> Option<Run> {
    let mut run: Option<Run> = None;

    for event in events {
        match &event.kind {
            LedgerKind::RunStarted => {
                let goal = event
                    .payload
                    .get("goal")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut fresh = Run::new(event.run_id.clone(), goal, event.timestamp);
                if let Some(vars) = event.payload.get("vars").and_then(|v| v.as_object()) {
                    for (key, value) in vars {
                        fresh.set_var(key.clone(), value.clone());
                    }
                }
                fresh.status = RunStatus::Running;
                run = Some(fresh);
            }
            LedgerKind::StateTransitioned => {
                if let Some(run) = run.as_mut() {
                    if let Some(to) = event
                        .payload
                        .get("to")
                        .and_then(|v| v.as_str())
                        .and_then(parse_state)
                    {
                        run.transition_to(to);
                    }
                }
            }
            LedgerKind::EvidenceAdded => {
                if let Some(run) = run.as_mut() {
                    if let Some(evidence) = parse_evidence(&event.payload, event.timestamp) {
                        run.add_evidence(evidence);
                    }
                }
            }
            LedgerKind::VariableSet => {
                if let Some(run) = run.as_mut() {
                    if let (Some(key), Some(value)) = (
                        event.payload.get("key").and_then(|v| v.as_str()),
                        event.payload.get("value"),
                    ) {
                        run.set_var(key.to_string(), value.clone());
                    }
                }
            }
            LedgerKind::RunPaused => {
                if let Some(run) = run.as_mut() {
                    run.status = RunStatus::Paused;
                    if let Some(question) = parse_question(&event.payload) {
                        run.pending_question = Some(question);
                    }
                }
            }
            LedgerKind::RunResumed => {
                if let Some(run) = run.as_mut() {
                    run.pending_question = None;
                    run.status = RunStatus::Running;
                }
            }
            LedgerKind::RunCompleted => {
                if let Some(run) = run.as_mut() {
                    let result = event
                        .payload
                        .get("result")
                        .and_then(|v| v.as_str())
                        .map(|s| bytes::Bytes::copy_from_slice(s.as_bytes()))
                        .unwrap_or_default();
                    run.complete(result, event.timestamp);
                }
            }
            LedgerKind::RunFailed => {
                if let Some(run) = run.as_mut() {
                    let reason = event
                        .payload
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    run.fail(reason, event.timestamp);
                }
            }
            // Audit-only events: decisions, tool calls, approvals, budgets.
            // Preserved for inspection but do not mutate replay state.
            _ => {}
        }
    }

    run
}

fn parse_state(value: &str) -> Option<State> {
    match value {
        "Intake" => Some(State::Intake),
        "Explore" => Some(State::Explore),
        "Decide" => Some(State::Decide),
        "Act" => Some(State::Act),
        "Validate" => Some(State::Validate),
        "Done" => Some(State::Done),
        "Failed" => Some(State::Failed),
        _ => None,
    }
}

fn parse_evidence(payload: &serde_json::Value, timestamp: DateTime<Utc>) -> Option<Evidence> {
    let kind = match payload.get("evidence_kind").and_then(|v| v.as_str())? {
        "ToolResult" => EvidenceKind::ToolResult,
        "HumanInput" => EvidenceKind::HumanInput,
        "Observation" => EvidenceKind::Observation,
        _ => return None,
    };
    let source = payload.get("source").and_then(|v| v.as_str())?.to_string();
    let content = payload
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| bytes::Bytes::copy_from_slice(s.as_bytes()))
        .unwrap_or_default();
    Some(Evidence {
        kind,
        source,
        content,
        timestamp,
    })
}

fn parse_question(payload: &serde_json::Value) -> Option<Question> {
    let text = payload.get("text").and_then(|v| v.as_str())?.to_string();
    let options = payload
        .get("options")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Some(Question { text, options })
}

/// A derived, read-only view over a run's event stream for inspection/UIs.
pub struct Timeline<'a> {
    events: &'a [Event],
}

/// One reconstructed tool-call record, pairing `ToolCalled` with the next
/// matching `ToolSucceeded`/`ToolFailed` by tool name.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub called_at: DateTime<Utc>,
    pub succeeded: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
}

impl<'a> Timeline<'a> {
    pub fn new(events: &'a [Event]) -> Self {
        Self { events }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let first = self.events.first()?;
        let last = self.events.last()?;
        Some(last.timestamp - first.timestamp)
    }

    pub fn filter_by_kind(&self, kind: &LedgerKind) -> Vec<&Event> {
        self.events.iter().filter(|e| &e.kind == kind).collect()
    }

    pub fn in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect()
    }

    pub fn state_transitions(&self) -> Vec<&Event> {
        self.filter_by_kind(&LedgerKind::StateTransitioned)
    }

    pub fn tool_call_records(&self) -> Vec<ToolCallRecord> {
        let mut records: Vec<ToolCallRecord> = Vec::new();
        for event in self.events {
            match &event.kind {
                LedgerKind::ToolCalled => {
                    if let Some(tool_name) =
                        event.payload.get("tool_name").and_then(|v| v.as_str())
                    {
                        records.push(ToolCallRecord {
                            tool_name: tool_name.to_string(),
                            called_at: event.timestamp,
                            succeeded: None,
                            failed: None,
                        });
                    }
                }
                LedgerKind::ToolSucceeded | LedgerKind::ToolFailed => {
                    if let Some(tool_name) =
                        event.payload.get("tool_name").and_then(|v| v.as_str())
                    {
                        if let Some(record) = records
                            .iter_mut()
                            .rev()
                            .find(|r| r.tool_name == tool_name && r.succeeded.is_none() && r.failed.is_none())
                        {
                            if matches!(event.kind, LedgerKind::ToolSucceeded) {
                                record.succeeded = Some(event.timestamp);
                            } else {
                                record.failed = Some(event.timestamp);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SystemClock;
    use serde_json::json;

    fn run_id() -> RunId {
        RunId::new(&SystemClock)
    }

    #[test]
    fn replay_reconstructs_run_started_and_transitions() {
        let run_id = run_id();
        let t0 = Utc::now();
        let events = vec![
            Event::new(
                run_id.clone(),
                1,
                t0,
                LedgerKind::RunStarted,
                json!({"goal": "ship it", "vars": {}}),
            ),
            Event::new(
                run_id.clone(),
                2,
                t0,
                LedgerKind::StateTransitioned,
                json!({"from": "Intake", "to": "Explore"}),
            ),
            Event::new(
                run_id.clone(),
                3,
                t0,
                LedgerKind::RunCompleted,
                json!({"result": "done"}),
            ),
        ];

        let run = replay(&events).unwrap();
        assert_eq!(run.goal, "ship it");
        assert_eq!(run.current_state, State::Done);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn state_mutating_events_before_run_started_are_skipped() {
        let run_id = run_id();
        let t0 = Utc::now();
        let events = vec![Event::new(
            run_id,
            1,
            t0,
            LedgerKind::StateTransitioned,
            json!({"from": "Intake", "to": "Explore"}),
        )];
        assert!(replay(&events).is_none());
    }

    #[test]
    fn timeline_pairs_tool_called_with_tool_succeeded() {
        let run_id = run_id();
        let t0 = Utc::now();
        let events = vec![
            Event::new(
                run_id.clone(),
                1,
                t0,
                LedgerKind::ToolCalled,
                json!({"tool_name": "read_file"}),
            ),
            Event::new(
                run_id,
                2,
                t0,
                LedgerKind::ToolSucceeded,
                json!({"tool_name": "read_file"}),
            ),
        ];
        let timeline = Timeline::new(&events);
        let records = timeline.tool_call_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].succeeded.is_some());
        assert!(records[0].failed.is_none());
    }
}
