//! Append-only, write-only audit trail of every control-plane fact.

use crate::error::LedgerError;
use crate::ids::RunId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The closed set of facts the ledger can record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LedgerKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    StateTransitioned,
    DecisionMade,
    ToolCalled,
    ToolSucceeded,
    ToolFailed,
    EvidenceAdded,
    VariableSet,
    BudgetConsumed,
    BudgetExhausted,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
    HumanInputRequested,
    HumanInputResponse,
    RunPaused,
    RunResumed,
}

/// One immutable, sequence-numbered fact about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LedgerKind,
    pub payload: serde_json::Value,
}

/// Write-only, in-memory ledger. Assigns dense, strictly-increasing
/// sequence numbers per run (Invariant L1). An optional [`crate::interfaces::LedgerStore`]
/// may be layered on top by the engine for durability; persistence
/// failures there are surfaced separately and never corrupt sequencing.
#[derive(Debug, Default)]
pub struct Ledger {
    sequences: DashMap<RunId, Arc<AtomicU64>>,
    entries: DashMap<RunId, Vec<LedgerEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence number for `run_id`, stamps `timestamp`,
    /// and appends. Never fails — a missing run simply starts its sequence
    /// at 1.
    pub fn record(
        &self,
        run_id: &RunId,
        timestamp: DateTime<Utc>,
        kind: LedgerKind,
        payload: serde_json::Value,
    ) -> LedgerEntry {
        let counter = self
            .sequences
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let sequence = counter.fetch_add(1, Ordering::SeqCst) + 1;

        let entry = LedgerEntry {
            run_id: run_id.clone(),
            sequence,
            timestamp,
            kind,
            payload,
        };
        self.entries
            .entry(run_id.clone())
            .or_default()
            .push(entry.clone());
        entry
    }

    pub fn entries_for(&self, run_id: &RunId) -> Vec<LedgerEntry> {
        self.entries.get(run_id).map(|v| v.clone()).unwrap_or_default()
    }

    /// Verifies Invariant L1 for a run: sequences are dense, strictly
    /// increasing from 1.
    pub fn verify_dense(&self, run_id: &RunId) -> Result<(), LedgerError> {
        let entries = self.entries_for(run_id);
        for (idx, entry) in entries.iter().enumerate() {
            let expected = idx as u64 + 1;
            if entry.sequence != expected {
                return Err(LedgerError::SequenceGap {
                    run_id: run_id.clone(),
                    expected,
                    got: entry.sequence,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SystemClock;

    fn run_id() -> RunId {
        RunId::new(&SystemClock)
    }

    #[test]
    fn sequences_are_dense_and_strictly_increasing() {
        let ledger = Ledger::new();
        let run_id = run_id();
        for _ in 0..5 {
            ledger.record(&run_id, Utc::now(), LedgerKind::DecisionMade, serde_json::Value::Null);
        }
        ledger.verify_dense(&run_id).unwrap();
        let sequences: Vec<u64> = ledger.entries_for(&run_id).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn sequences_are_independent_per_run() {
        let ledger = Ledger::new();
        let a = run_id();
        let b = run_id();
        ledger.record(&a, Utc::now(), LedgerKind::RunStarted, serde_json::Value::Null);
        ledger.record(&a, Utc::now(), LedgerKind::RunStarted, serde_json::Value::Null);
        ledger.record(&b, Utc::now(), LedgerKind::RunStarted, serde_json::Value::Null);

        assert_eq!(ledger.entries_for(&a).len(), 2);
        assert_eq!(ledger.entries_for(&b).len(), 1);
        assert_eq!(ledger.entries_for(&b)[0].sequence, 1);
    }
}
