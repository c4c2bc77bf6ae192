//! Named integer quotas with check-then-consume semantics.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single named quota's limit and remaining balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Budget {
    pub limit: u64,
    pub remaining: u64,
}

impl Budget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            remaining: limit,
        }
    }
}

/// A read-only view of a ledger's quotas, safe to hand to a planner.
pub type BudgetSnapshot = HashMap<String, Budget>;

/// Process-wide or per-run named quotas, guarded by a single mutex so
/// `consume` is atomic under concurrent access (runs sharing one ledger
/// instance must never observe a torn check-then-decrement).
#[derive(Debug)]
pub struct BudgetLedger {
    quotas: Mutex<HashMap<String, Budget>>,
}

impl BudgetLedger {
    pub fn new(limits: HashMap<String, u64>) -> Self {
        let quotas = limits
            .into_iter()
            .map(|(name, limit)| (name, Budget::new(limit)))
            .collect();
        Self {
            quotas: Mutex::new(quotas),
        }
    }

    /// True iff the quota exists and has at least `n` remaining.
    pub fn can_consume(&self, name: &str, n: u64) -> bool {
        self.quotas
            .lock()
            .get(name)
            .is_some_and(|b| b.remaining >= n)
    }

    /// Atomically decrements `name` by `n`, returning the new remaining.
    ///
    /// Fails with [`crate::error::PolicyError::BudgetExceeded`] without
    /// mutating state if the quota is missing or insufficient.
    pub fn consume(&self, name: &str, n: u64) -> Result<u64, crate::error::PolicyError> {
        let mut quotas = self.quotas.lock();
        let budget = quotas
            .get_mut(name)
            .ok_or_else(|| crate::error::PolicyError::BudgetExceeded {
                name: name.to_string(),
                requested: n,
                remaining: 0,
            })?;
        if budget.remaining < n {
            return Err(crate::error::PolicyError::BudgetExceeded {
                name: name.to_string(),
                requested: n,
                remaining: budget.remaining,
            });
        }
        budget.remaining -= n;
        Ok(budget.remaining)
    }

    /// A read-only copy for presentation to planners.
    pub fn snapshot(&self) -> BudgetSnapshot {
        self.quotas.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(limit: u64) -> BudgetLedger {
        let mut limits = HashMap::new();
        limits.insert("tool_calls".to_string(), limit);
        BudgetLedger::new(limits)
    }

    #[test]
    fn consume_decrements_and_reports_remaining() {
        let ledger = ledger(3);
        assert_eq!(ledger.consume("tool_calls", 1).unwrap(), 2);
        assert_eq!(ledger.consume("tool_calls", 2).unwrap(), 0);
    }

    #[test]
    fn consume_past_the_limit_fails_and_leaves_state_unchanged() {
        let ledger = ledger(1);
        assert!(ledger.consume("tool_calls", 2).is_err());
        assert_eq!(ledger.snapshot()["tool_calls"].remaining, 1);
    }

    #[test]
    fn consume_zero_is_a_no_op_that_succeeds_iff_quota_exists() {
        let ledger = ledger(0);
        assert_eq!(ledger.consume("tool_calls", 0).unwrap(), 0);
        assert!(ledger.consume("missing", 0).is_err());
    }

    #[test]
    fn can_consume_does_not_mutate() {
        let ledger = ledger(1);
        assert!(ledger.can_consume("tool_calls", 1));
        assert!(!ledger.can_consume("tool_calls", 2));
        assert_eq!(ledger.snapshot()["tool_calls"].remaining, 1);
    }

    #[test]
    fn missing_quota_cannot_be_consumed() {
        let ledger = ledger(5);
        assert!(!ledger.can_consume("unknown", 1));
        assert!(ledger.consume("unknown", 1).is_err());
    }
}
