//! A single value-owning configuration record, replacing constructor
//! injection of many optional collaborators. Unset fields resolve to
//! well-specified defaults at construction; this crate never loads
//! configuration from files or environment variables itself.

use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Bulkhead/timeout/circuit-breaker/retry parameters for the resilient
/// executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_concurrent_tool_calls: usize,
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,
    pub circuit_breaker_failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_open_timeout: Duration,
    pub retry: RetryPolicyConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tool_calls: 16,
            tool_timeout: Duration::from_secs(30),
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_open_timeout: Duration::from_secs(30),
            retry: RetryPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(config: RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay,
            multiplier: config.multiplier,
        }
    }
}

/// Whether storage backends are mandatory. A mandatory store's append
/// failure fails the run; an optional one only logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StoragePolicy {
    #[default]
    Optional,
    Mandatory,
}

/// The engine's single configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard cap on decisions per `run`/`resume_with_input` invocation.
    pub max_steps: u64,
    /// Named quota limits handed to a fresh `BudgetLedger` per run.
    pub budgets: HashMap<String, u64>,
    pub resilience: ResilienceConfig,
    pub storage_policy: StoragePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut budgets = HashMap::new();
        budgets.insert("tool_calls".to_string(), 50);
        Self {
            max_steps: 100,
            budgets,
            resilience: ResilienceConfig::default(),
            storage_policy: StoragePolicy::Optional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_budgets_and_steps() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 100);
        assert_eq!(config.budgets["tool_calls"], 50);
        assert_eq!(config.storage_policy, StoragePolicy::Optional);
    }
}
