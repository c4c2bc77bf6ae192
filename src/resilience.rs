//! Wraps one tool invocation with the fixed composition
//! Bulkhead → Timeout → CircuitBreaker → (Retry iff idempotent) → Tool.execute.

use crate::error::ResilienceError;
use crate::run::ToolAnnotations;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// Caps the number of in-flight executions sharing one executor.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Acquires a permit without blocking, failing fast per the spec's
    /// `BulkheadFull` error kind rather than queuing indefinitely.
    pub fn try_acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ResilienceError> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ResilienceError::BulkheadFull {
                max_concurrent: self.max_concurrent,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure-rate protector with closed/open/half-open states, generalized
/// from the teacher's agent-error circuit breaker to gate tool calls
/// instead of agent restarts.
#[derive(Debug)]
struct CircuitBreakerInner {
    failure_threshold: u32,
    open_timeout: Duration,
    failure_count: u32,
    last_failure_time: Option<SystemTime>,
    state: CircuitBreakerState,
    half_open_probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CircuitBreakerInner {
                failure_threshold,
                open_timeout,
                failure_count: 0,
                last_failure_time: None,
                state: CircuitBreakerState::Closed,
                half_open_probe_in_flight: false,
            })),
        }
    }

    /// Updates `Open -> HalfOpen` once the timeout elapses, then checks
    /// whether a call may proceed. Only one half-open probe is allowed in
    /// flight at a time.
    fn try_enter(&self, now: SystemTime) -> Result<(), ResilienceError> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitBreakerState::Open {
            if let Some(last_failure) = inner.last_failure_time {
                if now.duration_since(last_failure).unwrap_or_default() > inner.open_timeout {
                    inner.state = CircuitBreakerState::HalfOpen;
                }
            }
        }
        match inner.state {
            CircuitBreakerState::Open => Err(ResilienceError::CircuitOpen {
                tool_name: String::new(),
            }),
            CircuitBreakerState::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Err(ResilienceError::CircuitOpen {
                        tool_name: String::new(),
                    })
                } else {
                    inner.half_open_probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitBreakerState::Closed => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.state = CircuitBreakerState::Closed;
        inner.half_open_probe_in_flight = false;
    }

    fn record_failure(&self, now: SystemTime) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_time = Some(now);
        inner.half_open_probe_in_flight = false;
        if inner.failure_count >= inner.failure_threshold {
            inner.state = CircuitBreakerState::Open;
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().state == CircuitBreakerState::Open
    }
}

/// Exponential backoff applied only to tools with `annotations.idempotent`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64)
    }
}

/// Result of a resilient tool invocation.
#[derive(Debug, Clone)]
pub struct ResilientOutcome<T> {
    pub value: T,
    pub duration: Duration,
    pub cached: bool,
}

/// Configuration for one resilient executor instance. Process-wide: its
/// bulkhead and circuit breaker state are shared across concurrent runs via
/// `Arc`.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    pub bulkhead: Bulkhead,
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreaker,
    pub retry: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(
        max_concurrent: usize,
        timeout: Duration,
        failure_threshold: u32,
        open_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bulkhead: Bulkhead::new(max_concurrent),
            timeout,
            circuit_breaker: CircuitBreaker::new(failure_threshold, open_timeout),
            retry,
        }
    }

    /// Runs `call` under Bulkhead -> Timeout -> CircuitBreaker -> (Retry iff
    /// `idempotent`) -> `call`. `call` is invoked anew on every attempt. A
    /// single outer timeout bounds the whole retry loop: wall-clock is
    /// capped at `self.timeout` regardless of `max_attempts`, not multiplied
    /// by it.
    pub async fn call<F, Fut, T>(
        &self,
        tool_name: &str,
        annotations: ToolAnnotations,
        mut call: F,
    ) -> Result<ResilientOutcome<T>, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let _permit = self.bulkhead.try_acquire()?;

        self.circuit_breaker
            .try_enter(SystemTime::now())
            .map_err(|_| ResilienceError::CircuitOpen {
                tool_name: tool_name.to_string(),
            })?;

        let max_attempts = if annotations.idempotent {
            self.retry.max_attempts
        } else {
            1
        };

        let started = std::time::Instant::now();
        let retry = self.retry;
        let circuit_breaker = self.circuit_breaker.clone();

        let attempts = async move {
            let mut last_err = None;
            for attempt in 0..max_attempts {
                if attempt > 0 {
                    tokio::time::sleep(retry.delay_for_attempt(attempt - 1)).await;
                }

                match call().await {
                    Ok(value) => {
                        circuit_breaker.record_success();
                        return Ok(value);
                    }
                    Err(err) => {
                        circuit_breaker.record_failure(SystemTime::now());
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or(ResilienceError::ToolFailed("no attempts executed".into())))
        };

        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(Ok(value)) => Ok(ResilientOutcome {
                value,
                duration: started.elapsed(),
                cached: false,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.circuit_breaker.record_failure(SystemTime::now());
                Err(ResilienceError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let now = SystemTime::now();
        assert!(!breaker.is_open());
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(!breaker.is_open());
        breaker.record_failure(now);
        assert!(breaker.is_open());
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        let now = SystemTime::now();
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert!(!breaker.is_open());
    }

    #[test]
    fn circuit_breaker_half_opens_after_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let now = SystemTime::now();
        breaker.record_failure(now);
        assert!(breaker.is_open());
        let later = now + Duration::from_millis(20);
        assert!(breaker.try_enter(later).is_ok());
    }

    #[tokio::test]
    async fn bulkhead_rejects_beyond_capacity() {
        let bulkhead = Bulkhead::new(1);
        let _first = bulkhead.try_acquire().unwrap();
        assert!(bulkhead.try_acquire().is_err());
    }

    #[tokio::test]
    async fn non_idempotent_tool_is_never_retried() {
        let executor = ResilientExecutor::new(
            4,
            Duration::from_millis(50),
            10,
            Duration::from_secs(60),
            RetryPolicy::default(),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = executor
            .call("write_file", ToolAnnotations::destructive(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::ToolFailed("boom".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotent_tool_retries_until_max_attempts() {
        let executor = ResilientExecutor::new(
            4,
            Duration::from_millis(50),
            10,
            Duration::from_secs(60),
            RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                multiplier: 1.0,
            },
        );
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = executor
            .call("read_file", ToolAnnotations::read_only(), move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::ToolFailed("boom".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn successful_call_reports_positive_duration() {
        let executor = ResilientExecutor::new(
            4,
            Duration::from_millis(50),
            10,
            Duration::from_secs(60),
            RetryPolicy::default(),
        );
        let result = executor
            .call("read_file", ToolAnnotations::read_only(), || async { Ok::<_, ResilienceError>(()) })
            .await
            .unwrap();
        assert!(result.duration.as_nanos() > 0);
    }
}
