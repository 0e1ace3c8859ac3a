use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{BreakerOptions, PoolOptions, RetryOptions};
use foreman_types::{ErrorKind, OrchestrationError};

/// Bounded retry with exponential backoff and uniform jitter. Only
/// retriable error kinds are re-attempted; timeouts are retried once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Backoff before the given attempt (1-based): `base * 2^(attempt-1)`
    /// capped, plus jitter in `[0, base)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.options.base_delay_seconds.max(0.0);
        let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.options.cap_seconds.max(base));
        let jitter = if base > 0.0 {
            rand::thread_rng().gen_range(0.0..base)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, OrchestrationError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        let max_attempts = self.options.max_attempts.max(1);
        let mut timeout_retries = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retriable = err.kind.is_retriable()
                        && attempt < max_attempts
                        && !(err.kind == ErrorKind::Timeout && timeout_retries >= 1);
                    if !retriable {
                        return Err(err);
                    }
                    if err.kind == ErrorKind::Timeout {
                        timeout_retries += 1;
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker per (dependency, key) pair. Closed counts failures in a
/// rolling window; Open fails fast until the cooldown elapses; HalfOpen
/// admits exactly one probe.
pub struct CircuitBreaker {
    options: BreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Ask to place a call. `Err` means the circuit is open and the call
    /// must fail fast with `circuit_open`.
    pub fn try_acquire(&self) -> Result<(), OrchestrationError> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= Duration::from_secs_f64(self.options.cooldown_seconds))
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::debug!("circuit half-open, admitting probe");
                    Ok(())
                } else {
                    Err(OrchestrationError::new(
                        ErrorKind::CircuitOpen,
                        "circuit open, failing fast",
                    ))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(OrchestrationError::new(
                        ErrorKind::CircuitOpen,
                        "probe already in flight",
                    ))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::debug!("circuit closed after successful probe");
            }
            CircuitState::Closed => {
                Self::prune_window(&mut inner.failures, self.options.window_seconds);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::debug!("probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.failures.push_back(Instant::now());
                Self::prune_window(&mut inner.failures, self.options.window_seconds);
                if inner.failures.len() as u32 >= self.options.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.failures.clear();
                    tracing::warn!("failure threshold reached, circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune_window(failures: &mut VecDeque<Instant>, window_seconds: f64) {
        let window = Duration::from_secs_f64(window_seconds);
        while failures
            .front()
            .map(|t| t.elapsed() > window)
            .unwrap_or(false)
        {
            failures.pop_front();
        }
    }
}

/// Shared breakers keyed by (dependency, key), e.g. (`model`, `coder/frontier-1`).
#[derive(Clone)]
pub struct BreakerRegistry {
    options: BreakerOptions,
    breakers: Arc<Mutex<HashMap<(String, String), Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn breaker_for(&self, dependency: &str, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock");
        breakers
            .entry((dependency.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.options.clone())))
            .clone()
    }
}

/// Bounded connection pool. Slots above capacity queue for a short timeout,
/// then fail with `pool_exhausted`. Released slots are kept warm up to
/// `max_keepalive` for `keepalive_ttl`.
#[derive(Clone)]
pub struct ConnectionPool {
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Instant>>>,
}

#[derive(Debug)]
pub struct PooledConnection {
    _permit: OwnedSemaphorePermit,
    pub reused: bool,
    idle: Arc<Mutex<Vec<Instant>>>,
    max_keepalive: usize,
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut idle = self.idle.lock().expect("idle lock");
        if idle.len() < self.max_keepalive {
            idle.push(Instant::now());
        }
    }
}

impl ConnectionPool {
    pub fn new(options: PoolOptions) -> Self {
        let max = options.max_connections.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            idle: Arc::new(Mutex::new(Vec::new())),
            options,
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection, OrchestrationError> {
        let timeout = Duration::from_secs_f64(self.options.queue_timeout_seconds.max(0.0));
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                OrchestrationError::new(ErrorKind::PoolExhausted, "connection queue timed out")
            })?
            .map_err(|_| OrchestrationError::new(ErrorKind::PoolExhausted, "pool closed"))?;

        let ttl = Duration::from_secs_f64(self.options.keepalive_ttl_seconds.max(0.0));
        let reused = {
            let mut idle = self.idle.lock().expect("idle lock");
            idle.retain(|t| t.elapsed() <= ttl);
            idle.pop().is_some()
        };

        Ok(PooledConnection {
            _permit: permit,
            reused,
            idle: self.idle.clone(),
            max_keepalive: self.options.max_keepalive,
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryOptions {
            max_attempts,
            base_delay_seconds: 0.001,
            cap_seconds: 0.01,
        })
    }

    fn quick_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerOptions {
            failure_threshold: 3,
            window_seconds: 60.0,
            cooldown_seconds: 0.05,
        })
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = quick_retry(3)
            .run(|_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OrchestrationError::new(ErrorKind::ServerError, "500"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_fail_without_retry() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = quick_retry(3)
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(OrchestrationError::new(ErrorKind::BadRequest, "400")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::BadRequest);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_are_retried_once_then_surfaced() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = quick_retry(5)
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(OrchestrationError::new(ErrorKind::Timeout, "deadline")) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let policy = RetryPolicy::new(RetryOptions {
            max_attempts: 5,
            base_delay_seconds: 1.0,
            cap_seconds: 3.0,
        });
        let d1 = policy.delay_for_attempt(1).as_secs_f64();
        let d3 = policy.delay_for_attempt(3).as_secs_f64();
        assert!((1.0..2.0).contains(&d1));
        // attempt 3 would be 4s uncapped; cap is 3s plus jitter below 1s
        assert!((3.0..4.0).contains(&d3));
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_admits_one_probe() {
        let breaker = quick_breaker();
        for _ in 0..3 {
            breaker.try_acquire().expect("closed");
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.try_acquire().unwrap_err().kind,
            ErrorKind::CircuitOpen
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        breaker.try_acquire().expect("probe admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // A second caller during the probe fails fast.
        assert_eq!(
            breaker.try_acquire().unwrap_err().kind,
            ErrorKind::CircuitOpen
        );

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.try_acquire().expect("closed again");
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let breaker = quick_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        breaker.try_acquire().expect("probe");
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn breaker_never_moves_closed_to_half_open() {
        let breaker = quick_breaker();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn registry_shares_breakers_per_pair() {
        let registry = BreakerRegistry::new(BreakerOptions::default());
        let a = registry.breaker_for("model", "coder/frontier-1");
        let b = registry.breaker_for("model", "coder/frontier-1");
        let other = registry.breaker_for("model", "reviewer/frontier-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn exhausted_pool_fails_fast_after_queue_timeout() {
        let pool = ConnectionPool::new(PoolOptions {
            max_connections: 1,
            max_keepalive: 1,
            keepalive_ttl_seconds: 30.0,
            queue_timeout_seconds: 0.05,
        });
        let held = pool.acquire().await.expect("first");
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PoolExhausted);
        drop(held);
        pool.acquire().await.expect("freed");
    }

    #[tokio::test]
    async fn released_connections_are_reused_within_ttl() {
        let pool = ConnectionPool::new(PoolOptions::default());
        let first = pool.acquire().await.expect("acquire");
        assert!(!first.reused);
        drop(first);
        let second = pool.acquire().await.expect("acquire");
        assert!(second.reused);
    }
}
