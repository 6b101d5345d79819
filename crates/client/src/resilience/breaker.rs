//! Per-origin circuit breaker.
//!
//! # States
//! - Closed: normal operation, retryable failures are counted
//! - Open: origin assumed down, calls fail fast with `CircuitOpen`
//! - Half-Open: a bounded number of probes test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive retryable failures >= threshold
//! Open → Half-Open: first call after the cooldown has elapsed
//! Half-Open → Closed: 2 consecutive probe successes
//! Half-Open → Open: any probe failure (cooldown restarts)
//! ```
//!
//! A success while Closed decays the failure count by one instead of clearing
//! it. Non-retryable failures (4xx, policy blocks, cancellation) never touch
//! the state.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use ripfetch_core::{AppConfig, ClassifiedError};
use tokio::time::Instant;
use url::Url;

/// Probe successes needed to close a half-open circuit.
const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive retryable failures that open the circuit (default: 5)
    pub failure_threshold: u32,
    /// Time spent open before probing (default: 60s)
    pub cooldown: Duration,
    /// Concurrent probes allowed while half-open (default: 1)
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for BreakerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_threshold,
            cooldown: Duration::from_millis(config.circuit_breaker_cooldown_ms),
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug)]
struct OriginCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    half_open_probes: u32,
    half_open_successes: u32,
    /// Bumped on every transition so stale probes can be recognized.
    generation: u64,
}

impl OriginCircuit {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition: now,
            half_open_probes: 0,
            half_open_successes: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, origin: &str, to: CircuitState, now: Instant) {
        tracing::info!(
            %origin,
            from = ?self.state,
            to = ?to,
            failures = self.consecutive_failures,
            "circuit state changed"
        );
        self.state = to;
        self.last_transition = now;
        self.half_open_probes = 0;
        self.half_open_successes = 0;
        self.generation += 1;
        if to == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe { generation: u64 },
}

/// Origin key for a URL: its lowercased host, or the raw input if it has none.
pub fn origin_key(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .unwrap_or_else(|| url.to_string())
}

/// Failure-isolation state machine, one circuit per origin.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: DashMap<String, OriginCircuit>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, circuits: DashMap::new() }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `op` if the circuit for `url`'s origin admits it, recording the outcome.
    ///
    /// Rejected calls return `CircuitOpen` without running `op`.
    pub async fn execute<T, F, Fut>(&self, url: &str, op: F) -> Result<T, ClassifiedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let origin = origin_key(url);
        let admission = self.admit(&origin)?;

        let mut guard = ProbeGuard { breaker: self, origin: &origin, admission: Some(admission) };
        let result = op().await;
        guard.admission = None;

        self.record(&origin, admission, &result);
        result
    }

    /// Current state for `url`'s origin. Unknown origins are `Closed`.
    ///
    /// Does not perform the lazy Open → Half-Open check.
    pub fn state(&self, url: &str) -> CircuitState {
        self.circuits
            .get(&origin_key(url))
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Forget the circuit for `url`'s origin.
    pub fn reset(&self, url: &str) {
        let origin = origin_key(url);
        if self.circuits.remove(&origin).is_some() {
            tracing::info!(%origin, "circuit reset");
        }
    }

    /// Forget every circuit.
    pub fn reset_all(&self) {
        self.circuits.clear();
        tracing::info!("all circuits reset");
    }

    /// `(origin, state, consecutive failures)` for every known origin.
    pub fn snapshot(&self) -> Vec<(String, CircuitState, u32)> {
        let mut all: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.state, entry.consecutive_failures))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn admit(&self, origin: &str) -> Result<Admission, ClassifiedError> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(origin.to_string())
            .or_insert_with(|| OriginCircuit::new(now));

        if circuit.state == CircuitState::Open {
            if now.duration_since(circuit.last_transition) < self.config.cooldown {
                tracing::debug!(%origin, "circuit open, rejecting call");
                return Err(ClassifiedError::circuit_open(origin));
            }
            circuit.transition(origin, CircuitState::HalfOpen, now);
        }

        if circuit.state == CircuitState::HalfOpen {
            if circuit.half_open_probes >= self.config.half_open_max_attempts {
                tracing::debug!(%origin, probes = circuit.half_open_probes, "half-open probe limit reached");
                return Err(ClassifiedError::circuit_open(origin));
            }
            circuit.half_open_probes += 1;
            return Ok(Admission::Probe { generation: circuit.generation });
        }

        Ok(Admission::Normal)
    }

    fn record<T>(&self, origin: &str, admission: Admission, result: &Result<T, ClassifiedError>) {
        let now = Instant::now();
        let Some(mut circuit) = self.circuits.get_mut(origin) else {
            // reset while the call was in flight
            return;
        };

        let current_probe = match admission {
            Admission::Probe { generation } if generation == circuit.generation => {
                circuit.half_open_probes = circuit.half_open_probes.saturating_sub(1);
                true
            }
            _ => false,
        };

        match result {
            Ok(_) => match circuit.state {
                CircuitState::Closed => {
                    circuit.consecutive_failures = circuit.consecutive_failures.saturating_sub(1);
                }
                CircuitState::HalfOpen if current_probe => {
                    circuit.half_open_successes += 1;
                    if circuit.half_open_successes >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                        circuit.transition(origin, CircuitState::Closed, now);
                    }
                }
                _ => {}
            },
            Err(err) if err.retryable() => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
                match circuit.state {
                    CircuitState::Closed if circuit.consecutive_failures >= self.config.failure_threshold => {
                        circuit.transition(origin, CircuitState::Open, now);
                    }
                    // only probe outcomes move a half-open circuit
                    CircuitState::HalfOpen if current_probe => circuit.transition(origin, CircuitState::Open, now),
                    _ => {}
                }
            }
            Err(_) => {}
        }
    }

    fn release_probe(&self, origin: &str, generation: u64) {
        if let Some(mut circuit) = self.circuits.get_mut(origin)
            && circuit.generation == generation
        {
            circuit.half_open_probes = circuit.half_open_probes.saturating_sub(1);
        }
    }
}

/// Returns a half-open probe slot if the call is dropped before completing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    origin: &'a str,
    admission: Option<Admission>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(Admission::Probe { generation }) = self.admission {
            tracing::debug!(origin = %self.origin, "probe abandoned, releasing slot");
            self.breaker.release_probe(self.origin, generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripfetch_core::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
            half_open_max_attempts: 1,
        })
    }

    async fn fail(b: &CircuitBreaker, url: &str, calls: &AtomicU32) -> Result<(), ClassifiedError> {
        b.execute(url, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ClassifiedError::new(ErrorKind::ConnectionError, "refused"))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, url: &str, calls: &AtomicU32) -> Result<(), ClassifiedError> {
        b.execute(url, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[test]
    fn test_origin_key() {
        assert_eq!(origin_key("https://A.test/p1"), "a.test");
        assert_eq!(origin_key("https://a.test:8443/p2?q=1"), "a.test");
        assert_eq!(origin_key("not a url"), "not a url");
    }

    #[test]
    fn test_breaker_config_default() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_millis(60_000));
        assert_eq!(config.half_open_max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_transport() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        let url = "https://a.test/x";

        for _ in 0..3 {
            assert!(fail(&b, url, &calls).await.is_err());
        }
        assert_eq!(b.state(url), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let err = succeed(&b, url, &calls).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failures_never_open() {
        let b = breaker(2);
        for _ in 0..20 {
            let _ = b
                .execute("https://a.test/missing", || async {
                    Err::<(), _>(ClassifiedError::http("https://a.test/missing", 404, "Not Found"))
                })
                .await;
        }
        assert_eq!(b.state("https://a.test/"), CircuitState::Closed);
        assert_eq!(b.snapshot(), vec![("a.test".to_string(), CircuitState::Closed, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decays_failure_count() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        let _ = fail(&b, url, &calls).await;
        let _ = fail(&b, url, &calls).await;
        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.snapshot()[0].2, 1);

        // one more failure reaches 2, still below the threshold
        let _ = fail(&b, url, &calls).await;
        assert_eq!(b.state(url), CircuitState::Closed);

        let _ = fail(&b, url, &calls).await;
        assert_eq!(b.state(url), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_never_below_zero() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            succeed(&b, "https://a.test/", &calls).await.unwrap();
        }
        assert_eq!(b.snapshot()[0].2, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_two_successes() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        let _ = fail(&b, url, &calls).await;
        assert_eq!(b.state(url), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        // lazily evaluated: still reported open until a call arrives
        assert_eq!(b.state(url), CircuitState::Open);

        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::HalfOpen);

        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        let _ = fail(&b, url, &calls).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = fail(&b, url, &calls).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionError);
        assert_eq!(b.state(url), CircuitState::Open);

        // the cooldown restarted at the probe failure
        tokio::time::advance(Duration::from_secs(30)).await;
        let err = succeed(&b, url, &calls).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);

        tokio::time::advance(Duration::from_secs(31)).await;
        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let b = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        let _ = fail(&b, url, &calls).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(url, || async move {
                    let _ = release_rx.await;
                    Ok::<_, ClassifiedError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(url), CircuitState::HalfOpen);

        // the single probe slot is taken
        let err = succeed(&b, url, &calls).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();

        // slot freed, second probe success closes the circuit
        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_reopen_half_open() {
        let b = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        // admitted while closed, fails only once the circuit is half-open
        let (fail_tx, fail_rx) = tokio::sync::oneshot::channel::<()>();
        let stale = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(url, || async move {
                    let _ = fail_rx.await;
                    Err::<(), _>(ClassifiedError::new(ErrorKind::ConnectionError, "reset"))
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        let _ = fail(&b, url, &calls).await;
        assert_eq!(b.state(url), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(61)).await;
        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::HalfOpen);

        fail_tx.send(()).unwrap();
        assert_eq!(stale.await.unwrap().unwrap_err().kind(), ErrorKind::ConnectionError);
        assert_eq!(b.state(url), CircuitState::HalfOpen);

        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_releases_slot() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        let url = "https://a.test/";

        let _ = fail(&b, url, &calls).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        // a probe that never completes, dropped by a timeout
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            b.execute(url, || std::future::pending::<Result<(), ClassifiedError>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(b.state(url), CircuitState::HalfOpen);

        succeed(&b, url, &calls).await.unwrap();
        succeed(&b, url, &calls).await.unwrap();
        assert_eq!(b.state(url), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_origin_isolation() {
        let b = breaker(2);
        let calls = AtomicU32::new(0);

        let _ = fail(&b, "https://a.test/p1", &calls).await;
        let _ = fail(&b, "https://a.test/p2", &calls).await;

        let other = succeed(&b, "https://b.test/", &calls).await;
        assert!(other.is_ok());
        assert_eq!(b.state("https://a.test/anything"), CircuitState::Open);
        assert_eq!(b.state("https://b.test/"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_each_counted() {
        let b = Arc::new(breaker(5));
        let mut handles = Vec::new();
        for i in 0..5 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.execute(&format!("https://a.test/{i}"), || async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Err::<(), _>(ClassifiedError::new(ErrorKind::NetworkTimeout, "slow"))
                })
                .await
            }));
        }
        for h in handles {
            let _ = h.await.unwrap();
        }
        assert_eq!(b.state("https://a.test/"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        let _ = fail(&b, "https://a.test/", &calls).await;
        let _ = fail(&b, "https://b.test/", &calls).await;

        b.reset("https://a.test/other");
        assert_eq!(b.state("https://a.test/"), CircuitState::Closed);
        assert_eq!(b.state("https://b.test/"), CircuitState::Open);

        b.reset_all();
        assert_eq!(b.state("https://b.test/"), CircuitState::Closed);
        assert!(b.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_calls_do_not_count() {
        let b = breaker(1);
        let _ = b
            .execute("https://a.test/", || async {
                Err::<(), _>(ClassifiedError::cancelled("caller went away"))
            })
            .await;
        assert_eq!(b.state("https://a.test/"), CircuitState::Closed);
    }
}
