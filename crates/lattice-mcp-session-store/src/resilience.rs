//! Retry and circuit-breaker wrappers around a storage adapter.
//!
//! Every call from the upper layers passes through [`ResilientStore`], which
//! applies a per-attempt timeout, bounded retry with jittered exponential
//! backoff, and an instance-local circuit breaker. Only `Unavailable`
//! outcomes are retried or counted against the breaker; definitive outcomes
//! (`NotFound`, `Exists`, `Conflict`, `Held`) prove the backend is reachable
//! and return immediately.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::record::{EventBody, EventRecord, SessionRecord};
use crate::traits::{SessionStore, StoreError, StoreResult};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failure mode, calls are rejected without touching the backend.
    Open,
    /// Recovery mode, a single probe is in flight.
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            STATE_OPEN => Self::Open,
            STATE_HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl From<BreakerState> for u8 {
    fn from(value: BreakerState) -> Self {
        match value {
            BreakerState::Closed => STATE_CLOSED,
            BreakerState::Open => STATE_OPEN,
            BreakerState::HalfOpen => STATE_HALF_OPEN,
        }
    }
}

struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Instant,
    probe_in_flight: bool,
}

/// Instance-local circuit breaker counting consecutive transient failures.
///
/// Closed -> Open after `failure_threshold` consecutive failures; Open
/// rejects until `cooldown` has elapsed, then admits exactly one half-open
/// probe. Probe success closes the breaker, probe failure reopens it with
/// the cooldown refreshed. No cross-node coordination.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: AtomicU8::new(STATE_CLOSED),
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// once the cooldown has elapsed and reserves the single probe slot.
    pub fn should_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match BreakerState::from(self.state.load(Ordering::Acquire)) {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.cooldown {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a reachable backend (success or definitive error).
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    /// Record a transient failure.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match BreakerState::from(self.state.load(Ordering::Acquire)) {
            BreakerState::HalfOpen => {
                warn!("circuit breaker reopened after failed probe");
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, inner: &mut BreakerInner, new_state: BreakerState) {
        let previous = BreakerState::from(self.state.swap(new_state.into(), Ordering::AcqRel));
        inner.opened_at = Instant::now();
        inner.probe_in_flight = false;
        if matches!(new_state, BreakerState::Closed) {
            inner.consecutive_failures = 0;
        }
        if previous != new_state {
            info!(?previous, ?new_state, "circuit breaker transitioned");
        }
    }
}

/// Backoff schedule with full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.cap).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=capped))
    }
}

/// A `SessionStore` decorator adding timeout, retry, and breaker guards.
pub struct ResilientStore {
    inner: Arc<dyn SessionStore>,
    retry: RetryPolicy,
    op_timeout: Duration,
    breaker: CircuitBreaker,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn SessionStore>, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts.max(1),
                base: Duration::from_millis(config.retry_base_ms),
                cap: Duration::from_millis(config.retry_cap_ms),
            },
            op_timeout: Duration::from_millis(config.op_timeout_ms),
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                Duration::from_millis(config.breaker_cooldown_ms),
            ),
        }
    }

    /// Current breaker state, for diagnostics.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.should_attempt() {
                return Err(StoreError::Unavailable("circuit breaker open".to_string()));
            }
            attempt += 1;

            let outcome = match tokio::time::timeout(self.op_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "{op} timed out after {:?}",
                    self.op_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() => {
                    self.breaker.on_failure();
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay(attempt);
                    debug!(op, attempt, ?delay, "transient store failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // Definitive outcome: the backend answered.
                    self.breaker.on_success();
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl SessionStore for ResilientStore {
    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        self.run("get_session", || self.inner.get_session(id)).await
    }

    async fn put_session_if_absent(&self, record: SessionRecord) -> StoreResult<()> {
        self.run("put_session_if_absent", || {
            self.inner.put_session_if_absent(record.clone())
        })
        .await
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        record: SessionRecord,
    ) -> StoreResult<u64> {
        self.run("update_session_cas", || {
            self.inner
                .update_session_cas(id, expected_version, record.clone())
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.run("delete_session", || self.inner.delete_session(id))
            .await
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: &str,
        event: EventBody,
    ) -> StoreResult<u64> {
        self.run("append_event", || {
            self.inner.append_event(session_id, stream_key, event.clone())
        })
        .await
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: &str,
        after_id: Option<u64>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        self.run("read_events", || {
            self.inner.read_events(session_id, stream_key, after_id, limit)
        })
        .await
    }

    async fn latest_event_id(
        &self,
        session_id: &str,
        stream_key: &str,
    ) -> StoreResult<Option<u64>> {
        self.run("latest_event_id", || {
            self.inner.latest_event_id(session_id, stream_key)
        })
        .await
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: &str,
        max_len: usize,
    ) -> StoreResult<()> {
        self.run("trim_stream", || {
            self.inner.trim_stream(session_id, stream_key, max_len)
        })
        .await
    }

    async fn acquire_lock(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.run("acquire_lock", || self.inner.acquire_lock(name, holder_id, ttl))
            .await
    }

    async fn release_lock(&self, name: &str, holder_id: &str) -> StoreResult<()> {
        self.run("release_lock", || self.inner.release_lock(name, holder_id))
            .await
    }

    fn now_millis(&self) -> u64 {
        self.inner.now_millis()
    }

    async fn is_healthy(&self) -> bool {
        self.inner.is_healthy().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}
