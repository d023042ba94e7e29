use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_half_open_max_requests() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_timeout_seconds(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const TAG_CLOSED: u8 = 0;
const TAG_OPEN: u8 = 1;
const TAG_HALF_OPEN: u8 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_epoch_seconds: Option<u64>,
    pub half_open_probes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_epoch_seconds: Option<u64>,
    half_open_probes: u32,
}

/// Per-upstream health state machine (CLOSED/OPEN/HALF_OPEN) with
/// consecutive-failure semantics. All mutation happens under one mutex
/// scoped to this breaker; the hot-path health read checks an atomic
/// state tag first so CLOSED traffic never takes the lock. OPEN turns
/// into HALF_OPEN lazily from `last_failure_epoch_seconds`, no timer.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state_tag: AtomicU8,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state_tag: AtomicU8::new(TAG_CLOSED),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_epoch_seconds: None,
                half_open_probes: 0,
            }),
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_tag(&self, state: BreakerState) {
        let tag = match state {
            BreakerState::Closed => TAG_CLOSED,
            BreakerState::Open => TAG_OPEN,
            BreakerState::HalfOpen => TAG_HALF_OPEN,
        };
        self.state_tag.store(tag, Ordering::Release);
    }

    /// State the breaker would be in right now, without committing the
    /// lazy OPEN -> HALF_OPEN transition. Probe and success counters were
    /// already reset when the breaker entered OPEN, so reading the
    /// not-yet-committed HALF_OPEN state is consistent.
    fn effective_state(&self, inner: &BreakerInner) -> BreakerState {
        if inner.state == BreakerState::Open {
            if let Some(last_failure) = inner.last_failure_epoch_seconds {
                let elapsed = self.clock.now_epoch_seconds().saturating_sub(last_failure);
                if elapsed >= self.config.timeout_seconds {
                    return BreakerState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Commits the lazy OPEN -> HALF_OPEN transition if it is due.
    fn settle(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open
            && self.effective_state(inner) == BreakerState::HalfOpen
        {
            inner.state = BreakerState::HalfOpen;
            inner.success_count = 0;
            inner.half_open_probes = 0;
            self.store_tag(BreakerState::HalfOpen);
            tracing::info!("circuit breaker transitioning to half-open");
        }
    }

    /// Pure health read used by selection and dry runs: no state is
    /// committed. CLOSED admits, OPEN denies, HALF_OPEN admits while the
    /// probe budget has headroom.
    pub fn is_healthy(&self) -> bool {
        if self.state_tag.load(Ordering::Acquire) == TAG_CLOSED {
            return true;
        }
        let inner = self.lock();
        match self.effective_state(&inner) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => inner.half_open_probes < self.config.half_open_max_requests,
        }
    }

    /// Admission gate for an actual request. Unlike `is_healthy` this
    /// commits the half-open transition and claims one probe slot.
    pub fn on_request_start(&self) -> bool {
        if self.state_tag.load(Ordering::Acquire) == TAG_CLOSED {
            return true;
        }
        let mut inner = self.lock();
        self.settle(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_probes < self.config.half_open_max_requests {
                    inner.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.settle(&mut inner);
        match inner.state {
            BreakerState::Closed => {
                // Consecutive-failure semantics: any success resets the streak.
                inner.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_probes = 0;
                    inner.last_failure_epoch_seconds = None;
                    self.store_tag(BreakerState::Closed);
                    tracing::info!("circuit breaker closed after successful probes");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.settle(&mut inner);
        let now = self.clock.now_epoch_seconds();
        inner.last_failure_epoch_seconds = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip_open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                // A single probe failure reopens immediately, discarding
                // accumulated successes.
                self.trip_open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    fn trip_open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.success_count = 0;
        inner.half_open_probes = 0;
        self.store_tag(BreakerState::Open);
        tracing::warn!(
            failure_threshold = self.config.failure_threshold,
            "circuit breaker opened"
        );
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        self.effective_state(&inner)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_epoch_seconds: inner.last_failure_epoch_seconds,
            half_open_probes: inner.half_open_probes,
        }
    }
}

/// Owns one breaker per upstream id, created lazily. Constructed and
/// injected explicitly; breaker state lives for the life of the registry
/// and is never persisted.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.snapshots())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, upstream_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(upstream_id).cloned()
    }

    pub fn get_or_create(
        &self,
        upstream_id: &str,
        config: Option<&CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock();
        breakers
            .entry(upstream_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    config.cloned().unwrap_or_default(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Fail-open by policy: an upstream with no breaker yet has never
    /// failed, so it is healthy. A breaker only exists once traffic has
    /// been recorded against the upstream.
    pub fn is_healthy(&self, upstream_id: &str) -> bool {
        self.get(upstream_id)
            .map(|breaker| breaker.is_healthy())
            .unwrap_or(true)
    }

    pub fn snapshots(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.lock()
            .iter()
            .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
            .collect()
    }
}
