use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Clock abstraction so breaker timing can be driven in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `monitoring_window` that trip the circuit.
    pub failure_threshold: u32,
    pub monitoring_window: Duration,
    /// Time spent OPEN before probing is allowed again.
    pub cooldown: Duration,
    /// Consecutive HALF_OPEN successes required to close.
    pub success_threshold: u32,
    /// Concurrent probe calls admitted while HALF_OPEN.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
            half_open_probes: 2,
        }
    }
}

/// Rejection issued without touching the protected dependency.
#[derive(Debug, thiserror::Error)]
#[error("circuit for {dependency} is open; retry in {retry_in:?}")]
pub struct CircuitOpen {
    pub dependency: String,
    pub retry_in: Duration,
}

/// Read-only view for health endpoints and the degradation controller.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_state_change_millis_ago: u64,
}

struct Shared {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    first_failure_at: AtomicU64,
    opened_at: AtomicU64,
    half_open_in_flight: AtomicU32,
    half_open_successes: AtomicU32,
    last_state_change: AtomicU64,
}

/// Per-dependency failure isolation. All transitions are CAS-based so the
/// breaker is safe under concurrent use without a lock.
///
/// Callers must pair every successful `try_acquire` with exactly one
/// `record_success` or `record_failure`.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    shared: Arc<Shared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, MonotonicClock::default())
    }

    pub fn with_clock<C: Clock + 'static>(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicU32::new(0),
                first_failure_at: AtomicU64::new(0),
                opened_at: AtomicU64::new(0),
                half_open_in_flight: AtomicU32::new(0),
                half_open_successes: AtomicU32::new(0),
                last_state_change: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(clock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// O(1) admission check; never touches the protected dependency.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Ok(()),
                STATE_OPEN => {
                    let now = self.clock.now_millis();
                    let opened_at = self.shared.opened_at.load(Ordering::Acquire);
                    let elapsed = now.saturating_sub(opened_at);
                    let cooldown = self.config.cooldown.as_millis() as u64;
                    if elapsed < cooldown {
                        return Err(CircuitOpen {
                            dependency: self.name.clone(),
                            retry_in: Duration::from_millis(cooldown - elapsed),
                        });
                    }
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // we won the transition and take the first probe slot
                            self.shared.half_open_in_flight.store(1, Ordering::Release);
                            self.shared.half_open_successes.store(0, Ordering::Release);
                            self.mark_state_change(now);
                            tracing::info!(dependency = %self.name, "circuit half-open");
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.shared.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_probes {
                        self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        return Err(CircuitOpen {
                            dependency: self.name.clone(),
                            retry_in: self.config.cooldown,
                        });
                    }
                    return Ok(());
                }
                _ => unreachable!("invalid circuit state"),
            }
        }
    }

    pub fn record_success(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                let successes = self.shared.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    self.shared.first_failure_at.store(0, Ordering::Release);
                    self.mark_state_change(self.clock.now_millis());
                    tracing::info!(dependency = %self.name, "circuit closed");
                }
            }
            STATE_CLOSED => {
                self.shared.consecutive_failures.store(0, Ordering::Release);
                self.shared.first_failure_at.store(0, Ordering::Release);
            }
            // a success that raced the trip; the probe cycle will confirm
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                self.shared.half_open_in_flight.fetch_sub(1, Ordering::Release);
                self.shared.half_open_successes.store(0, Ordering::Release);
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.opened_at.store(now, Ordering::Release);
                    self.mark_state_change(now);
                    tracing::warn!(dependency = %self.name, "circuit re-opened from half-open");
                }
            }
            STATE_CLOSED => {
                let window = self.config.monitoring_window.as_millis() as u64;
                let first = self.shared.first_failure_at.load(Ordering::Acquire);
                let failures = if first == 0 || now.saturating_sub(first) > window {
                    // stale run; this failure starts a fresh window
                    self.shared.first_failure_at.store(now, Ordering::Release);
                    self.shared.consecutive_failures.store(1, Ordering::Release);
                    1
                } else {
                    self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
                };
                if failures >= self.config.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.opened_at.store(now, Ordering::Release);
                    self.mark_state_change(now);
                    tracing::warn!(
                        dependency = %self.name,
                        consecutive_failures = failures,
                        "circuit opened"
                    );
                }
            }
            _ => {}
        }
    }

    /// Non-consuming admission peek: whether `try_acquire` would currently
    /// admit a call. OPEN counts as available once its cooldown has elapsed
    /// (the acquire itself performs the half-open transition); HALF_OPEN is
    /// available only below the probe cap.
    pub fn has_capacity(&self) -> bool {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_OPEN => {
                let opened_at = self.shared.opened_at.load(Ordering::Acquire);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                elapsed >= self.config.cooldown.as_millis() as u64
            }
            STATE_HALF_OPEN => {
                self.shared.half_open_in_flight.load(Ordering::Acquire)
                    < self.config.half_open_probes
            }
            _ => unreachable!("invalid circuit state"),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit state"),
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now_millis();
        CircuitSnapshot {
            state: self.state(),
            consecutive_failures: self.shared.consecutive_failures.load(Ordering::Acquire),
            last_state_change_millis_ago: now
                .saturating_sub(self.shared.last_state_change.load(Ordering::Acquire)),
        }
    }

    fn mark_state_change(&self, now: u64) {
        self.shared.last_state_change.store(now, Ordering::Release);
    }
}

/// Breakers keyed by dependency name. Built once at startup; the set of
/// dependencies does not change at runtime.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(names: impl IntoIterator<Item = String>, config: CircuitBreakerConfig) -> Self {
        let breakers = names
            .into_iter()
            .map(|name| (name.clone(), CircuitBreaker::new(name, config.clone())))
            .collect();
        Self {
            breakers: Arc::new(breakers),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(name)
    }

    pub fn snapshot_all(&self) -> HashMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }
}
