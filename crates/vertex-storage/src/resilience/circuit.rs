//! Per-connection circuit breaker.
//!
//! State lives behind a plain mutex that is never held across an await, so
//! the permit guard can settle an abandoned call from `Drop`.

use crate::traits::{StorageError, StorageResult};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;
use vertex_core::StorageConfig;

const DEFAULT_SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&StorageConfig> for BreakerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// How a finished call is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Caller error or cancellation; says nothing about backend health
    Neutral,
}

impl Outcome {
    fn of<T>(result: &StorageResult<T>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_backend_answer() => Outcome::Success,
            Err(e) if e.is_backend_failure() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub connection_id: Uuid,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub open_for_ms: Option<u64>,
}

/// Circuit breaker for a single connection
#[derive(Debug)]
pub struct CircuitBreaker {
    connection_id: Uuid,
    config: BreakerConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(connection_id: Uuid, config: BreakerConfig) -> Self {
        Self {
            connection_id,
            config,
            state: Mutex::new(CircuitState {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Time since the breaker last opened, while it is not closed
    pub fn open_for(&self) -> Option<Duration> {
        let state = self.lock();
        match state.state {
            BreakerState::Closed => None,
            _ => state.opened_at.map(|at| at.elapsed()),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            connection_id: self.connection_id,
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            open_for_ms: match state.state {
                BreakerState::Closed => None,
                _ => state.opened_at.map(|at| at.elapsed().as_millis() as u64),
            },
        }
    }

    /// Run `call` under the breaker. Short-circuits with `CircuitOpen` without
    /// polling `call` when the circuit does not admit it.
    pub async fn call<T, F>(&self, call: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let mut permit = self.admit()?;
        let result = call.await;
        permit.settle(Outcome::of(&result));
        result
    }

    fn admit(&self) -> StorageResult<Permit<'_>> {
        let mut state = self.lock();
        match state.state {
            BreakerState::Closed => Ok(Permit {
                breaker: self,
                probe: None,
                settled: false,
            }),
            BreakerState::Open => {
                let opened_at = state.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() < self.config.cooldown {
                    return Err(StorageError::CircuitOpen {
                        connection_id: self.connection_id,
                    });
                }
                state.state = BreakerState::HalfOpen;
                tracing::info!(
                    connection_id = %self.connection_id,
                    open_for_ms = opened_at.elapsed().as_millis() as u64,
                    "Circuit breaker half-open, admitting probe"
                );
                Ok(Permit {
                    breaker: self,
                    probe: Some(opened_at),
                    settled: false,
                })
            }
            // One probe at a time.
            BreakerState::HalfOpen => Err(StorageError::CircuitOpen {
                connection_id: self.connection_id,
            }),
        }
    }

    fn record(&self, outcome: Outcome, probe: Option<Instant>) {
        let mut state = self.lock();

        match (probe, outcome) {
            (Some(_), Outcome::Success) => {
                state.state = BreakerState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                tracing::info!(
                    connection_id = %self.connection_id,
                    "Circuit breaker closed after successful probe"
                );
            }
            (Some(_), Outcome::Failure) => {
                state.state = BreakerState::Open;
                state.opened_at = Some(Instant::now());
                tracing::warn!(
                    connection_id = %self.connection_id,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker probe failed, reopening"
                );
            }
            // Probe abandoned: the next caller may probe straight away.
            (Some(opened_at), Outcome::Neutral) => {
                state.state = BreakerState::Open;
                state.opened_at = Some(opened_at);
            }
            // Calls admitted while closed only count while still closed.
            (None, _) if state.state != BreakerState::Closed => {}
            (None, Outcome::Success) => state.consecutive_failures = 0,
            (None, Outcome::Failure) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = BreakerState::Open;
                    state.opened_at = Some(Instant::now());
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        consecutive_failures = state.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            (None, Outcome::Neutral) => {}
        }
    }
}

/// Admission to run one call. An unsettled permit counts as cancelled.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    /// `openedAt` of the circuit this probe is testing
    probe: Option<Instant>,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome, self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(Outcome::Neutral, self.probe);
        }
    }
}

/// Owns one [`CircuitBreaker`] per connection id.
///
/// Breakers are created on first access and live for the process lifetime.
/// Sharded so that unrelated connections rarely contend on the same lock.
#[derive(Debug)]
pub struct CircuitRegistry {
    shards: Vec<Mutex<HashMap<Uuid, Arc<CircuitBreaker>>>>,
    config: BreakerConfig,
}

impl CircuitRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_shards(config, DEFAULT_SHARD_COUNT)
    }

    pub fn with_shards(config: BreakerConfig, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards, config }
    }

    fn shard(&self, connection_id: &Uuid) -> MutexGuard<'_, HashMap<Uuid, Arc<CircuitBreaker>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        connection_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Breaker for `connection_id`, created closed on first access
    pub fn breaker(&self, connection_id: Uuid) -> Arc<CircuitBreaker> {
        self.shard(&connection_id)
            .entry(connection_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(connection_id, self.config)))
            .clone()
    }

    /// Breaker for `connection_id` if one was ever created
    pub fn get(&self, connection_id: Uuid) -> Option<Arc<CircuitBreaker>> {
        self.shard(&connection_id).get(&connection_id).cloned()
    }

    pub fn remove(&self, connection_id: Uuid) {
        self.shard(&connection_id).remove(&connection_id);
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .values()
                    .map(|b| b.snapshot())
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|s| s.connection_id);
        all
    }
}
