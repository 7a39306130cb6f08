//! Process-wide circuit breakers keyed by dependency name

use async_trait::async_trait;
use cadence_core::{Classify, SharedClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::circuit_breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitBreakerState, CircuitStats};

/// Durable home for breaker snapshots
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    async fn save_breakers(&self, states: &[CircuitBreakerState]) -> Result<(), String>;
    async fn load_breakers(&self) -> Result<Vec<CircuitBreakerState>, String>;
}

/// In-memory snapshot store (for testing)
#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    states: RwLock<HashMap<String, CircuitBreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStateStore for MemoryBreakerStore {
    async fn save_breakers(&self, states: &[CircuitBreakerState]) -> Result<(), String> {
        let mut map = self.states.write();
        for state in states {
            map.insert(state.dependency.clone(), state.clone());
        }
        Ok(())
    }

    async fn load_breakers(&self) -> Result<Vec<CircuitBreakerState>, String> {
        Ok(self.states.read().values().cloned().collect())
    }
}

/// Shared breakers, one per dependency name, created lazily.
///
/// Breaker state lives here rather than on jobs, so every worker calling
/// `"llm-api"` sees the same circuit.
#[derive(Debug)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Use a dedicated config for one dependency
    pub fn with_override(mut self, dependency: &str, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency.to_string(), config);
        self
    }

    fn config_for(&self, dependency: &str) -> BreakerConfig {
        self.overrides
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Get or create the breaker for `dependency`
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(dependency) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency,
                    self.config_for(dependency),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Call `fut` through the breaker for `dependency`
    pub async fn call<F, T, E>(&self, dependency: &str, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let breaker = self.get(dependency);
        breaker.call(fut).await
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        states
    }

    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Replace in-memory breakers with persisted snapshots
    pub fn restore(&self, states: Vec<CircuitBreakerState>) {
        let mut breakers = self.breakers.write();
        for state in states {
            let name = state.dependency.clone();
            let config = self.config_for(&name);
            tracing::debug!(circuit = %name, state = state.state.as_str(), "Restoring circuit state");
            breakers.insert(
                name,
                Arc::new(CircuitBreaker::from_state(state, config, self.clock.clone())),
            );
        }
    }

    pub async fn persist(&self, store: &dyn BreakerStateStore) -> Result<usize, String> {
        let states = self.snapshot();
        store.save_breakers(&states).await?;
        Ok(states.len())
    }

    pub async fn restore_from(&self, store: &dyn BreakerStateStore) -> Result<usize, String> {
        let states = store.load_breakers().await?;
        let count = states.len();
        self.restore(states);
        Ok(count)
    }
}
