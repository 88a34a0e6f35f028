//! Registry of named circuit breakers.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Owns one breaker per guarded operation name.
///
/// Breakers are created lazily on first use and live as long as the registry.
/// Each registry is independent, so tests can build isolated instances.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose breakers share `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `name`, creating it if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config.clone()))
            })
            .clone()
    }

    /// Returns the breaker for `name` if one was created.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Snapshots every registered breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Resets every registered breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    /// Number of breakers created so far.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Returns true if no breaker has been created.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;

    #[test]
    fn test_get_or_create_caches_instances() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("webhook-processing");
        let b = registry.get_or_create("webhook-processing");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_breakers_are_isolated_per_name() {
        let registry = CircuitBreakerRegistry::default();
        let webhook = registry.get_or_create("webhook-processing");
        let reminder = registry.get_or_create("reminder-processing");

        assert!(!Arc::ptr_eq(&webhook, &reminder));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_registries_do_not_share_state() {
        let first = CircuitBreakerRegistry::default();
        let second = CircuitBreakerRegistry::default();
        first.get_or_create("webhook-processing");

        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_snapshots_and_reset_all() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let breaker = registry.get_or_create("reminder-processing");
        registry.get_or_create("webhook-processing");
        let _ = breaker.call(|| async { Err::<(), &str>("down") }).await;

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].name, "reminder-processing");
        assert_eq!(snapshots[0].state, CircuitState::Open);
        assert_eq!(snapshots[1].state, CircuitState::Closed);

        registry.reset_all();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
