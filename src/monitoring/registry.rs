// src/monitoring/registry.rs
//! Counting registry of live component instances
//!
//! Components that must exist at most N times per process (the collector,
//! the health checker) or that should be released promptly (execution
//! engines) register here and hold an [`InstanceGuard`]. Dropping the guard
//! deregisters the instance. The singleton probe and the leak probe read
//! counts from this registry.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const COLLECTOR_INSTANCE: &str = "IsolationMetricsCollector";
pub const HEALTH_CHECKER_INSTANCE: &str = "IsolationHealthChecker";
pub const ENGINE_INSTANCE: &str = "ExecutionEngine";

/// A singleton type with more live instances than allowed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingletonBreach {
    pub type_name: &'static str,
    pub live: usize,
    pub allowed: usize,
}

/// Registry of live instances by type and owner
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    live: DashMap<&'static str, usize>,
    owners: DashMap<(&'static str, String), usize>,
    singletons: DashMap<&'static str, usize>,
    registered_total: AtomicU64,
}

impl InstanceRegistry {
    /// Registry with the engine's own singletons declared
    pub fn new() -> Arc<Self> {
        let registry = Self::default();
        registry.declare_singleton(COLLECTOR_INSTANCE, 1);
        registry.declare_singleton(HEALTH_CHECKER_INSTANCE, 1);
        Arc::new(registry)
    }

    /// Allow at most `max` live instances of `type_name`
    pub fn declare_singleton(&self, type_name: &'static str, max: usize) {
        self.singletons.insert(type_name, max);
    }

    /// Count a new live instance until the returned guard drops
    pub fn register(self: &Arc<Self>, type_name: &'static str, owner: Option<&str>) -> InstanceGuard {
        *self.live.entry(type_name).or_insert(0) += 1;
        if let Some(owner) = owner {
            *self.owners.entry((type_name, owner.to_string())).or_insert(0) += 1;
        }
        self.registered_total.fetch_add(1, Ordering::Relaxed);

        InstanceGuard {
            registry: Arc::clone(self),
            type_name,
            owner: owner.map(str::to_string),
        }
    }

    fn deregister(&self, type_name: &'static str, owner: Option<&str>) {
        if let Some(mut count) = self.live.get_mut(type_name) {
            *count = count.saturating_sub(1);
        }
        if let Some(owner) = owner {
            let key = (type_name, owner.to_string());
            let now_empty = match self.owners.get_mut(&key) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if now_empty {
                self.owners.remove_if(&key, |_, count| *count == 0);
            }
        }
    }

    pub fn live_count(&self, type_name: &str) -> usize {
        self.live.get(type_name).map(|c| *c).unwrap_or(0)
    }

    pub fn owner_count(&self, type_name: &'static str, owner: &str) -> usize {
        self.owners
            .get(&(type_name, owner.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Live instance counts by type
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        self.live.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Singleton types currently exceeding their allowance
    pub fn singleton_breaches(&self) -> Vec<SingletonBreach> {
        let mut breaches: Vec<SingletonBreach> = self
            .singletons
            .iter()
            .filter_map(|entry| {
                let live = self.live_count(entry.key());
                (live > *entry.value()).then(|| SingletonBreach {
                    type_name: *entry.key(),
                    live,
                    allowed: *entry.value(),
                })
            })
            .collect();
        breaches.sort_by_key(|b| b.type_name);
        breaches
    }

    pub fn registered_total(&self) -> u64 {
        self.registered_total.load(Ordering::Relaxed)
    }
}

/// Deregisters its instance on drop
#[derive(Debug)]
pub struct InstanceGuard {
    registry: Arc<InstanceRegistry>,
    type_name: &'static str,
    owner: Option<String>,
}

impl InstanceGuard {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.type_name, self.owner.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let registry = InstanceRegistry::new();
        let a = registry.register(ENGINE_INSTANCE, Some("user_a"));
        let b = registry.register(ENGINE_INSTANCE, Some("user_a"));
        assert_eq!(registry.live_count(ENGINE_INSTANCE), 2);
        assert_eq!(registry.owner_count(ENGINE_INSTANCE, "user_a"), 2);

        drop(a);
        assert_eq!(registry.live_count(ENGINE_INSTANCE), 1);
        drop(b);
        assert_eq!(registry.live_count(ENGINE_INSTANCE), 0);
        assert_eq!(registry.owner_count(ENGINE_INSTANCE, "user_a"), 0);
        assert_eq!(registry.registered_total(), 2);
    }

    #[test]
    fn test_singleton_breach() {
        let registry = InstanceRegistry::new();
        let _first = registry.register(COLLECTOR_INSTANCE, None);
        assert!(registry.singleton_breaches().is_empty());

        let second = registry.register(COLLECTOR_INSTANCE, None);
        assert_eq!(
            registry.singleton_breaches(),
            vec![SingletonBreach {
                type_name: COLLECTOR_INSTANCE,
                live: 2,
                allowed: 1
            }]
        );

        drop(second);
        assert!(registry.singleton_breaches().is_empty());
    }
}
