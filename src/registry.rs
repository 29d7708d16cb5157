//! Host-side registries for processes that load patches.
//!
//! Instrumented classes read their provider slot on every call. On the host
//! the slots are modeled by a [`PatchRegistry`] the loader constructs and
//! shares; writes are last-write-wins, and a reader that sees an older
//! provider (or none) just runs the original body. [`AccessorRegistry`] is
//! the host analogue of the runtime's private field helpers: getters and
//! setters registered per (type, member) when a type is registered.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

/// Current patch provider per class name.
#[derive(Debug)]
pub struct PatchRegistry<P> {
    slots: RwLock<HashMap<String, Arc<P>>>,
}

impl<P> Default for PatchRegistry<P> {
    fn default() -> Self {
        PatchRegistry {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> PatchRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `provider` current for `class`, returning the one it replaces.
    pub fn install(&self, class: &str, provider: Arc<P>) -> Option<Arc<P>> {
        debug!(class, "patch provider installed");
        // no invariant spans the map, so a poisoned lock is still usable
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class.to_owned(), provider)
    }

    pub fn current(&self, class: &str) -> Option<Arc<P>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class)
            .cloned()
    }

    /// Empties the slot of `class`; later calls run the original bodies.
    pub fn clear(&self, class: &str) -> Option<Arc<P>> {
        debug!(class, "patch provider cleared");
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(class)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type Getter<T, V> = fn(&T) -> V;
pub type Setter<T, V> = fn(&mut T, V);

#[derive(Clone, Copy, Debug)]
pub struct Accessor<T, V> {
    pub get: Getter<T, V>,
    pub set: Option<Setter<T, V>>,
}

/// Field accessors keyed by (type name, member name).
#[derive(Debug)]
pub struct AccessorRegistry<T, V> {
    accessors: HashMap<(String, String), Accessor<T, V>>,
}

impl<T, V> Default for AccessorRegistry<T, V> {
    fn default() -> Self {
        AccessorRegistry {
            accessors: HashMap::new(),
        }
    }
}

impl<T, V> AccessorRegistry<T, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member; a read-only member has no setter.
    pub fn register(&mut self, type_name: &str, member: &str, get: Getter<T, V>, set: Option<Setter<T, V>>) {
        self.accessors
            .insert((type_name.to_owned(), member.to_owned()), Accessor { get, set });
    }

    fn accessor(&self, type_name: &str, member: &str) -> Option<&Accessor<T, V>> {
        self.accessors.get(&(type_name.to_owned(), member.to_owned()))
    }

    pub fn get(&self, type_name: &str, member: &str, instance: &T) -> Option<V> {
        self.accessor(type_name, member).map(|a| (a.get)(instance))
    }

    /// Returns whether a setter ran.
    pub fn set(&self, type_name: &str, member: &str, instance: &mut T, value: V) -> bool {
        match self.accessor(type_name, member).and_then(|a| a.set) {
            Some(set) => {
                set(instance, value);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, type_name: &str, member: &str) -> bool {
        self.accessor(type_name, member).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: i64,
    }

    fn count(c: &Counter) -> i64 {
        c.count
    }

    fn set_count(c: &mut Counter, value: i64) {
        c.count = value;
    }

    #[test]
    fn test_last_install_wins() {
        let registry = PatchRegistry::new();
        assert!(registry.current("a/C").is_none());
        assert!(registry.install("a/C", Arc::new(1)).is_none());
        assert_eq!(registry.install("a/C", Arc::new(2)).as_deref(), Some(&1));
        assert_eq!(registry.current("a/C").as_deref(), Some(&2));
        registry.clear("a/C");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_accessors() {
        let mut registry: AccessorRegistry<Counter, i64> = AccessorRegistry::new();
        registry.register("a/Counter", "count", count, Some(set_count));
        registry.register("a/Counter", "view", count, None);

        let mut counter = Counter { count: 3 };
        assert_eq!(registry.get("a/Counter", "count", &counter), Some(3));
        assert!(registry.set("a/Counter", "count", &mut counter, 9));
        assert_eq!(counter.count, 9);
        assert!(!registry.set("a/Counter", "view", &mut counter, 1));
        assert_eq!(registry.get("a/Counter", "missing", &counter), None);
    }
}
