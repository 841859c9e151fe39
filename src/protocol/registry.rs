//! Registry of live sessions, keyed by client identifier.
//!
//! The registry is the only state shared between connection threads. It
//! never overwrites an entry: a second session claiming a registered
//! identifier is rejected and the first one stays in place.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client '{0}' is already connected")]
    AlreadyExists(String),
    #[error("registry is full ({0} sessions)")]
    CapacityExceeded(usize),
}

/// Anything the registry can store.
pub trait RegistryEntry {
    fn client_id(&self) -> &str;
}

#[derive(Debug)]
pub struct SessionRegistry<S> {
    sessions: RwLock<HashMap<String, Arc<S>>>,
    capacity: Option<usize>,
}

impl<S: RegistryEntry> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: None,
        }
    }

    /// Registry refusing more than `capacity` concurrent sessions.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::with_capacity(capacity)),
            capacity: Some(capacity),
        }
    }

    pub fn add(&self, session: Arc<S>) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        let client_id = session.client_id();
        if sessions.contains_key(client_id) {
            return Err(RegistryError::AlreadyExists(client_id.to_string()));
        }
        if let Some(capacity) = self.capacity {
            if sessions.len() >= capacity {
                return Err(RegistryError::CapacityExceeded(capacity));
            }
        }
        sessions.insert(client_id.to_string(), session);
        Ok(())
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<S>> {
        self.read().get(client_id).cloned()
    }

    /// Removes `client_id`. Removing an absent entry is a no-op.
    pub fn delete(&self, client_id: &str) -> Option<Arc<S>> {
        self.write().remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of registered identifiers, sorted.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids = self.read().keys().cloned().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    // Every mutation is a single map call, so a poisoned lock still guards a
    // consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<S>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<S>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: RegistryEntry> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry {
        id: String,
        marker: usize,
    }

    impl RegistryEntry for Entry {
        fn client_id(&self) -> &str {
            &self.id
        }
    }

    fn entry(id: &str, marker: usize) -> Arc<Entry> {
        Arc::new(Entry {
            id: id.to_string(),
            marker,
        })
    }

    #[test]
    fn add_never_overwrites() {
        let registry = SessionRegistry::new();
        registry.add(entry("dev-1", 1)).unwrap();
        assert_eq!(
            registry.add(entry("dev-1", 2)),
            Err(RegistryError::AlreadyExists("dev-1".into()))
        );
        assert_eq!(registry.get("dev-1").unwrap().marker, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.add(entry("dev-1", 1)).unwrap();
        assert!(registry.delete("dev-1").is_some());
        assert!(registry.delete("dev-1").is_none());
        assert!(registry.get("dev-1").is_none());
        assert!(registry.is_empty());
        registry.add(entry("dev-1", 2)).unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = SessionRegistry::with_capacity(1);
        registry.add(entry("a", 0)).unwrap();
        assert_eq!(
            registry.add(entry("b", 0)),
            Err(RegistryError::CapacityExceeded(1))
        );
        // Duplicates are reported as such even when full.
        assert!(matches!(
            registry.add(entry("a", 0)),
            Err(RegistryError::AlreadyExists(_))
        ));
        registry.delete("a");
        registry.add(entry("b", 0)).unwrap();
        assert_eq!(registry.client_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn concurrent_distinct_adds() {
        const N: usize = 32;
        let registry = SessionRegistry::new();
        let barrier = Barrier::new(N);

        thread::scope(|s| {
            for i in 0..N {
                let (registry, barrier) = (&registry, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    registry.add(entry(&format!("dev-{i}"), i)).unwrap();
                });
            }
        });

        assert_eq!(registry.len(), N);
        for i in 0..N {
            assert_eq!(registry.get(&format!("dev-{i}")).unwrap().marker, i);
        }
    }

    #[test]
    fn concurrent_same_id_adds() {
        const N: usize = 32;
        let registry = SessionRegistry::new();
        let barrier = Barrier::new(N);

        let results = thread::scope(|s| {
            let handles = (0..N)
                .map(|i| {
                    let (registry, barrier) = (&registry, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        registry.add(entry("dev-1", i))
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        let winners = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(RegistryError::AlreadyExists(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(rejected, N - 1);
        assert_eq!(registry.len(), 1);
    }
}
