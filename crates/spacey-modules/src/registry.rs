// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module registry
//!
//! Owns one [`ModuleRecord`] per canonical key for the lifetime of the
//! registry. Invalidation resets a record in place instead of replacing it,
//! so export cells and importers' handles survive a reload.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::EventBus;
use crate::key::ModuleKey;
use crate::record::{ModuleRecord, RecordSnapshot};

/// A record was reset for reloading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    /// Module key
    pub key: ModuleKey,
    /// New record version
    pub version: u64,
}

/// Callback run after an invalidation
pub type InvalidationListener = Arc<dyn Fn(&Invalidation) + Send + Sync>;

/// Handle for removing an invalidation listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    filter: Option<ModuleKey>,
    listener: InvalidationListener,
}

/// Thread-safe module registry
pub struct Registry {
    records: DashMap<ModuleKey, Arc<ModuleRecord>>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    load_sequence: AtomicU64,
    events: Arc<EventBus>,
}

impl Registry {
    /// Create an empty registry publishing on `events`
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            records: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            load_sequence: AtomicU64::new(0),
            events,
        }
    }

    /// Event bus shared by every record
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Record for `key`, created `Unresolved` if missing
    pub fn get_or_create(&self, key: &ModuleKey) -> Arc<ModuleRecord> {
        self.records
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!("Registering {}", key);
                Arc::new(ModuleRecord::new(key.clone(), self.events.clone()))
            })
            .clone()
    }

    /// Record for `key`, if registered
    pub fn get(&self, key: &ModuleKey) -> Option<Arc<ModuleRecord>> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    /// Check if a key is registered
    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of registered records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reset a settled record to `Unresolved` and bump its version.
    ///
    /// Returns the new version, or `None` when the key is unknown or still
    /// loading. Export cells keep their last value until the next load.
    /// Listeners run after the reset, in registration order.
    pub fn invalidate(&self, key: &ModuleKey) -> Option<u64> {
        let record = self.get(key)?;
        let version = record.invalidate()?;
        tracing::debug!("Invalidated {} (version {})", key, version);

        let invalidation = Invalidation {
            key: key.clone(),
            version,
        };
        let listeners: Vec<InvalidationListener> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.filter.as_ref().is_none_or(|k| k == key))
            .map(|entry| entry.listener.clone())
            .collect();

        for listener in listeners {
            listener(&invalidation);
        }

        Some(version)
    }

    /// Register a listener for one key (or every key with `None`)
    pub fn on_invalidate<F>(&self, filter: Option<ModuleKey>, listener: F) -> ListenerId
    where
        F: Fn(&Invalidation) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(ListenerEntry {
            id,
            filter,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Next registry-wide load sequence number
    pub fn next_load_sequence(&self) -> u64 {
        self.load_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Every registered key, sorted
    pub fn keys(&self) -> Vec<ModuleKey> {
        let mut keys: Vec<ModuleKey> = self.records.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of every record, sorted by key
    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let records: Vec<Arc<ModuleRecord>> =
            self.records.iter().map(|e| e.value().clone()).collect();
        let mut snapshots: Vec<RecordSnapshot> = records.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Drop every record and listener.
    ///
    /// Export cells are released, so outstanding handles read
    /// `Uninitialized` from now on.
    pub fn teardown(&self) {
        let records: Vec<Arc<ModuleRecord>> =
            self.records.iter().map(|e| e.value().clone()).collect();
        self.records.clear();
        for record in records {
            record.clear_exports();
        }
        self.listeners.write().clear();
        tracing::debug!("Registry torn down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("records", &self.records.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ExportWriter, Namespace};
    use crate::error::ModuleError;
    use crate::record::ModuleState;
    use parking_lot::Mutex;
    use serde_json::json;

    fn ready(registry: &Registry, path: &str) -> Arc<ModuleRecord> {
        let record = registry.get_or_create(&ModuleKey::new(path));
        record.transition(ModuleState::Resolving).unwrap();
        record.transition(ModuleState::Loading).unwrap();
        record.transition(ModuleState::Evaluating).unwrap();
        record.complete(registry.next_load_sequence()).unwrap();
        record
    }

    #[test]
    fn test_get_or_create_returns_same_record() {
        let registry = Registry::default();
        let key = ModuleKey::new("/a.js");
        let first = registry.get_or_create(&key);
        let second = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&key));
    }

    #[test]
    fn test_invalidate_keeps_cells() {
        let registry = Registry::default();
        let record = ready(&registry, "/a.js");
        ExportWriter::new(&record).define("x", json!(1)).unwrap();
        let handle = Namespace::new(&record).binding("x");

        assert_eq!(registry.invalidate(record.key()), Some(1));
        assert_eq!(record.state(), ModuleState::Unresolved);
        assert_eq!(record.version(), 1);
        assert_eq!(handle.read().into_value(), Some(json!(1)));
    }

    #[test]
    fn test_invalidate_skips_in_flight_and_unknown() {
        let registry = Registry::default();
        let record = registry.get_or_create(&ModuleKey::new("/a.js"));
        record.transition(ModuleState::Resolving).unwrap();

        assert_eq!(registry.invalidate(record.key()), None);
        assert_eq!(registry.invalidate(&ModuleKey::new("/missing.js")), None);
    }

    #[test]
    fn test_listeners_run_in_order() {
        let registry = Registry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = ModuleKey::new("/a.js");

        let log = seen.clone();
        registry.on_invalidate(None, move |inv| log.lock().push(format!("any:{}", inv.key)));
        let log = seen.clone();
        let only_b = registry.on_invalidate(Some(ModuleKey::new("/b.js")), move |inv| {
            log.lock().push(format!("b:{}", inv.key))
        });
        let log = seen.clone();
        registry.on_invalidate(Some(a.clone()), move |inv| {
            log.lock().push(format!("a:v{}", inv.version))
        });

        ready(&registry, "/a.js");
        ready(&registry, "/b.js");
        registry.invalidate(&a);
        registry.invalidate(&ModuleKey::new("/b.js"));
        assert!(registry.remove_listener(only_b));
        assert!(!registry.remove_listener(only_b));

        assert_eq!(
            *seen.lock(),
            vec!["any:/a.js", "a:v1", "any:/b.js", "b:/b.js"]
        );
    }

    #[test]
    fn test_listener_may_reenter_registry() {
        let registry = Arc::new(Registry::default());
        let inner = registry.clone();
        registry.on_invalidate(None, move |inv| {
            // Reads during a callback must not deadlock
            assert!(inner.get(&inv.key).is_some());
            inner.on_invalidate(None, |_| {});
        });

        ready(&registry, "/a.js");
        assert_eq!(registry.invalidate(&ModuleKey::new("/a.js")), Some(1));
    }

    #[test]
    fn test_snapshot_and_teardown() {
        let registry = Registry::default();
        let b = ready(&registry, "/b.js");
        let a = registry.get_or_create(&ModuleKey::new("/a.js"));
        a.fail(ModuleError::permanent(a.key().clone(), "boom")).unwrap();
        ExportWriter::new(&b).define("x", json!(true)).unwrap();
        let handle = Namespace::new(&b).binding("x");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].key.as_str(), "/a.js");
        assert_eq!(snapshot[0].state, ModuleState::Failed);
        assert_eq!(snapshot[1].exports, vec!["x".to_string()]);
        assert_eq!(snapshot[1].loaded_at, Some(1));

        registry.teardown();
        assert!(registry.is_empty());
        assert!(!handle.is_attached());
    }
}
