// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module records and their state machine

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::binding::{BindingValue, ExportSlot};
use crate::error::ModuleError;
use crate::events::EventBus;
use crate::graph::EdgeKind;
use crate::key::ModuleKey;
use crate::script::ParsedModule;

/// Lifecycle state of a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    /// Created, or reset by invalidation
    Unresolved,
    /// Claimed by a load task that waits for a slot
    Resolving,
    /// Fetching, parsing and linking dependencies
    Loading,
    /// Module body is running
    Evaluating,
    /// Exports are available
    Ready,
    /// Load or evaluation failed
    Failed,
}

impl ModuleState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Unresolved | Failed, Resolving)
                | (Resolving, Loading)
                | (Loading, Evaluating)
                | (Evaluating, Ready)
                | (Unresolved | Resolving | Loading | Evaluating, Failed)
                | (Failed, Loading)
                | (Ready, Loading)
                | (Ready | Failed, Unresolved)
        )
    }

    /// `Ready` or `Failed`
    pub fn is_settled(self) -> bool {
        matches!(self, ModuleState::Ready | ModuleState::Failed)
    }

    /// A load task or evaluation owns the record
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ModuleState::Resolving | ModuleState::Loading | ModuleState::Evaluating
        )
    }
}

/// A resolved import of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedImport {
    /// Specifier as written in the importer
    pub specifier: String,
    /// Resolved target
    pub key: ModuleKey,
    /// How the target is linked
    pub kind: EdgeKind,
}

/// Point-in-time view of a record, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    /// Module key
    pub key: ModuleKey,
    /// Current state
    pub state: ModuleState,
    /// Invalidation count
    pub version: u64,
    /// Load sequence stamped when the record became ready
    pub loaded_at: Option<u64>,
    /// Names of the current exports
    pub exports: Vec<String>,
    /// Ordered dependency keys
    pub dependencies: Vec<ModuleKey>,
    /// Error message when failed
    pub error: Option<String>,
}

#[derive(Debug)]
struct RecordInner {
    state: ModuleState,
    error: Option<ModuleError>,
    dependencies: Vec<LinkedImport>,
    version: u64,
    loaded_at: Option<u64>,
    parsed: Option<Arc<ParsedModule>>,
    module_type: Option<String>,
}

/// Cache entry for one module.
///
/// Records are owned by the registry and shared as `Arc<ModuleRecord>`.
/// Export cells live as long as the record does.
#[derive(Debug)]
pub struct ModuleRecord {
    key: ModuleKey,
    inner: Mutex<RecordInner>,
    exports: RwLock<BTreeMap<String, ExportSlot>>,
    events: Arc<EventBus>,
}

impl ModuleRecord {
    pub(crate) fn new(key: ModuleKey, events: Arc<EventBus>) -> Self {
        Self {
            key,
            inner: Mutex::new(RecordInner {
                state: ModuleState::Unresolved,
                error: None,
                dependencies: Vec::new(),
                version: 0,
                loaded_at: None,
                parsed: None,
                module_type: None,
            }),
            exports: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Module key
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// Current state
    pub fn state(&self) -> ModuleState {
        self.inner.lock().state
    }

    /// Invalidation count
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Load sequence stamped when the record last became ready
    pub fn loaded_at(&self) -> Option<u64> {
        self.inner.lock().loaded_at
    }

    /// Error of a failed record
    pub fn error(&self) -> Option<ModuleError> {
        self.inner.lock().error.clone()
    }

    /// Ordered imports discovered at the last load
    pub fn dependencies(&self) -> Vec<LinkedImport> {
        self.inner.lock().dependencies.clone()
    }

    /// Module type tag of the last load
    pub fn module_type(&self) -> Option<String> {
        self.inner.lock().module_type.clone()
    }

    /// Names of the current exports
    pub fn export_names(&self) -> Vec<String> {
        self.exports.read().keys().cloned().collect()
    }

    /// Move to `to`, emitting a state event.
    ///
    /// Leaving `Failed` clears the stored error.
    pub fn transition(&self, to: ModuleState) -> Result<(), ModuleError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(ModuleError::State {
                key: self.key.clone(),
                from,
                to,
            });
        }

        inner.state = to;
        if from == ModuleState::Failed {
            inner.error = None;
        }
        tracing::debug!("{}: {:?} -> {:?}", self.key, from, to);
        self.events.emit(&self.key, from, to, inner.version);
        Ok(())
    }

    /// Settle as failed with `error`.
    ///
    /// A record that is already failed keeps its state and takes the newer
    /// error.
    pub fn fail(&self, error: ModuleError) -> Result<(), ModuleError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from != ModuleState::Failed {
            if !from.can_transition_to(ModuleState::Failed) {
                return Err(ModuleError::State {
                    key: self.key.clone(),
                    from,
                    to: ModuleState::Failed,
                });
            }
            inner.state = ModuleState::Failed;
            tracing::debug!("{}: {:?} -> Failed ({})", self.key, from, error);
            self.events
                .emit(&self.key, from, ModuleState::Failed, inner.version);
        }
        inner.parsed = None;
        inner.error = Some(error);
        Ok(())
    }

    /// Settle as ready, stamping the load sequence
    pub(crate) fn complete(&self, load_sequence: u64) -> Result<(), ModuleError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if from != ModuleState::Evaluating {
            return Err(ModuleError::State {
                key: self.key.clone(),
                from,
                to: ModuleState::Ready,
            });
        }
        inner.state = ModuleState::Ready;
        inner.loaded_at = Some(load_sequence);
        inner.parsed = None;
        self.events
            .emit(&self.key, from, ModuleState::Ready, inner.version);
        Ok(())
    }

    /// Claim the record for a new load task.
    ///
    /// `Unresolved` and `Failed` records move to `Resolving`, so the record
    /// is never seen as settled while the task waits for a slot. A record
    /// still marked active by a task that is being torn down is failed as
    /// cancelled first.
    pub(crate) fn claim(&self) -> Result<(), ModuleError> {
        let mut inner = self.inner.lock();
        let mut from = inner.state;

        if from.is_active() {
            inner.state = ModuleState::Failed;
            inner.parsed = None;
            inner.error = Some(ModuleError::Cancelled {
                key: self.key.clone(),
            });
            self.events
                .emit(&self.key, from, ModuleState::Failed, inner.version);
            from = ModuleState::Failed;
        }

        if !from.can_transition_to(ModuleState::Resolving) {
            return Err(ModuleError::State {
                key: self.key.clone(),
                from,
                to: ModuleState::Resolving,
            });
        }

        inner.state = ModuleState::Resolving;
        inner.error = None;
        tracing::debug!("{}: {:?} -> Resolving", self.key, from);
        self.events
            .emit(&self.key, from, ModuleState::Resolving, inner.version);
        Ok(())
    }

    /// Reset a settled record to `Unresolved` and bump its version.
    ///
    /// A record fetched but not yet evaluated counts as settled: its parse is
    /// dropped so the next load reads the source again. Returns `None` when
    /// the record is in flight.
    pub(crate) fn invalidate(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        let fetched = from == ModuleState::Loading && inner.parsed.is_some();
        if !from.is_settled() && !fetched {
            return None;
        }
        inner.version += 1;
        inner.state = ModuleState::Unresolved;
        inner.error = None;
        inner.parsed = None;
        self.events
            .emit(&self.key, from, ModuleState::Unresolved, inner.version);
        Some(inner.version)
    }

    /// Claim a fetched record for evaluation.
    ///
    /// Succeeds only once per load: the record must be `Loading` with a
    /// parsed module attached.
    pub(crate) fn begin_evaluation(&self) -> Option<Arc<ParsedModule>> {
        let mut inner = self.inner.lock();
        if inner.state != ModuleState::Loading {
            return None;
        }
        let parsed = inner.parsed.clone()?;
        inner.state = ModuleState::Evaluating;
        self.events.emit(
            &self.key,
            ModuleState::Loading,
            ModuleState::Evaluating,
            inner.version,
        );
        Some(parsed)
    }

    /// Whether the record was fetched and waits for evaluation
    pub(crate) fn is_fetched(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == ModuleState::Loading && inner.parsed.is_some()
    }

    pub(crate) fn parsed(&self) -> Option<Arc<ParsedModule>> {
        self.inner.lock().parsed.clone()
    }

    pub(crate) fn set_parsed(&self, parsed: ParsedModule) {
        let mut inner = self.inner.lock();
        inner.module_type = parsed.module_type.clone();
        inner.parsed = Some(Arc::new(parsed));
    }

    pub(crate) fn set_dependencies(&self, dependencies: Vec<LinkedImport>) {
        self.inner.lock().dependencies = dependencies;
    }

    pub(crate) fn exports(&self) -> &RwLock<BTreeMap<String, ExportSlot>> {
        &self.exports
    }

    /// Reset every owned cell to `Uninitialized` and drop re-exports.
    ///
    /// Cells stay in place so importers keep their handles across a reload.
    pub(crate) fn reset_bindings(&self) {
        let mut exports = self.exports.write();
        exports.retain(|_, slot| matches!(slot, ExportSlot::Local(_)));
        for slot in exports.values() {
            if let ExportSlot::Local(cell) = slot {
                cell.set(BindingValue::Uninitialized);
            }
        }
    }

    /// Drop every export cell
    pub(crate) fn clear_exports(&self) {
        self.exports.write().clear();
    }

    /// Point-in-time view of the record
    pub fn snapshot(&self) -> RecordSnapshot {
        let inner = self.inner.lock();
        RecordSnapshot {
            key: self.key.clone(),
            state: inner.state,
            version: inner.version,
            loaded_at: inner.loaded_at,
            exports: self.export_names(),
            dependencies: inner.dependencies.iter().map(|d| d.key.clone()).collect(),
            error: inner.error.as_ref().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> (ModuleRecord, tokio::sync::mpsc::UnboundedReceiver<crate::events::StateEvent>) {
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        (ModuleRecord::new(ModuleKey::new(path), events), rx)
    }

    #[test]
    fn test_transition_table() {
        use ModuleState::*;
        assert!(Unresolved.can_transition_to(Resolving));
        assert!(Failed.can_transition_to(Resolving));
        assert!(Loading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Loading));
        assert!(Ready.can_transition_to(Loading));
        assert!(Ready.can_transition_to(Unresolved));

        assert!(!Unresolved.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Evaluating.can_transition_to(Unresolved));
        assert!(!Resolving.can_transition_to(Evaluating));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let (record, _rx) = record("/a.js");
        let err = record.transition(ModuleState::Ready).unwrap_err();
        assert!(matches!(err, ModuleError::State { .. }));
        assert_eq!(record.state(), ModuleState::Unresolved);
    }

    #[test]
    fn test_events_follow_transitions() {
        let (record, mut rx) = record("/a.js");
        record.transition(ModuleState::Resolving).unwrap();
        record.transition(ModuleState::Loading).unwrap();
        record.fail(ModuleError::permanent(ModuleKey::new("/a.js"), "bad")).unwrap();

        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| (e.from, e.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (ModuleState::Unresolved, ModuleState::Resolving),
                (ModuleState::Resolving, ModuleState::Loading),
                (ModuleState::Loading, ModuleState::Failed),
            ]
        );
        assert!(record.error().is_some());
    }

    #[test]
    fn test_invalidate_only_settled() {
        let (record, _rx) = record("/a.js");
        record.transition(ModuleState::Resolving).unwrap();
        assert_eq!(record.invalidate(), None);

        record.fail(ModuleError::permanent(ModuleKey::new("/a.js"), "bad")).unwrap();
        assert_eq!(record.invalidate(), Some(1));
        assert_eq!(record.state(), ModuleState::Unresolved);
        assert!(record.error().is_none());
    }

    #[test]
    fn test_invalidate_drops_unevaluated_parse() {
        let (record, _rx) = record("/a.js");
        record.claim().unwrap();
        record.transition(ModuleState::Loading).unwrap();
        assert_eq!(record.invalidate(), None);

        record.set_parsed(ParsedModule {
            imports: Vec::new(),
            source: Arc::from(""),
            module_type: None,
        });
        assert!(record.is_fetched());
        assert_eq!(record.invalidate(), Some(1));
        assert_eq!(record.state(), ModuleState::Unresolved);
        assert!(record.parsed().is_none());
    }

    #[test]
    fn test_leaving_failed_clears_error() {
        let (record, _rx) = record("/a.js");
        record.fail(ModuleError::permanent(ModuleKey::new("/a.js"), "bad")).unwrap();
        record.transition(ModuleState::Loading).unwrap();
        assert!(record.error().is_none());
    }

    #[test]
    fn test_claim_keeps_failed_record_in_flight() {
        let (record, _rx) = record("/a.js");
        record.fail(ModuleError::permanent(ModuleKey::new("/a.js"), "bad")).unwrap();

        record.claim().unwrap();
        assert_eq!(record.state(), ModuleState::Resolving);
        assert!(record.error().is_none());
        // A claimed record is not settled, so invalidation leaves it alone
        assert_eq!(record.invalidate(), None);
        record.transition(ModuleState::Loading).unwrap();
    }

    #[test]
    fn test_claim_replaces_orphaned_load() {
        let (record, mut rx) = record("/a.js");
        record.claim().unwrap();
        record.transition(ModuleState::Loading).unwrap();

        record.claim().unwrap();
        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| (e.from, e.to))
            .collect();
        assert_eq!(
            states[2..],
            [
                (ModuleState::Loading, ModuleState::Failed),
                (ModuleState::Failed, ModuleState::Resolving),
            ]
        );
        assert_eq!(record.state(), ModuleState::Resolving);
    }
}
