// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Live export bindings.
//!
//! An exporter owns one [`BindingCell`] per export name. Importers never copy
//! values: they hold weak handles to the cells and read through them, so every
//! read sees the latest write, including writes made after the importer ran.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::sync::{Arc, Weak};

use crate::error::BindingError;
use crate::key::ModuleKey;
use crate::record::ModuleRecord;

/// Current value of an export
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BindingValue {
    /// Declared but not assigned yet (or owner gone)
    #[default]
    Uninitialized,
    /// Assigned value
    Value(Value),
}

impl BindingValue {
    /// Whether a value has been assigned
    pub fn is_initialized(&self) -> bool {
        matches!(self, BindingValue::Value(_))
    }

    /// Borrow the assigned value
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            BindingValue::Value(v) => Some(v),
            BindingValue::Uninitialized => None,
        }
    }

    /// Take the assigned value
    pub fn into_value(self) -> Option<Value> {
        match self {
            BindingValue::Value(v) => Some(v),
            BindingValue::Uninitialized => None,
        }
    }
}

impl From<Value> for BindingValue {
    fn from(value: Value) -> Self {
        BindingValue::Value(value)
    }
}

/// Storage for one export of one module
#[derive(Debug)]
pub struct BindingCell {
    owner: ModuleKey,
    name: String,
    value: RwLock<BindingValue>,
}

impl BindingCell {
    pub(crate) fn new(owner: ModuleKey, name: impl Into<String>, value: BindingValue) -> Self {
        Self {
            owner,
            name: name.into(),
            value: RwLock::new(value),
        }
    }

    /// Owning module
    pub fn owner(&self) -> &ModuleKey {
        &self.owner
    }

    /// Export name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value
    pub fn get(&self) -> BindingValue {
        self.value.read().clone()
    }

    pub(crate) fn set(&self, value: BindingValue) {
        *self.value.write() = value;
    }
}

/// Importer-side handle to an export cell
#[derive(Debug, Clone)]
pub struct ImportedBinding {
    owner: ModuleKey,
    name: String,
    cell: Weak<BindingCell>,
}

impl ImportedBinding {
    fn attached(cell: &Arc<BindingCell>) -> Self {
        Self {
            owner: cell.owner.clone(),
            name: cell.name.clone(),
            cell: Arc::downgrade(cell),
        }
    }

    fn detached(owner: ModuleKey, name: &str) -> Self {
        Self {
            owner,
            name: name.to_string(),
            cell: Weak::new(),
        }
    }

    /// Module that owns the cell
    pub fn owner(&self) -> &ModuleKey {
        &self.owner
    }

    /// Export name in the owner
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest value; `Uninitialized` once the owner is torn down
    pub fn read(&self) -> BindingValue {
        self.cell
            .upgrade()
            .map(|cell| cell.get())
            .unwrap_or_default()
    }

    /// Whether the owning cell still exists
    pub fn is_attached(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

/// One entry of a module's export table
#[derive(Debug, Clone)]
pub(crate) enum ExportSlot {
    /// Cell owned by this module
    Local(Arc<BindingCell>),
    /// Live forward to another module's cell
    Reexport(ImportedBinding),
}

impl ExportSlot {
    fn read(&self) -> BindingValue {
        match self {
            ExportSlot::Local(cell) => cell.get(),
            ExportSlot::Reexport(binding) => binding.read(),
        }
    }

    fn binding(&self) -> ImportedBinding {
        match self {
            ExportSlot::Local(cell) => ImportedBinding::attached(cell),
            ExportSlot::Reexport(binding) => binding.clone(),
        }
    }
}

/// Read-only view of a module's exports
#[derive(Debug, Clone)]
pub struct Namespace {
    key: ModuleKey,
    record: Weak<ModuleRecord>,
}

impl Namespace {
    pub(crate) fn new(record: &Arc<ModuleRecord>) -> Self {
        Self {
            key: record.key().clone(),
            record: Arc::downgrade(record),
        }
    }

    /// Module key
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// Latest value of an export
    pub fn read(&self, name: &str) -> BindingValue {
        let Some(record) = self.record.upgrade() else {
            return BindingValue::Uninitialized;
        };
        let exports = record.exports().read();
        exports
            .get(name)
            .map(ExportSlot::read)
            .unwrap_or_default()
    }

    /// Assigned value of an export, if any
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read(name).into_value()
    }

    /// Live handle to an export.
    ///
    /// Asking for a name the owner has not defined yet (a cycle partner still
    /// running) declares an `Uninitialized` cell that the owner's `define`
    /// later fills. A settled owner's export table is never touched: missing
    /// names get a detached handle that reads `Uninitialized`.
    pub fn binding(&self, name: &str) -> ImportedBinding {
        let Some(record) = self.record.upgrade() else {
            return ImportedBinding::detached(self.key.clone(), name);
        };

        if let Some(slot) = record.exports().read().get(name) {
            return slot.binding();
        }

        if record.state().is_settled() {
            return ImportedBinding::detached(self.key.clone(), name);
        }

        let mut exports = record.exports().write();
        exports
            .entry(name.to_string())
            .or_insert_with(|| {
                ExportSlot::Local(Arc::new(BindingCell::new(
                    self.key.clone(),
                    name,
                    BindingValue::Uninitialized,
                )))
            })
            .binding()
    }

    /// Export names, sorted
    pub fn names(&self) -> Vec<String> {
        self.record
            .upgrade()
            .map(|record| record.export_names())
            .unwrap_or_default()
    }

    /// Whether both views are of the same record
    pub fn same_module(&self, other: &Namespace) -> bool {
        self.key == other.key && Weak::ptr_eq(&self.record, &other.record)
    }

    /// Whether the record is still alive
    pub fn is_attached(&self) -> bool {
        self.record.strong_count() > 0
    }
}

/// Write capability over one module's exports.
///
/// Only the loader creates writers, one per evaluation, for the module being
/// evaluated. Modules may clone theirs to keep mutating exported state.
#[derive(Debug, Clone)]
pub struct ExportWriter {
    key: ModuleKey,
    record: Weak<ModuleRecord>,
}

impl ExportWriter {
    pub(crate) fn new(record: &Arc<ModuleRecord>) -> Self {
        Self {
            key: record.key().clone(),
            record: Arc::downgrade(record),
        }
    }

    /// Module being written
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    fn record(&self) -> Result<Arc<ModuleRecord>, BindingError> {
        self.record
            .upgrade()
            .ok_or_else(|| BindingError::Detached(self.key.clone()))
    }

    /// Declare an export with an initial value.
    ///
    /// An existing cell (hoisted by an importer, or kept across a reload) is
    /// rewritten in place so handles taken earlier see the value.
    pub fn define(&self, name: &str, initial: impl Into<BindingValue>) -> Result<(), BindingError> {
        let record = self.record()?;
        let initial = initial.into();
        let mut exports = record.exports().write();

        match exports.entry(name.to_string()) {
            Entry::Occupied(mut entry) => match entry.get() {
                ExportSlot::Local(cell) => cell.set(initial),
                ExportSlot::Reexport(_) => {
                    entry.insert(ExportSlot::Local(Arc::new(BindingCell::new(
                        self.key.clone(),
                        name,
                        initial,
                    ))));
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(ExportSlot::Local(Arc::new(BindingCell::new(
                    self.key.clone(),
                    name,
                    initial,
                ))));
            }
        }
        Ok(())
    }

    /// Assign a new value to a defined export
    pub fn write(&self, name: &str, value: Value) -> Result<(), BindingError> {
        let record = self.record()?;
        let exports = record.exports().read();

        match exports.get(name) {
            Some(ExportSlot::Local(cell)) => {
                cell.set(BindingValue::Value(value));
                Ok(())
            }
            Some(ExportSlot::Reexport(_)) => Err(BindingError::NotOwned {
                key: self.key.clone(),
                name: name.to_string(),
            }),
            None => Err(BindingError::UnknownExport {
                key: self.key.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Export another module's binding under `name`, live
    pub fn reexport(&self, name: &str, binding: ImportedBinding) -> Result<(), BindingError> {
        let record = self.record()?;
        record
            .exports()
            .write()
            .insert(name.to_string(), ExportSlot::Reexport(binding));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::record::ModuleState;
    use serde_json::json;

    fn record(path: &str) -> Arc<ModuleRecord> {
        Arc::new(ModuleRecord::new(
            ModuleKey::new(path),
            Arc::new(EventBus::new()),
        ))
    }

    #[test]
    fn test_reads_are_live() {
        let counter = record("/counter.js");
        let writer = ExportWriter::new(&counter);
        writer.define("count", json!(0)).unwrap();

        let ns = Namespace::new(&counter);
        let handle = ns.binding("count");
        assert_eq!(handle.read(), BindingValue::Value(json!(0)));

        writer.write("count", json!(1)).unwrap();
        assert_eq!(handle.read(), BindingValue::Value(json!(1)));
        assert_eq!(ns.get("count"), Some(json!(1)));
    }

    #[test]
    fn test_unknown_names_read_uninitialized() {
        let module = record("/m.js");
        let ns = Namespace::new(&module);
        assert_eq!(ns.read("missing"), BindingValue::Uninitialized);
    }

    #[test]
    fn test_hoisted_binding_is_filled_by_define() {
        let module = record("/cycle-a.js");
        let ns = Namespace::new(&module);
        let early = ns.binding("value");
        assert_eq!(early.read(), BindingValue::Uninitialized);

        ExportWriter::new(&module).define("value", json!("a")).unwrap();
        assert_eq!(early.read(), BindingValue::Value(json!("a")));
    }

    #[test]
    fn test_missing_name_on_ready_module_is_not_hoisted() {
        let module = record("/a.js");
        module.transition(ModuleState::Resolving).unwrap();
        module.transition(ModuleState::Loading).unwrap();
        module.transition(ModuleState::Evaluating).unwrap();
        ExportWriter::new(&module).define("x", json!(1)).unwrap();
        module.complete(1).unwrap();

        let typo = Namespace::new(&module).binding("typo");
        assert_eq!(typo.read(), BindingValue::Uninitialized);
        assert!(!typo.is_attached());
        assert_eq!(module.export_names(), vec!["x".to_string()]);
    }

    #[test]
    fn test_write_errors() {
        let origin = record("/origin.js");
        ExportWriter::new(&origin).define("x", json!(1)).unwrap();

        let proxy = record("/proxy.js");
        let writer = ExportWriter::new(&proxy);
        writer
            .reexport("x", Namespace::new(&origin).binding("x"))
            .unwrap();

        assert!(matches!(
            writer.write("x", json!(2)),
            Err(BindingError::NotOwned { .. })
        ));
        assert!(matches!(
            writer.write("y", json!(2)),
            Err(BindingError::UnknownExport { .. })
        ));
        assert_eq!(Namespace::new(&proxy).get("x"), Some(json!(1)));
    }

    #[test]
    fn test_reexport_is_live() {
        let origin = record("/origin.js");
        let origin_writer = ExportWriter::new(&origin);
        origin_writer.define("x", json!(1)).unwrap();

        let proxy = record("/proxy.js");
        ExportWriter::new(&proxy)
            .reexport("x", Namespace::new(&origin).binding("x"))
            .unwrap();

        let handle = Namespace::new(&proxy).binding("x");
        origin_writer.write("x", json!(5)).unwrap();
        assert_eq!(handle.read(), BindingValue::Value(json!(5)));
        assert_eq!(handle.owner().as_str(), "/origin.js");
    }

    #[test]
    fn test_detached_after_teardown() {
        let module = record("/gone.js");
        let writer = ExportWriter::new(&module);
        writer.define("x", json!(1)).unwrap();
        let ns = Namespace::new(&module);
        let handle = ns.binding("x");

        drop(module);
        assert!(!handle.is_attached());
        assert_eq!(handle.read(), BindingValue::Uninitialized);
        assert!(ns.names().is_empty());
        assert!(matches!(
            writer.define("x", json!(2)),
            Err(BindingError::Detached(_))
        ));
    }

    #[test]
    fn test_same_module() {
        let a = record("/a.js");
        let b = record("/a.js");
        assert!(Namespace::new(&a).same_module(&Namespace::new(&a)));
        assert!(!Namespace::new(&a).same_module(&Namespace::new(&b)));
    }
}
