// Fact-store adapter (spec §6): an opaque collaborator from the
// core's perspective. This module defines the contract as a trait and
// ships one in-memory reference implementation used by tests and the
// `dresc` CLI's `--check` path; a real deployment is expected to
// plug in its own (e.g. the OHM fact store `original_source/` talks
// to, out of scope here per spec §1).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

/// A typed field value stored in a fact (spec §3).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Double(f64),
    Str(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such field {0:?} on fact")]
    NoSuchField(String),
    #[error("no such fact named {0:?}")]
    NoSuchName(String),
}

#[derive(Debug, Default)]
struct FactRecord {
    name: String,
    fields: HashMap<String, FieldValue>,
}

/// A reference-counted handle to a fact (spec §3: "the VM holds
/// reference-counted handles"). Cloning a handle is cheap and shares
/// the same underlying record.
#[derive(Clone, Debug)]
pub struct FactHandle(Rc<RefCell<FactRecord>>);

impl FactHandle {
    fn new(name: &str) -> FactHandle {
        FactHandle(Rc::new(RefCell::new(FactRecord {
            name: name.to_string(),
            fields: HashMap::new(),
        })))
    }

    /// Build a fact not yet bound into any store (spec §4.4 `fact()`
    /// builtin: the result is an orphan until `SET` binds it to a name).
    pub fn orphan(name: &str) -> FactHandle {
        FactHandle::new(name)
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.0.borrow().fields.get(field).cloned()
    }

    pub fn set(&self, field: &str, value: FieldValue) {
        self.0.borrow_mut().fields.insert(field.to_string(), value);
    }

    pub fn fields(&self) -> HashMap<String, FieldValue> {
        self.0.borrow().fields.clone()
    }

    pub fn matches(&self, field: &str, value: &FieldValue) -> bool {
        self.get(field).as_ref() == Some(value)
    }
}

impl PartialEq for FactHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// An undo record for a single mutation, used to implement
/// transaction rollback without copy-on-write of the whole store.
enum Undo {
    Created { name: String, handle: FactHandle },
    FieldChanged { handle: FactHandle, field: String, prev: Option<FieldValue> },
    Removed { name: String, handle: FactHandle },
}

/// The fact-store contract (spec §6). Lookup/mutate named facts,
/// track changes for the resolver's view-based stamp bumping, and
/// support nested transactions with rollback.
pub trait FactStore {
    fn lookup(&self, name: &str) -> Vec<FactHandle>;
    fn create(&mut self, name: &str) -> FactHandle;
    fn set_field(&mut self, fact: &FactHandle, field: &str, value: FieldValue);
    fn duplicate(&mut self, fact: &FactHandle, new_name: &str) -> FactHandle;
    fn copy_fields(&mut self, src: &FactHandle, dst: &FactHandle, partial: bool);
    fn remove_all(&mut self, name: &str);
    /// Names that have changed (created, mutated, or removed) since
    /// the last `reset_changes` call. Polled by the resolver's view.
    fn changes(&self) -> Vec<String>;
    fn reset_changes(&mut self);
    fn push_tx(&mut self);
    fn pop_tx(&mut self, rollback: bool);
}

/// Reference in-memory `FactStore`.
#[derive(Default)]
pub struct MemoryFactStore {
    by_name: HashMap<String, Vec<FactHandle>>,
    changed: std::collections::HashSet<String>,
    tx_stack: Vec<Vec<Undo>>,
}

impl MemoryFactStore {
    pub fn new() -> MemoryFactStore {
        MemoryFactStore::default()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(top) = self.tx_stack.last_mut() {
            top.push(undo);
        }
    }

    fn mark_changed(&mut self, name: &str) {
        self.changed.insert(name.to_string());
    }
}

impl FactStore for MemoryFactStore {
    fn lookup(&self, name: &str) -> Vec<FactHandle> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    fn create(&mut self, name: &str) -> FactHandle {
        let handle = FactHandle::new(name);
        self.by_name
            .entry(name.to_string())
            .or_default()
            .push(handle.clone());
        self.mark_changed(name);
        self.record(Undo::Created {
            name: name.to_string(),
            handle: handle.clone(),
        });
        handle
    }

    fn set_field(&mut self, fact: &FactHandle, field: &str, value: FieldValue) {
        let prev = fact.get(field);
        if prev.as_ref() == Some(&value) {
            return; // no-op: avoids spurious change events (spec §4.2 SET FIELD).
        }
        fact.set(field, value);
        let name = fact.name();
        self.mark_changed(&name);
        self.record(Undo::FieldChanged {
            handle: fact.clone(),
            field: field.to_string(),
            prev,
        });
    }

    fn duplicate(&mut self, fact: &FactHandle, new_name: &str) -> FactHandle {
        let handle = self.create(new_name);
        for (k, v) in fact.fields() {
            handle.set(&k, v);
        }
        handle
    }

    fn copy_fields(&mut self, src: &FactHandle, dst: &FactHandle, partial: bool) {
        for (k, v) in src.fields() {
            if partial {
                if dst.get(&k).as_ref() == Some(&v) {
                    continue;
                }
            }
            self.set_field(dst, &k, v);
        }
    }

    fn remove_all(&mut self, name: &str) {
        if let Some(handles) = self.by_name.remove(name) {
            for handle in handles {
                self.record(Undo::Removed {
                    name: name.to_string(),
                    handle,
                });
            }
            self.mark_changed(name);
        }
    }

    fn changes(&self) -> Vec<String> {
        self.changed.iter().cloned().collect()
    }

    fn reset_changes(&mut self) {
        self.changed.clear();
    }

    fn push_tx(&mut self) {
        self.tx_stack.push(Vec::new());
    }

    fn pop_tx(&mut self, rollback: bool) {
        let log = match self.tx_stack.pop() {
            Some(log) => log,
            None => return,
        };
        if !rollback {
            // Commit: fold this level's undo records into the parent
            // transaction (if any) so an outer rollback still undoes them.
            if let Some(parent) = self.tx_stack.last_mut() {
                parent.extend(log);
            }
            return;
        }
        for undo in log.into_iter().rev() {
            match undo {
                Undo::Created { name, handle } => {
                    if let Some(v) = self.by_name.get_mut(&name) {
                        v.retain(|h| h != &handle);
                        if v.is_empty() {
                            self.by_name.remove(&name);
                        }
                    }
                }
                Undo::FieldChanged { handle, field, prev } => match prev {
                    Some(value) => handle.set(&field, value),
                    None => {
                        handle.0.borrow_mut().fields.remove(&field);
                    }
                },
                Undo::Removed { name, handle } => {
                    self.by_name.entry(name).or_default().push(handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_field_is_noop_when_value_unchanged() {
        let mut store = MemoryFactStore::new();
        let f = store.create("x");
        store.set_field(&f, "a", FieldValue::Int(1));
        store.reset_changes();
        store.set_field(&f, "a", FieldValue::Int(1));
        assert!(store.changes().is_empty());
    }

    #[test]
    fn rollback_undoes_creation_and_mutation() {
        let mut store = MemoryFactStore::new();
        store.push_tx();
        let f = store.create("x");
        store.set_field(&f, "a", FieldValue::Int(1));
        store.pop_tx(true);
        assert!(store.lookup("x").is_empty());
    }

    #[test]
    fn commit_keeps_mutations() {
        let mut store = MemoryFactStore::new();
        store.push_tx();
        let f = store.create("x");
        store.set_field(&f, "a", FieldValue::Int(1));
        store.pop_tx(false);
        assert_eq!(store.lookup("x").len(), 1);
        assert_eq!(f.get("a"), Some(FieldValue::Int(1)));
    }

    #[test]
    fn duplicate_copies_all_fields_under_new_name() {
        let mut store = MemoryFactStore::new();
        let f = store.create("a");
        store.set_field(&f, "x", FieldValue::Int(1));
        let g = store.duplicate(&f, "b");
        assert_eq!(g.get("x"), Some(FieldValue::Int(1)));
        assert_eq!(g.name(), "b");
    }
}
