// Target and variable tables (spec §3, §5).
//
// Three append-only, name-indexed tables: targets, fact-variables, and
// DRES-variables, mirroring `dres_target_t`/`dres_variable_t` and the
// three parallel arrays hung off `dres_t` in the original resolver.
// Ids are assigned densely as entries are declared, so a table's
// length is always its next free index.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::ident::{Id, Kind};
use crate::instr::Chunk;
use crate::value::Value;

/// `DRES_VAR_PREREQ`: this variable is itself listed as someone's
/// prerequisite, so the resolver must bump its stamp on write.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VarFlags {
    pub is_prereq: bool,
}

/// A fact- or DRES-variable's bookkeeping (spec §5.2 stamp discipline).
///
/// Stamp/transaction fields are `Cell`s rather than plain fields so
/// that the resolver, which recurses through `dres()`/`resolve()`
/// calls while only ever holding a shared `&Universe`, can still bump
/// them (spec §9 design note: re-entrant resolution rides Rust's own
/// call stack, which rules out requiring `&mut Universe` mid-recursion).
#[derive(Debug)]
pub struct Variable {
    pub id: Id,
    pub name: String,
    stamp: Cell<u64>,
    tx_id: Cell<i64>,
    tx_stamp: Cell<u64>,
    pub flags: VarFlags,
}

impl Variable {
    fn new(id: Id, name: &str) -> Variable {
        Variable {
            id,
            name: name.to_string(),
            stamp: Cell::new(0),
            tx_id: Cell::new(-1),
            tx_stamp: Cell::new(0),
            flags: VarFlags::default(),
        }
    }

    pub fn stamp(&self) -> u64 {
        self.stamp.get()
    }

    /// Record a write at `stamp` within transaction `tx`; the first
    /// write inside a given transaction shadow-saves the prior stamp
    /// so a rollback can restore it (spec §5.2).
    pub fn bump(&self, tx: i64, stamp: u64) {
        if self.tx_id.get() != tx {
            self.tx_id.set(tx);
            self.tx_stamp.set(self.stamp.get());
        }
        self.stamp.set(stamp);
    }

    pub fn rollback(&self, tx: i64) {
        if self.tx_id.get() == tx {
            self.stamp.set(self.tx_stamp.get());
            self.tx_id.set(-1);
        }
    }
}

/// A target's compiled body plus its prerequisite list and stamp
/// bookkeeping (`dres_target_t`).
#[derive(Debug)]
pub struct Target {
    pub id: Id,
    pub name: String,
    pub prereqs: Vec<Id>,
    pub code: Chunk,
    stamp: Cell<u64>,
    tx_id: Cell<i64>,
    tx_stamp: Cell<u64>,
    /// Topologically sorted check order, filled in lazily the first
    /// time the resolver visits this target (`RefCell` for the same
    /// reason as the stamp fields: finalizing one target must not
    /// require `&mut Universe` while a sibling's resolution is live
    /// further up the call stack).
    dependencies: RefCell<Vec<Id>>,
}

impl Target {
    fn new(id: Id, name: &str) -> Target {
        Target {
            id,
            name: name.to_string(),
            prereqs: Vec::new(),
            code: Chunk::new(),
            stamp: Cell::new(0),
            tx_id: Cell::new(-1),
            tx_stamp: Cell::new(0),
            dependencies: RefCell::new(Vec::new()),
        }
    }

    pub fn stamp(&self) -> u64 {
        self.stamp.get()
    }

    pub fn bump(&self, tx: i64, stamp: u64) {
        if self.tx_id.get() != tx {
            self.tx_id.set(tx);
            self.tx_stamp.set(self.stamp.get());
        }
        self.stamp.set(stamp);
    }

    pub fn rollback(&self, tx: i64) {
        if self.tx_id.get() == tx {
            self.stamp.set(self.tx_stamp.get());
            self.tx_id.set(-1);
        }
    }

    /// Whether `finalize` has already computed this target's check order.
    pub fn is_finalized(&self) -> bool {
        !self.dependencies.borrow().is_empty() || self.prereqs.is_empty()
    }

    pub fn dependencies(&self) -> Vec<Id> {
        self.dependencies.borrow().clone()
    }

    pub fn set_dependencies(&self, deps: Vec<Id>) {
        *self.dependencies.borrow_mut() = deps;
    }
}

/// The three append-only tables, plus the monotonic stamp/tx counters
/// shared by the resolver (spec §5.2).
#[derive(Default)]
pub struct Universe {
    targets: Vec<Target>,
    factvars: Vec<Variable>,
    dresvars: Vec<Variable>,
    /// Scalar storage for dresvars, parallel to `dresvars` by index.
    /// Dresvars are language-level `$name` scalars tracked in the
    /// dependency graph like any other variable, but (unlike
    /// factvars) they have no backing fact — the value lives here
    /// rather than in the fact store.
    dresvar_values: RefCell<Vec<Value>>,
    target_by_name: HashMap<String, Id>,
    factvar_by_name: HashMap<String, Id>,
    dresvar_by_name: HashMap<String, Id>,
    /// Monotonic tick bumped once per `update_goal` call (`dres->stamp`).
    stamp: Cell<u64>,
    /// Current transaction id (`dres->txid`), incremented each time a
    /// call to `update_goal` opens a fresh (non-nested) transaction.
    tx_id: Cell<i64>,
    /// Whether some caller up the (possibly recursive) `update_goal`
    /// call chain already owns the open transaction.
    tx_active: Cell<bool>,
}

impl Universe {
    pub fn new() -> Universe {
        Universe::default()
    }

    pub fn current_stamp(&self) -> u64 {
        self.stamp.get()
    }

    pub fn bump_stamp(&self) -> u64 {
        let next = self.stamp.get() + 1;
        self.stamp.set(next);
        next
    }

    pub fn current_tx(&self) -> i64 {
        self.tx_id.get()
    }

    /// Open a new transaction if none is active, returning whether
    /// this call is the one that owns it (`own_tx` in the original).
    pub fn begin_tx(&self) -> bool {
        if self.tx_active.get() {
            return false;
        }
        self.tx_active.set(true);
        self.tx_id.set(self.tx_id.get() + 1);
        true
    }

    pub fn end_tx(&self, owns: bool) {
        if owns {
            self.tx_active.set(false);
        }
    }

    pub fn ntarget(&self) -> usize {
        self.targets.len()
    }
    pub fn nfactvar(&self) -> usize {
        self.factvars.len()
    }
    pub fn ndresvar(&self) -> usize {
        self.dresvars.len()
    }

    pub fn declare_target(&mut self, name: &str) -> Id {
        if let Some(&id) = self.target_by_name.get(name) {
            return id;
        }
        let id = Id::new(Kind::Target, self.targets.len() as u32);
        self.targets.push(Target::new(id, name));
        self.target_by_name.insert(name.to_string(), id);
        id
    }

    pub fn declare_factvar(&mut self, name: &str) -> Id {
        if let Some(&id) = self.factvar_by_name.get(name) {
            return id;
        }
        let id = Id::new(Kind::FactVar, self.factvars.len() as u32);
        self.factvars.push(Variable::new(id, name));
        self.factvar_by_name.insert(name.to_string(), id);
        id
    }

    pub fn declare_dresvar(&mut self, name: &str) -> Id {
        if let Some(&id) = self.dresvar_by_name.get(name) {
            return id;
        }
        let id = Id::new(Kind::DresVar, self.dresvars.len() as u32);
        self.dresvars.push(Variable::new(id, name));
        self.dresvar_values.get_mut().push(Value::Nil);
        self.dresvar_by_name.insert(name.to_string(), id);
        id
    }

    pub fn dresvar_value(&self, id: Id) -> Value {
        self.dresvar_values
            .borrow()
            .get(id.index() as usize)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn set_dresvar_value(&self, id: Id, value: Value) {
        if let Some(slot) = self.dresvar_values.borrow_mut().get_mut(id.index() as usize) {
            *slot = value;
        }
    }

    pub fn target(&self, id: Id) -> Option<&Target> {
        self.targets.get(id.index() as usize)
    }
    pub fn target_mut(&mut self, id: Id) -> &mut Target {
        &mut self.targets[id.index() as usize]
    }
    pub fn target_by_name(&self, name: &str) -> Option<Id> {
        self.target_by_name.get(name).copied()
    }

    pub fn factvar(&self, id: Id) -> Option<&Variable> {
        self.factvars.get(id.index() as usize)
    }
    pub fn factvar_mut(&mut self, id: Id) -> &mut Variable {
        &mut self.factvars[id.index() as usize]
    }
    pub fn factvar_by_name(&self, name: &str) -> Option<Id> {
        self.factvar_by_name.get(name).copied()
    }

    pub fn dresvar(&self, id: Id) -> Option<&Variable> {
        self.dresvars.get(id.index() as usize)
    }
    pub fn dresvar_mut(&mut self, id: Id) -> &mut Variable {
        &mut self.dresvars[id.index() as usize]
    }
    pub fn dresvar_by_name(&self, name: &str) -> Option<Id> {
        self.dresvar_by_name.get(name).copied()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
    pub fn factvars(&self) -> &[Variable] {
        &self.factvars
    }
    pub fn dresvars(&self) -> &[Variable] {
        &self.dresvars
    }

    /// Resolve any id to its display name, for logging and debug dumps.
    pub fn name_of(&self, id: Id) -> String {
        match id.kind() {
            Some(Kind::Target) => self
                .target(id)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| format!("<target#{}>", id.index())),
            Some(Kind::FactVar) => self
                .factvar(id)
                .map(|v| v.name.clone())
                .unwrap_or_else(|| format!("<factvar#{}>", id.index())),
            Some(Kind::DresVar) => self
                .dresvar(id)
                .map(|v| v.name.clone())
                .unwrap_or_else(|| format!("<dresvar#{}>", id.index())),
            _ => format!("{:?}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_target_is_idempotent_by_name() {
        let mut u = Universe::new();
        let a = u.declare_target("x");
        let b = u.declare_target("x");
        assert_eq!(a, b);
        assert_eq!(u.ntarget(), 1);
    }

    #[test]
    fn bump_shadow_saves_stamp_once_per_transaction() {
        let v = Variable::new(Id::new(Kind::FactVar, 0), "v");
        v.bump(1, 10);
        v.bump(1, 20);
        assert_eq!(v.tx_stamp.get(), 0);
        v.rollback(1);
        assert_eq!(v.stamp(), 0);
    }

    #[test]
    fn rollback_is_noop_for_mismatched_transaction() {
        let v = Variable::new(Id::new(Kind::FactVar, 0), "v");
        v.bump(1, 10);
        v.rollback(2);
        assert_eq!(v.stamp(), 10);
    }
}
