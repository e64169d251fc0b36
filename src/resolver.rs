// Goal resolution (spec §5, §6): the `update_goal` state machine.
//
// Mirrors `dres_update_goal`/`dres_check_target` from the original
// resolver closely: `finalize_targets` eagerly builds each target's
// topologically sorted check order (every target is its own graph's
// root, and — via the graph's leaf sweep, `crate::graph` — ends up as
// the *last* entry in its own order). `update_goal` then either runs a
// prereq-less target directly, or walks that order running each
// target-kind entry's actions whenever one of its *direct*
// prerequisites carries a newer stamp than its own; the last entry is
// always the goal itself, so this single flattened walk both checks
// every transitive dependency and finally runs the goal's own body.

use thiserror::Error;

use crate::fact_store::FactStore;
use crate::graph::{build_graph, GraphError};
use crate::ident::{Id, Kind};
use crate::method::MethodTable;
use crate::toposort::{sort_graph, SortError};
use crate::value::Value;
use crate::vars::{Target, Universe};
use crate::vm::Interpreter;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no such target {0:?}")]
    UndefinedGoal(String),
    #[error("policy declares no targets")]
    NoTargets,
    #[error("local {0:?} was never declared as a dresvar")]
    UndeclaredLocal(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Sort(#[from] SortError),
}

impl ResolverError {
    /// Signed status code this error corresponds to (spec §6).
    pub fn code(&self) -> i32 {
        match self {
            ResolverError::UndefinedGoal(_) => crate::error::codes::EINVAL,
            ResolverError::NoTargets => crate::error::codes::EINVAL,
            ResolverError::UndeclaredLocal(_) => crate::error::codes::ENOENT,
            ResolverError::Graph(_) => crate::error::codes::EINVAL,
            ResolverError::Sort(_) => crate::error::codes::EINVAL,
        }
    }
}

/// Build every target's topologically sorted check order. Idempotent
/// per target (`Target::is_finalized`), so it is safe to call eagerly
/// from `Policy::finalize` and again, lazily, from the first
/// `update_goal` (`finalize_targets` in the original).
pub fn finalize_targets(universe: &Universe) -> Result<(), ResolverError> {
    for i in 0..universe.ntarget() {
        let id = Id::new(Kind::Target, i as u32);
        let target = universe.target(id).expect("index within ntarget()");
        if target.is_finalized() {
            continue;
        }
        let graph = build_graph(universe, id)?;
        let order = sort_graph(universe, &graph)?;
        target.set_dependencies(order);
    }
    Ok(())
}

fn stamp_of(universe: &Universe, id: Id) -> u64 {
    match id.kind() {
        Some(Kind::Target) => universe.target(id).map(|t| t.stamp()).unwrap_or(0),
        Some(Kind::FactVar) => universe.factvar(id).map(|v| v.stamp()).unwrap_or(0),
        Some(Kind::DresVar) => universe.dresvar(id).map(|v| v.stamp()).unwrap_or(0),
        _ => 0,
    }
}

/// Poll the fact store's change log and bump the stamp of every
/// prerequisite-flagged factvar whose backing fact changed since the
/// last poll (`dres_store_check`).
fn poll_factvar_changes(universe: &Universe, store: &mut dyn FactStore, tx: i64, stamp: u64) {
    let changed = store.changes();
    if changed.is_empty() {
        return;
    }
    for name in &changed {
        if let Some(id) = universe.factvar_by_name(name) {
            let var = universe.factvar(id).expect("looked up by name");
            if var.flags.is_prereq {
                var.bump(tx, stamp);
            }
        }
    }
    store.reset_changes();
}

/// Restore every target/factvar/dresvar stamp bumped under `tx` back
/// to its pre-transaction value (`dres_store_tx_rollback`). Unlike the
/// fact store's own undo log, this has to walk every variable table
/// since a transaction may have bumped stamps on targets well before
/// the one whose failure ultimately aborted it.
fn rollback_vars(universe: &Universe, tx: i64) {
    for target in universe.targets() {
        target.rollback(tx);
    }
    for var in universe.factvars() {
        var.rollback(tx);
    }
    for var in universe.dresvars() {
        var.rollback(tx);
    }
}

fn apply_locals(universe: &Universe, locals: &[(String, Value)]) -> Result<(), ResolverError> {
    for (name, value) in locals {
        let id = universe
            .dresvar_by_name(name)
            .ok_or_else(|| ResolverError::UndeclaredLocal(name.clone()))?;
        universe.set_dresvar_value(id, value.clone());
    }
    Ok(())
}

/// Run a target's compiled body, if any (`dres_run_actions`). A
/// target with no statements (no bytecode at all) trivially succeeds.
fn run_actions(
    universe: &Universe,
    store: &mut dyn FactStore,
    methods: &MethodTable,
    resolve: &mut dyn FnMut(Option<&str>) -> i32,
    target: &Target,
) -> i32 {
    if target.code.is_empty() {
        return 1;
    }
    let mut interp = Interpreter::new(store, methods, universe, Box::new(|g: Option<&str>| resolve(g)));
    match interp.exec(&target.code) {
        Ok(status) => status,
        Err(e) => -e.code(),
    }
}

/// Decide whether `id` (a target) needs updating and run its actions
/// if so (`dres_check_target`). Unlike `update_goal`'s flattened walk
/// over the whole dependency order, this only ever looks at `id`'s
/// *direct* prerequisites — by the time it runs, the topological order
/// guarantees every transitive prerequisite's stamp is already current.
fn check_target(
    universe: &Universe,
    store: &mut dyn FactStore,
    methods: &MethodTable,
    resolve: &mut dyn FnMut(Option<&str>) -> i32,
    id: Id,
) -> i32 {
    let target = match universe.target(id) {
        Some(t) => t,
        None => return -crate::error::codes::EINVAL,
    };

    let needs_update = target.prereqs.is_empty()
        || target
            .prereqs
            .iter()
            .any(|&p| stamp_of(universe, p) > target.stamp());

    if !needs_update {
        return 1;
    }

    let status = run_actions(universe, store, methods, resolve, target);
    if status > 0 {
        target.bump(universe.current_tx(), universe.current_stamp());
    }
    status
}

/// Update `goal` (or the first declared target, if `goal` is `None`),
/// running whichever transitive prerequisites are out of date along
/// the way (`dres_update_goal`).
///
/// `locals` pre-declared dres-variables are set before the goal's own
/// transaction begins running, mirroring `push_locals`/`pop_locals` —
/// reinterpreted here as setting the dresvar's persistent scalar
/// directly (see `crate::vars::Universe::dresvar_values`) rather than
/// pushing a VM scope frame, since in this port a dresvar's value
/// lives in the `Universe`, not in per-call VM locals.
pub fn update_goal(
    universe: &Universe,
    store: &mut dyn FactStore,
    methods: &MethodTable,
    goal: Option<&str>,
    locals: &[(String, Value)],
) -> Result<i32, ResolverError> {
    finalize_targets(universe)?;

    let goal_id = match goal {
        Some(name) => universe
            .target_by_name(name)
            .ok_or_else(|| ResolverError::UndefinedGoal(name.to_string()))?,
        None => {
            if universe.ntarget() == 0 {
                return Err(ResolverError::NoTargets);
            }
            Id::new(Kind::Target, 0)
        }
    };

    let own_tx = universe.begin_tx();
    if own_tx {
        store.push_tx();
    }
    let stamp = universe.bump_stamp();
    let tx = universe.current_tx();

    poll_factvar_changes(universe, store, tx, stamp);

    // `resolve` is how the `dres()`/`resolve()` builtin recurses back
    // into goal resolution. It must share the same `store` the VM
    // below is already driving, so it closes over a raw pointer to it
    // rather than a second `&mut` borrow.
    let store_ptr: *mut dyn FactStore = &mut *store;
    let mut resolve = move |g: Option<&str>| -> i32 {
        // SAFETY: the VM calls this closure synchronously while
        // executing one target's bytecode; the `&mut dyn FactStore`
        // borrow driving that same VM call is not touched again until
        // the closure returns, so the two accesses never overlap.
        let reentrant_store: &mut dyn FactStore = unsafe { &mut *store_ptr };
        match update_goal(universe, reentrant_store, methods, g, &[]) {
            Ok(status) => status,
            Err(e) => -e.code(),
        }
    };

    let result = apply_locals(universe, locals).map(|()| {
        let target = universe.target(goal_id).expect("resolved above");
        if target.prereqs.is_empty() {
            run_actions(universe, store, methods, &mut resolve, target)
        } else {
            let mut status = 1;
            for dep in target.dependencies() {
                if dep.kind() != Some(Kind::Target) {
                    continue;
                }
                status = check_target(universe, store, methods, &mut resolve, dep);
                if status <= 0 {
                    break;
                }
            }
            status
        }
    });

    let status = match result {
        Ok(status) => status,
        Err(e) => {
            if own_tx {
                rollback_vars(universe, tx);
                store.pop_tx(true);
            }
            universe.end_tx(own_tx);
            return Err(e);
        }
    };

    if status > 0 {
        universe.target(goal_id).expect("resolved above").bump(tx, stamp);
        if own_tx {
            store.pop_tx(false);
        }
    } else if own_tx {
        rollback_vars(universe, tx);
        store.pop_tx(true);
    }
    universe.end_tx(own_tx);

    Ok(status)
}
