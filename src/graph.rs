// Dependency graph construction (spec §5.1).
//
// `depends[i]` holds the reversed adjacency for node `i`: the set of
// nodes that depend on `i`, i.e. an edge `prereq -> target` is
// recorded at `prereq`'s slot as `target`. This lets topological sort
// walk "whoever I unblock" directly off the node being removed,
// mirroring `graph_build_prereq`/`graph_add_prereq` in the original
// resolver.

use std::collections::HashSet;

use thiserror::Error;

use crate::ident::{Id, Kind};
use crate::vars::Universe;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("target {0:?} is not defined")]
    UndefinedGoal(Id),
    #[error("illegal prerequisite kind for id {0:?}")]
    IllegalPrereqKind(Id),
}

/// One node's reversed-adjacency set: `None` means the node has not
/// been pulled into the graph at all (distinct from an empty, empty set).
#[derive(Clone, Debug, Default)]
pub struct PrereqSet(Option<Vec<Id>>);

impl PrereqSet {
    fn touch(&mut self) {
        if self.0.is_none() {
            self.0 = Some(Vec::new());
        }
    }

    pub fn in_graph(&self) -> bool {
        self.0.is_some()
    }

    pub fn ids(&self) -> &[Id] {
        match &self.0 {
            Some(v) => v,
            None => &[],
        }
    }

    fn push(&mut self, id: Id) {
        self.touch();
        self.0.as_mut().unwrap().push(id);
    }

    /// Replace entry `i` with its deleted-marked copy, the topological
    /// sort's mechanism for "removing" an edge without reallocating.
    pub fn mark_deleted_at(&mut self, i: usize) {
        if let Some(v) = self.0.as_mut() {
            v[i] = v[i].mark_deleted();
        }
    }
}

/// The dependency graph for one goal, indexed by `target/factvar/dresvar`
/// position exactly as `crate::vars::Universe` lays them out.
#[derive(Clone)]
pub struct Graph {
    pub ntarget: usize,
    pub nfactvar: usize,
    pub ndresvar: usize,
    depends: Vec<PrereqSet>,
}

impl Graph {
    fn index_of(&self, id: Id) -> usize {
        let idx = id.index() as usize;
        match id.kind() {
            Some(Kind::DresVar) => idx + self.nfactvar + self.ntarget,
            Some(Kind::FactVar) => idx + self.ntarget,
            Some(Kind::Target) => idx,
            other => panic!("id {:?} has no graph slot (kind {:?})", id, other),
        }
    }

    pub fn prereqs_of(&self, id: Id) -> &PrereqSet {
        &self.depends[self.index_of(id)]
    }

    pub fn prereqs_of_mut(&mut self, id: Id) -> &mut PrereqSet {
        let idx = self.index_of(id);
        &mut self.depends[idx]
    }

    pub fn len(&self) -> usize {
        self.depends.len()
    }

    fn add_edge(&mut self, target: Id, prereq: Id) {
        let idx = self.index_of(prereq);
        self.depends[idx].push(target);
    }

    fn has_edge(&self, target: Id, prereq: Id) -> bool {
        self.prereqs_of(prereq).ids().iter().any(|&id| id == target)
    }

    fn build_prereq(&mut self, universe: &Universe, target: Id, prereq: Id) -> Result<(), GraphError> {
        if self.has_edge(target, prereq) {
            return Ok(());
        }
        self.add_edge(target, prereq);

        match prereq.kind() {
            Some(Kind::Target) => {
                let t = universe.target(prereq).ok_or(GraphError::UndefinedGoal(prereq))?;
                for &sub in &t.prereqs {
                    self.build_prereq(universe, prereq, sub)?;
                }
                Ok(())
            }
            Some(Kind::FactVar) | Some(Kind::DresVar) => Ok(()),
            _ => Err(GraphError::IllegalPrereqKind(prereq)),
        }
    }

    /// Pull in targets that are prerequisites-of-prerequisites but are
    /// never themselves a direct prerequisite of anything already in
    /// the graph (the original's "leaf sweep").
    fn add_leafs(&mut self) {
        let mut pulled_in = HashSet::new();
        for idx in 0..self.depends.len() {
            let ids: Vec<Id> = self.depends[idx].ids().to_vec();
            for id in ids {
                if id.kind() == Some(Kind::Target) && !self.depends[id.index() as usize].in_graph() {
                    pulled_in.insert(id.index() as usize);
                }
            }
        }
        for idx in pulled_in {
            self.depends[idx].touch();
        }
    }
}

/// Build the dependency graph rooted at `goal` (spec §5.1).
pub fn build_graph(universe: &Universe, goal: Id) -> Result<Graph, GraphError> {
    if !goal.is_defined() {
        return Err(GraphError::UndefinedGoal(goal));
    }
    let n = universe.ntarget() + universe.nfactvar() + universe.ndresvar();
    let mut graph = Graph {
        ntarget: universe.ntarget(),
        nfactvar: universe.nfactvar(),
        ndresvar: universe.ndresvar(),
        depends: vec![PrereqSet::default(); n],
    };

    let target = universe.target(goal).ok_or(GraphError::UndefinedGoal(goal))?;
    for &prereq in &target.prereqs {
        graph.build_prereq(universe, goal, prereq)?;
    }
    graph.add_leafs();
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Universe;

    #[test]
    fn build_graph_records_reversed_edges() {
        let mut universe = Universe::new();
        let a = universe.declare_target("a");
        let b = universe.declare_target("b");
        universe.target_mut(a).prereqs.push(b);
        let graph = build_graph(&universe, a).unwrap();
        assert!(graph.prereqs_of(b).ids().contains(&a));
    }

    #[test]
    fn goal_target_with_only_outgoing_prereqs_is_pulled_into_its_own_slot() {
        // `goal` never appears as anyone's prerequisite, so its own
        // depends-slot is only touched by the leaf sweep.
        let mut universe = Universe::new();
        let goal = universe.declare_target("goal");
        let mid = universe.declare_target("mid");
        let leaf = universe.declare_target("leaf");
        universe.target_mut(goal).prereqs.push(mid);
        universe.target_mut(mid).prereqs.push(leaf);
        let graph = build_graph(&universe, goal).unwrap();
        assert!(graph.prereqs_of(goal).in_graph());
    }
}
