// Topological sort of a dependency graph (spec §5.1), Kahn's
// algorithm over the reversed-adjacency `Graph` built in `crate::graph`.
//
// Queue seeding order is significant: DRES-variables first, then
// fact-variables, then targets — each group in index order — matching
// `dres_sort_graph`'s three separate priming loops. A target with no
// prerequisites (`prereqs` empty or absent) seeds the queue directly;
// everything else waits for its incoming-edge count to hit zero.

use std::collections::VecDeque;

use thiserror::Error;

use crate::graph::Graph;
use crate::ident::{Id, Kind};
use crate::vars::Universe;

#[derive(Debug, Error)]
pub enum SortError {
    #[error("dependency graph has a cycle")]
    Cycle,
}

/// Topologically sort `graph`'s in-graph nodes, returning them in an
/// order where every node precedes everything that depends on it.
pub fn sort_graph(universe: &Universe, graph: &Graph) -> Result<Vec<Id>, SortError> {
    let n = graph.len();
    let mut indegree = vec![0i64; n];
    let mut queue: VecDeque<Id> = VecDeque::new();

    let idx = |id: Id| -> usize {
        let i = id.index() as usize;
        match id.kind() {
            Some(Kind::DresVar) => i + graph.nfactvar + graph.ntarget,
            Some(Kind::FactVar) => i + graph.ntarget,
            Some(Kind::Target) => i,
            _ => unreachable!(),
        }
    };

    for i in 0..universe.ndresvar() {
        let id = Id::new(Kind::DresVar, i as u32);
        if !graph.prereqs_of(id).in_graph() {
            continue;
        }
        queue.push_back(id);
        for &dep in graph.prereqs_of(id).ids() {
            indegree[idx(dep)] += 1;
        }
    }

    for i in 0..universe.nfactvar() {
        let id = Id::new(Kind::FactVar, i as u32);
        if !graph.prereqs_of(id).in_graph() {
            continue;
        }
        queue.push_back(id);
        for &dep in graph.prereqs_of(id).ids() {
            indegree[idx(dep)] += 1;
        }
    }

    for (i, t) in universe.targets().iter().enumerate() {
        let id = Id::new(Kind::Target, i as u32);
        if !graph.prereqs_of(id).in_graph() {
            continue;
        }
        if t.prereqs.is_empty() {
            queue.push_back(id);
        }
        for &dep in graph.prereqs_of(id).ids() {
            indegree[idx(dep)] += 1;
        }
    }

    let mut graph = graph.clone();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        let edges: Vec<Id> = graph.prereqs_of(node).ids().to_vec();
        for (i, &dep) in edges.iter().enumerate() {
            if dep.is_deleted() {
                continue;
            }
            graph.prereqs_of_mut(node).mark_deleted_at(i);
            let slot = idx(dep);
            indegree[slot] -= 1;
            if indegree[slot] == 0 {
                queue.push_back(dep);
            }
        }
    }

    if indegree.iter().any(|&e| e != 0) {
        return Err(SortError::Cycle);
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::vars::Universe;

    #[test]
    fn linear_chain_sorts_leaves_first() {
        let mut universe = Universe::new();
        let goal = universe.declare_target("goal");
        let mid = universe.declare_target("mid");
        let leaf = universe.declare_target("leaf");
        universe.target_mut(goal).prereqs.push(mid);
        universe.target_mut(mid).prereqs.push(leaf);
        let graph = build_graph(&universe, goal).unwrap();
        let order = sort_graph(&universe, &graph).unwrap();
        let pos = |id: Id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(leaf) < pos(mid));
        assert!(pos(mid) < pos(goal));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut universe = Universe::new();
        let a = universe.declare_target("a");
        let b = universe.declare_target("b");
        universe.target_mut(a).prereqs.push(b);
        universe.target_mut(b).prereqs.push(a);
        let graph = build_graph(&universe, a).unwrap();
        assert!(matches!(sort_graph(&universe, &graph), Err(SortError::Cycle)));
    }
}
