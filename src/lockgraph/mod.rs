//! # lockgraph
//!
//! The acquisition-order graph.
//! Node is of type LockId.
//! Edge (A, B, Vec<Acquire>) means some thread context acquires lock B while
//! provably holding lock A, recorded once per (context, ordered pair).
//! If there exists a cycle of length >= 2 in this graph whose edges come from
//! at least two distinct thread contexts, then there is possibly a deadlock.

use std::collections::HashMap;

use petgraph::dot::{Config, Dot};
use petgraph::graphmap::DiGraphMap;
use petgraph::{Directed, Graph};

use crate::callgraph::ThreadContextId;
use crate::cfg::{LockId, Program};
use crate::parse::Span;

/// One witness of `acquired` being taken while the edge's source lock was in
/// the must-lockset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Acquire {
    pub ctx: ThreadContextId,
    pub span: Span,
}

pub struct LockGraph {
    pub graph: DiGraphMap<LockId, Vec<Acquire>>,
}

impl LockGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraphMap::new(),
        }
    }

    /// Record that `acquired` was taken while `held` was in the must-lockset.
    /// At most one record per (thread context, ordered pair).
    pub fn add_acquire(&mut self, held: LockId, acquired: LockId, acquire: Acquire) {
        if let Some(sites) = self.graph.edge_weight_mut(held, acquired) {
            if !sites.iter().any(|a| a.ctx == acquire.ctx) {
                sites.push(acquire);
            }
        } else {
            self.graph.add_edge(held, acquired, vec![acquire]);
        }
    }

    pub fn acquires(&self, held: LockId, acquired: LockId) -> &[Acquire] {
        self.graph
            .edge_weight(held, acquired)
            .map(|sites| sites.as_slice())
            .unwrap_or(&[])
    }

    /// Enumerate the elementary cycles of length >= 2, each found exactly
    /// once: the DFS starts only at a cycle's smallest lock and explores
    /// larger locks, so a cycle is emitted in exactly one canonical rotation.
    /// Node and successor orders are sorted, making the result independent of
    /// insertion order.
    pub fn cycles(&self) -> Vec<Vec<LockId>> {
        let mut cycles = Vec::new();
        let mut nodes: Vec<LockId> = self.graph.nodes().collect();
        nodes.sort_unstable();
        for &start in &nodes {
            let mut path = vec![start];
            let mut stack = vec![(self.sorted_successors(start), 0usize)];
            while let Some((succs, next)) = stack.last_mut() {
                if *next < succs.len() {
                    let candidate = succs[*next];
                    *next += 1;
                    if candidate == start {
                        if path.len() >= 2 {
                            cycles.push(path.clone());
                        }
                    } else if candidate > start && !path.contains(&candidate) {
                        path.push(candidate);
                        stack.push((self.sorted_successors(candidate), 0));
                    }
                } else {
                    stack.pop();
                    path.pop();
                }
            }
        }
        cycles
    }

    fn sorted_successors(&self, node: LockId) -> Vec<LockId> {
        let mut succs: Vec<LockId> = self.graph.neighbors(node).collect();
        succs.sort_unstable();
        succs
    }

    /// Print the acquisition-order graph in dot format.
    pub fn dot(&self, program: &Program) {
        let mut named: Graph<String, String, Directed> = Graph::new();
        let mut nodes: Vec<LockId> = self.graph.nodes().collect();
        nodes.sort_unstable();
        let mut index = HashMap::new();
        for &node in &nodes {
            index.insert(node, named.add_node(program.lock(node).name.clone()));
        }
        for &held in &nodes {
            for acquired in self.sorted_successors(held) {
                let label = self
                    .acquires(held, acquired)
                    .iter()
                    .map(|a| format!("ctx{}@{}", a.ctx.0, a.span))
                    .collect::<Vec<_>>()
                    .join(", ");
                named.add_edge(index[&held], index[&acquired], label);
            }
        }
        println!(
            "{:?}",
            Dot::with_config(&named, &[Config::GraphContentOnly])
        );
    }
}
