//! # callgraph
//!
//! This module generates the callgraph of the analyzed program.
//! Node is of type FuncId.
//! Edge (A, B, Vec<(CallKind, Span)>) means function A calls (or spawns a
//! thread running) function B at the listed sites.
//! Thread contexts are derived from the `pthread_create` sites reachable
//! from `main`: one context for the main thread plus one per spawn site.

use std::collections::HashSet;

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::visit::{Bfs, EdgeRef, IntoNodeReferences};
use petgraph::{Directed, Graph};

use log::warn;

use crate::cfg::{FuncId, Program, StatementKind};
use crate::parse::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Direct,
    Spawn,
}

/// Abstract identifier of a thread-creation site; id 0 is the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadContextId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadContext {
    pub id: ThreadContextId,
    pub root: FuncId,
    pub spawn: Option<Span>,
}

impl ThreadContext {
    pub fn describe(&self, program: &Program) -> String {
        match self.spawn {
            None => "main thread".to_string(),
            Some(span) => format!(
                "thread spawned at {}:{} ({})",
                program.file,
                span,
                program.function(self.root).name
            ),
        }
    }
}

pub struct CallGraph {
    pub graph: Graph<FuncId, Vec<(CallKind, Span)>, Directed>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
        }
    }

    pub fn func_index(&self, func: FuncId) -> Option<NodeIndex> {
        for (idx, &weight) in self.graph.node_references() {
            if weight == func {
                return Some(idx);
            }
        }
        None
    }

    pub fn analyze(&mut self, funcs: Vec<FuncId>, program: &Program) {
        let mut worklist = funcs;
        let mut scanned = HashSet::new();
        while let Some(caller) = worklist.pop() {
            // skip if caller has been scanned
            if !scanned.insert(caller) {
                continue;
            }
            let caller_idx = self
                .func_index(caller)
                .unwrap_or_else(|| self.graph.add_node(caller));
            let body = &program.function(caller).body;
            for block in &body.blocks {
                for stmt in &block.statements {
                    let (kind, callee) = match stmt.kind {
                        StatementKind::Call(f) => (CallKind::Direct, f),
                        StatementKind::ThreadCreate(f) => (CallKind::Spawn, f),
                        _ => continue,
                    };
                    let callee_idx: NodeIndex = self
                        .func_index(callee)
                        .unwrap_or_else(|| self.graph.add_node(callee));
                    if let Some(edge_idx) = self.graph.find_edge(caller_idx, callee_idx) {
                        // update edge weight
                        self.graph
                            .edge_weight_mut(edge_idx)
                            .unwrap()
                            .push((kind, stmt.span));
                    } else {
                        // add edge if not exists
                        self.graph
                            .add_edge(caller_idx, callee_idx, vec![(kind, stmt.span)]);
                    }
                    worklist.push(callee);
                }
            }
        }
    }

    /// Functions reachable from `root` through call and spawn edges.
    pub fn reachable_from(&self, root: FuncId) -> HashSet<FuncId> {
        let mut reachable = HashSet::new();
        if let Some(root_idx) = self.func_index(root) {
            let mut bfs = Bfs::new(&self.graph, root_idx);
            while let Some(node_id) = bfs.next(&self.graph) {
                reachable.insert(*self.graph.node_weight(node_id).unwrap());
            }
        }
        reachable
    }

    /// One context for the main thread plus one per reachable spawn site,
    /// ordered by spawn location. Context ids index the returned list.
    pub fn thread_contexts(&self, program: &Program) -> Vec<ThreadContext> {
        let main = match program.main_func() {
            Some(main) => main,
            None => {
                warn!("no `main` function in {}; nothing to analyze", program.file);
                return Vec::new();
            }
        };
        let reachable = self.reachable_from(main);
        let mut spawns: Vec<(Span, FuncId)> = Vec::new();
        for edge in self.graph.edge_references() {
            let source = *self.graph.node_weight(edge.source()).unwrap();
            if !reachable.contains(&source) {
                continue;
            }
            let target = *self.graph.node_weight(edge.target()).unwrap();
            for (kind, span) in edge.weight() {
                if let CallKind::Spawn = kind {
                    spawns.push((*span, target));
                }
            }
        }
        spawns.sort();
        spawns.dedup();

        let mut contexts = vec![ThreadContext {
            id: ThreadContextId(0),
            root: main,
            spawn: None,
        }];
        for (span, root) in spawns {
            contexts.push(ThreadContext {
                id: ThreadContextId(contexts.len() as u32),
                root,
                spawn: Some(span),
            });
        }
        contexts
    }

    /// Print the callgraph in dot format.
    pub fn dot(&self, program: &Program) {
        let named = self.graph.map(
            |_, func| program.function(*func).name.clone(),
            |_, sites| {
                sites
                    .iter()
                    .map(|(kind, span)| format!("{:?}@{}", kind, span))
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        );
        println!(
            "{:?}",
            Dot::with_config(&named, &[Config::GraphContentOnly])
        );
    }
}
