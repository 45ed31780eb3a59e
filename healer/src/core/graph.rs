//! Generic state-graph executor.
//!
//! A graph is a closed set of nodes (an enum implementing [`NodeKey`]), one
//! outgoing edge per node, and an entry point. Each node turns the current
//! state into a partial update; the executor merges it, notifies the
//! observer, then follows the node's edge. Edges are either unconditional or
//! a routing function evaluated on the merged state.
//!
//! Completeness is checked once in [`GraphBuilder::compile`], so a compiled
//! graph can never route to an unknown node at run time.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use anyhow::{Result, bail};
use tracing::{debug, instrument};

/// Closed set of node identifiers.
pub trait NodeKey: Copy + Eq + Hash + fmt::Debug + 'static {
    const ALL: &'static [Self];

    fn name(self) -> &'static str;
}

/// State that absorbs partial updates (last write wins per field).
pub trait Merge {
    type Delta;

    fn merge(&mut self, delta: &Self::Delta);
}

/// Where control goes after a node completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next<N> {
    Node(N),
    Terminal,
}

type NodeFn<'a, S> = Box<dyn FnMut(&S) -> <S as Merge>::Delta + 'a>;
type RouteFn<'a, N, S> = Box<dyn Fn(&S) -> Next<N> + 'a>;

enum Edge<'a, N, S> {
    Always(Next<N>),
    Route(RouteFn<'a, N, S>),
}

/// Accumulates nodes and edges; [`compile`](Self::compile) validates them.
pub struct GraphBuilder<'a, N: NodeKey, S: Merge> {
    nodes: HashMap<N, NodeFn<'a, S>>,
    edges: HashMap<N, Edge<'a, N, S>>,
    entry: Option<N>,
    problems: Vec<String>,
}

impl<'a, N: NodeKey, S: Merge> Default for GraphBuilder<'a, N, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, N: NodeKey, S: Merge> GraphBuilder<'a, N, S> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            entry: None,
            problems: Vec::new(),
        }
    }

    pub fn node<F>(mut self, id: N, body: F) -> Self
    where
        F: FnMut(&S) -> S::Delta + 'a,
    {
        if self.nodes.insert(id, Box::new(body)).is_some() {
            self.problems
                .push(format!("node {} registered twice", id.name()));
        }
        self
    }

    /// Unconditional edge `from -> to`.
    pub fn edge(self, from: N, to: N) -> Self {
        self.set_edge(from, Edge::Always(Next::Node(to)))
    }

    /// Unconditional edge from `from` to the terminal marker.
    pub fn finish(self, from: N) -> Self {
        self.set_edge(from, Edge::Always(Next::Terminal))
    }

    /// Conditional edge evaluated on the merged state after `from` runs.
    pub fn route<R>(self, from: N, router: R) -> Self
    where
        R: Fn(&S) -> Next<N> + 'a,
    {
        self.set_edge(from, Edge::Route(Box::new(router)))
    }

    pub fn entry(mut self, id: N) -> Self {
        self.entry = Some(id);
        self
    }

    fn set_edge(mut self, from: N, edge: Edge<'a, N, S>) -> Self {
        if self.edges.insert(from, edge).is_some() {
            self.problems
                .push(format!("node {} has more than one outgoing edge", from.name()));
        }
        self
    }

    /// Validate completeness and freeze the graph.
    pub fn compile(self) -> Result<Graph<'a, N, S>> {
        let mut problems = self.problems;
        for id in N::ALL {
            if !self.nodes.contains_key(id) {
                problems.push(format!("node {} has no body", id.name()));
            }
            if !self.edges.contains_key(id) {
                problems.push(format!("node {} has no outgoing edge", id.name()));
            }
        }
        for edge in self.edges.values() {
            if let Edge::Always(Next::Node(to)) = edge {
                if !self.nodes.contains_key(to) {
                    problems.push(format!("edge targets unregistered node {}", to.name()));
                }
            }
        }
        let entry = match self.entry {
            Some(entry) => entry,
            None => {
                problems.push("entry node not set".to_string());
                N::ALL[0]
            }
        };
        if !problems.is_empty() {
            bail!("graph is incomplete:\n- {}", problems.join("\n- "));
        }
        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entry,
        })
    }
}

/// A compiled, runnable graph.
pub struct Graph<'a, N: NodeKey, S: Merge> {
    nodes: HashMap<N, NodeFn<'a, S>>,
    edges: HashMap<N, Edge<'a, N, S>>,
    entry: N,
}

/// Final state plus the order in which nodes ran.
#[derive(Debug)]
pub struct Execution<N, S> {
    pub state: S,
    pub visited: Vec<N>,
}

impl<'a, N: NodeKey, S: Merge> Graph<'a, N, S> {
    pub fn entry_node(&self) -> N {
        self.entry
    }

    /// Run from the entry node until a terminal edge is taken.
    ///
    /// `observer` sees every node's delta together with the merged state,
    /// strictly in execution order.
    #[instrument(skip_all, fields(entry = self.entry.name()))]
    pub fn run<F>(&mut self, mut state: S, mut observer: F) -> Execution<N, S>
    where
        F: FnMut(N, &S::Delta, &S),
    {
        let mut visited = Vec::new();
        let mut current = self.entry;
        loop {
            debug!(node = current.name(), "enter");
            // compile() guarantees every node has a body and an edge.
            let Some(body) = self.nodes.get_mut(&current) else {
                break;
            };
            let delta = body(&state);
            state.merge(&delta);
            visited.push(current);
            observer(current, &delta, &state);

            let next = match self.edges.get(&current) {
                Some(Edge::Always(next)) => *next,
                Some(Edge::Route(router)) => router(&state),
                None => Next::Terminal,
            };
            match next {
                Next::Node(node) => current = node,
                Next::Terminal => {
                    debug!(node = current.name(), steps = visited.len(), "terminal");
                    break;
                }
            }
        }
        Execution { state, visited }
    }
}
