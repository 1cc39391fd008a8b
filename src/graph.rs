//! The dependency graph: nodes, edges, levels, state marks, and cycle
//! detection (spec §4.1).
//!
//! Grounded on the teacher's `runtime.rs` `DependencyGraph` (edge
//! bookkeeping keyed by a hash map of small vectors) and on the
//! `update_if_necessary`/level-propagation pattern used by
//! `leptos_reactive::runtime::Runtime` and `sycamore-reactive3::scope`,
//! both retrieved as reference examples of the same two-color
//! `Check`/`Dirty` scheme this module implements.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::{BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CoreError;

pub(crate) type FxIndexSet<K> = indexmap::IndexSet<K, BuildHasherDefault<rustc_hash::FxHasher>>;

/// A process-unique opaque identity for a node (spec §3, "Reference").
///
/// Equality is identity: two `RefId`s compare equal iff they were minted
/// by the same allocation. The optional debug name never participates in
/// equality or hashing.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(u64);

impl std::fmt::Debug for RefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref#{}", self.0)
    }
}

impl RefId {
    /// Allocation order, used by the scheduler to break ties between
    /// same-level nodes deterministically.
    pub(crate) fn sort_key(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> RefId {
        RefId(raw)
    }
}

/// Allocates process-unique [`RefId`]s.
#[derive(Default)]
pub(crate) struct RefIdAllocator(AtomicU64);

impl RefIdAllocator {
    pub(crate) fn alloc(&self) -> RefId {
        RefId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// The kind of a node, fixing which propagation and recomputation rules
/// apply to it (spec §3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A cell whose value is set directly.
    Source,
    /// A cell derived from other nodes.
    Computed,
    /// A read/write projection through a focus function.
    Selector,
    /// A read/write projection that also writes back through the focus.
    Lens,
    /// A side-effectful observer with no value of its own.
    Effect,
    /// A cell backed by an asynchronous fetch (the query cache, §4.8).
    Query,
    /// A typed state-machine's current-state cell (§4.7).
    Machine,
}

impl NodeKind {
    /// Sources are leaves of the dependency graph (level 0) and are the
    /// only kind that may be written directly with `set`.
    pub fn is_source(self) -> bool {
        matches!(self, NodeKind::Source)
    }
}

/// The propagation state of a node (spec §4.1).
///
/// Ordered `Clean < Check < Dirty` so that `max(a, b)` implements the
/// "state := max(state, Check)" rule from the mark-propagation algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// The cached value is known current.
    Clean,
    /// A transitive (not direct) source changed; sources must be
    /// re-verified before deciding whether to recompute.
    Check,
    /// A direct source changed (or the node was just registered); the
    /// node must recompute on next read or flush.
    Dirty,
}

/// Metadata the graph keeps about a single node. The node's value lives
/// in the `Store`'s value map, not here — the graph is value-agnostic
/// (spec §9).
pub(crate) struct GraphNode {
    pub kind: NodeKind,
    pub name: Option<Arc<str>>,
    pub sources: FxIndexSet<RefId>,
    pub observers: FxIndexSet<RefId>,
    pub level: u32,
    pub state: NodeState,
    pub keep_alive: bool,
}

impl GraphNode {
    fn new(kind: NodeKind, name: Option<Arc<str>>) -> Self {
        let level = if kind.is_source() { 0 } else { 0 };
        GraphNode {
            kind,
            name,
            sources: FxIndexSet::default(),
            observers: FxIndexSet::default(),
            level,
            state: NodeState::Dirty,
            keep_alive: false,
        }
    }
}

/// Nodes, edges, and levels. Owns no values; see spec §9 ("cyclic
/// ownership does not arise").
#[derive(Default)]
pub(crate) struct Graph {
    nodes: FxHashMap<RefId, GraphNode>,
}

impl Graph {
    pub(crate) fn register(&mut self, id: RefId, kind: NodeKind, name: Option<Arc<str>>) {
        self.nodes.insert(id, GraphNode::new(kind, name));
    }

    pub(crate) fn remove(&mut self, id: RefId) {
        if let Some(node) = self.nodes.remove(&id) {
            for src in &node.sources {
                if let Some(s) = self.nodes.get_mut(src) {
                    s.observers.shift_remove(&id);
                }
            }
            for obs in &node.observers {
                if let Some(o) = self.nodes.get_mut(obs) {
                    o.sources.shift_remove(&id);
                }
            }
        }
    }

    pub(crate) fn contains(&self, id: RefId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn get(&self, id: RefId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: RefId) -> Option<&mut GraphNode> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn kind(&self, id: RefId) -> Option<NodeKind> {
        self.nodes.get(&id).map(|n| n.kind)
    }

    pub(crate) fn state(&self, id: RefId) -> Option<NodeState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    pub(crate) fn level(&self, id: RefId) -> u32 {
        self.nodes.get(&id).map(|n| n.level).unwrap_or(0)
    }

    pub(crate) fn set_state(&mut self, id: RefId, state: NodeState) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.state = state;
        }
    }

    /// Returns whether `target` is reachable from `start` by following
    /// existing `observers` edges (i.e. whether `target` already
    /// transitively reads `start`).
    fn reachable_via_observers(&self, start: RefId, target: RefId) -> bool {
        let mut seen = FxIndexSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(cur) = queue.pop_front() {
            if !seen.insert(cur) {
                continue;
            }
            if let Some(node) = self.nodes.get(&cur) {
                for &obs in &node.observers {
                    if obs == target {
                        return true;
                    }
                    queue.push_back(obs);
                }
            }
        }
        false
    }

    /// Declares that `observer` reads `source`, rewiring both edge sets
    /// and bumping `observer`'s level. Fails with [`CoreError::Cycle`]
    /// and leaves the graph byte-for-byte unchanged if the edge would
    /// close a cycle.
    pub(crate) fn add_edge(&mut self, source: RefId, observer: RefId) -> Result<(), CoreError> {
        if source == observer {
            return Err(CoreError::Cycle {
                from: source,
                to: observer,
            });
        }
        // A cycle would form iff `source` is already a transitive
        // observer of `observer` — i.e. there is already a path
        // observer -> ... -> source, which combined with the new
        // observer -> source dependency closes a loop.
        if self.reachable_via_observers(observer, source) {
            return Err(CoreError::Cycle {
                from: source,
                to: observer,
            });
        }

        if let Some(s) = self.nodes.get_mut(&source) {
            s.observers.insert(observer);
        }
        if let Some(o) = self.nodes.get_mut(&observer) {
            o.sources.insert(source);
        }

        self.bump_level(observer);
        Ok(())
    }

    /// Reports whether wiring `observer` to read `source` would close a
    /// cycle, without mutating anything. Used to validate a dynamically
    /// rediscovered dependency set before committing it.
    pub(crate) fn would_cycle(&self, observer: RefId, source: RefId) -> bool {
        source == observer || self.reachable_via_observers(observer, source)
    }

    /// Removes all of `node`'s recorded sources (used before each
    /// recomputation, since a node's source set is rediscovered
    /// dynamically — spec §3).
    pub(crate) fn clear_sources(&mut self, node: RefId) {
        let old_sources: Vec<RefId> = self
            .nodes
            .get(&node)
            .map(|n| n.sources.iter().copied().collect())
            .unwrap_or_default();
        for src in old_sources {
            if let Some(s) = self.nodes.get_mut(&src) {
                s.observers.shift_remove(&node);
            }
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.sources.clear();
        }
    }

    fn bump_level(&mut self, start: RefId) {
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(id) = queue.pop_front() {
            let max_source_level = self
                .nodes
                .get(&id)
                .map(|n| n.sources.iter().filter_map(|s| self.nodes.get(s)).map(|s| s.level).max())
                .flatten();
            let new_level = max_source_level.map(|m| m + 1).unwrap_or(0);
            let node = match self.nodes.get_mut(&id) {
                Some(n) => n,
                None => continue,
            };
            if new_level > node.level {
                node.level = new_level;
                let observers: Vec<RefId> = node.observers.iter().copied().collect();
                queue.extend(observers);
            }
        }
    }

    /// Implements mark propagation from a changed source (spec §4.1):
    /// direct observers become `Dirty`, transitive observers become at
    /// least `Check`. Returns every affected node in level order,
    /// including `source` itself, suitable for scheduling a flush.
    pub(crate) fn mark_dirty(&mut self, source: RefId) -> Vec<RefId> {
        self.set_state(source, NodeState::Clean);

        let mut affected = FxIndexSet::default();
        let mut queue = VecDeque::new();
        if let Some(n) = self.nodes.get(&source) {
            for &obs in &n.observers {
                queue.push_back((obs, true));
            }
        }
        while let Some((id, is_direct)) = queue.pop_front() {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.state = if is_direct {
                    NodeState::Dirty
                } else {
                    n.state.max(NodeState::Check)
                };
            }
            if affected.insert(id) {
                if let Some(n) = self.nodes.get(&id) {
                    let next: Vec<RefId> = n.observers.iter().copied().collect();
                    for obs in next {
                        queue.push_back((obs, false));
                    }
                }
            }
        }

        let mut result: Vec<RefId> = affected.into_iter().collect();
        result.sort_by_key(|id| self.level(*id));
        result
    }

    /// Nodes that currently have no observers and are not `keep_alive`.
    /// Used by the query cache / module uninstall paths to decide what
    /// to evict.
    pub(crate) fn is_unobserved(&self, id: RefId) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.observers.is_empty() && !n.keep_alive)
            .unwrap_or(true)
    }

    pub(crate) fn set_keep_alive(&mut self, id: RefId, keep_alive: bool) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.keep_alive = keep_alive;
        }
    }

    pub(crate) fn sources_of(&self, id: RefId) -> Vec<RefId> {
        self.nodes
            .get(&id)
            .map(|n| n.sources.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn observers_of(&self, id: RefId) -> Vec<RefId> {
        self.nodes
            .get(&id)
            .map(|n| n.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn name_of(&self, id: RefId) -> Option<Arc<str>> {
        self.nodes.get(&id).and_then(|n| n.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(g: &mut Graph, alloc: &RefIdAllocator, kind: NodeKind) -> RefId {
        let id = alloc.alloc();
        g.register(id, kind, None);
        id
    }

    #[test]
    fn rejects_cycle_and_leaves_graph_unchanged() {
        let alloc = RefIdAllocator::default();
        let mut g = Graph::default();
        let p = node(&mut g, &alloc, NodeKind::Computed);
        let q = node(&mut g, &alloc, NodeKind::Computed);

        // p reads q
        g.add_edge(q, p).unwrap();
        assert_eq!(g.sources_of(p), vec![q]);

        // now attempt q reads p: would close a cycle
        let err = g.add_edge(p, q).unwrap_err();
        assert!(matches!(err, CoreError::Cycle { .. }));
        assert_eq!(g.sources_of(p), vec![q]);
        assert!(g.sources_of(q).is_empty());
    }

    #[test]
    fn diamond_levels_and_dirty_propagation() {
        let alloc = RefIdAllocator::default();
        let mut g = Graph::default();
        let a = node(&mut g, &alloc, NodeKind::Source);
        let b = node(&mut g, &alloc, NodeKind::Computed);
        let c = node(&mut g, &alloc, NodeKind::Computed);
        let d = node(&mut g, &alloc, NodeKind::Computed);

        g.add_edge(a, b).unwrap();
        g.add_edge(a, c).unwrap();
        g.add_edge(b, d).unwrap();
        g.add_edge(c, d).unwrap();

        assert_eq!(g.level(a), 0);
        assert_eq!(g.level(b), 1);
        assert_eq!(g.level(c), 1);
        assert_eq!(g.level(d), 2);

        let affected = g.mark_dirty(a);
        assert_eq!(affected.last().copied(), Some(d));
        assert_eq!(g.state(d), Some(NodeState::Check));
        assert_eq!(g.state(b), Some(NodeState::Dirty));
        assert_eq!(g.state(c), Some(NodeState::Dirty));
    }
}
