#![forbid(unsafe_code)]

//! Node arena: identity, rank and dependent edges for every stream and cell.
//!
//! # Design
//!
//! Topology lives in a thread-local [`SlotMap`] keyed by [`NodeId`]. Typed
//! nodes ([`Stream`](crate::Stream), [`Cell`](crate::Cell)) own a
//! [`NodeGuard`] that releases their arena slot on drop, and register a weak
//! [`Vertex`] handle so the transaction coordinator can ask a node to
//! recompute itself by id. Parents refer to children by id only; children
//! hold their parents strongly through their typed closures, so the arena
//! never keeps anything alive.
//!
//! # Invariants
//!
//! 1. For every live edge `parent -> child`, `rank(child) > rank(parent)`.
//! 2. The edge set is acyclic: [`link`] refuses an edge that would close a
//!    cycle and reports [`Error::CyclicDependency`].
//! 3. The rank epoch increments whenever any rank changes, so queues ordered
//!    by rank know when to re-sort.
//!
//! Dead child ids (released nodes) are pruned lazily when a parent's children
//! are read.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashSet;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use crate::error::{Error, Result};

new_key_type! {
    /// Stable handle of a node in the dependency graph.
    pub struct NodeId;
}

pub(crate) type Children = SmallVec<[NodeId; 4]>;

/// Something the coordinator can recompute when its turn comes up.
pub(crate) trait Vertex {
    fn update(self: Rc<Self>);
}

struct NodeEntry {
    /// Strictly greater than the rank of every parent.
    rank: u64,
    /// Operator name, reported in cycle errors and traces.
    label: &'static str,
    /// Dependents by id; stale ids are pruned lazily.
    children: Children,
    /// Typed node to update; `None` until registered.
    vertex: Option<Weak<dyn Vertex>>,
}

#[derive(Default)]
struct Graph {
    nodes: SlotMap<NodeId, NodeEntry>,
    /// Bumped whenever any rank changes.
    rank_epoch: u64,
}

thread_local! {
    static GRAPH: RefCell<Graph> = RefCell::new(Graph::default());
}

impl Graph {
    fn rank(&self, id: NodeId) -> u64 {
        self.nodes.get(id).map_or(0, |entry| entry.rank)
    }

    /// Whether `target` is reachable from `from` along child edges.
    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut visited = FxHashSet::default();
        let mut stack: Children = SmallVec::new();
        stack.push(from);
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(entry) = self.nodes.get(id) {
                stack.extend(entry.children.iter().copied());
            }
        }
        false
    }

    /// Raise `start` and its descendants so each rank exceeds `floor`.
    fn raise(&mut self, start: NodeId, floor: u64) -> bool {
        let mut changed = false;
        let mut stack: SmallVec<[(NodeId, u64); 8]> = SmallVec::new();
        stack.push((start, floor));
        while let Some((id, floor)) = stack.pop() {
            let Some(entry) = self.nodes.get_mut(id) else {
                continue;
            };
            if entry.rank > floor {
                continue;
            }
            entry.rank = floor + 1;
            changed = true;
            let rank = entry.rank;
            stack.extend(entry.children.iter().map(|&child| (child, rank)));
        }
        if changed {
            self.rank_epoch += 1;
        }
        changed
    }

    fn add_edge(&mut self, parent: NodeId, child: NodeId) -> bool {
        let Some(entry) = self.nodes.get_mut(parent) else {
            return false;
        };
        if !entry.children.contains(&child) {
            entry.children.push(child);
        }
        let parent_rank = entry.rank;
        self.raise(child, parent_rank)
    }
}

/// Owner of an arena slot; releases it on drop.
#[derive(Debug)]
pub(crate) struct NodeGuard {
    id: NodeId,
}

impl NodeGuard {
    pub(crate) fn new(label: &'static str) -> Self {
        let id = GRAPH.with(|graph| {
            graph.borrow_mut().nodes.insert(NodeEntry {
                rank: 0,
                label,
                children: SmallVec::new(),
                vertex: None,
            })
        });
        Self { id }
    }

    #[inline]
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        // The arena may already be gone during thread teardown.
        let _ = GRAPH.try_with(|graph| {
            if let Ok(mut graph) = graph.try_borrow_mut() {
                graph.nodes.remove(self.id);
            }
        });
    }
}

pub(crate) fn set_vertex(id: NodeId, vertex: Weak<dyn Vertex>) {
    GRAPH.with(|graph| {
        if let Some(entry) = graph.borrow_mut().nodes.get_mut(id) {
            entry.vertex = Some(vertex);
        }
    });
}

pub(crate) fn vertex(id: NodeId) -> Option<Rc<dyn Vertex>> {
    GRAPH.with(|graph| {
        graph
            .borrow()
            .nodes
            .get(id)
            .and_then(|entry| entry.vertex.as_ref())
            .and_then(Weak::upgrade)
    })
}

pub(crate) fn rank(id: NodeId) -> u64 {
    GRAPH.with(|graph| graph.borrow().rank(id))
}

pub(crate) fn label(id: NodeId) -> &'static str {
    GRAPH.with(|graph| graph.borrow().nodes.get(id).map_or("released", |e| e.label))
}

pub(crate) fn rank_epoch() -> u64 {
    GRAPH.with(|graph| graph.borrow().rank_epoch)
}

/// Live children of `id`, pruning released ones.
pub(crate) fn children(id: NodeId) -> Children {
    GRAPH.with(|graph| {
        let mut graph = graph.borrow_mut();
        let Some(entry) = graph.nodes.get_mut(id) else {
            return SmallVec::new();
        };
        let mut live = std::mem::take(&mut entry.children);
        live.retain(|child| graph.nodes.contains_key(*child));
        if let Some(entry) = graph.nodes.get_mut(id) {
            entry.children.clone_from(&live);
        }
        live
    })
}

/// Add an edge from `parent` to a freshly allocated `child`.
///
/// A fresh node has no descendants, so it cannot close a cycle.
pub(crate) fn attach(parent: NodeId, child: NodeId) {
    GRAPH.with(|graph| {
        graph.borrow_mut().add_edge(parent, child);
    });
}

/// Add an edge between existing nodes, repairing ranks.
///
/// Returns whether any rank changed. Fails without touching the graph when
/// `child` already reaches `parent`.
pub(crate) fn link(parent: NodeId, child: NodeId) -> Result<bool> {
    GRAPH.with(|graph| {
        let mut graph = graph.borrow_mut();
        if graph.reaches(child, parent) {
            let node = graph.nodes.get(child).map_or("released", |e| e.label);
            return Err(Error::CyclicDependency { node });
        }
        let changed = graph.add_edge(parent, child);
        if changed {
            tracing::debug!(?parent, ?child, rank = graph.rank(child), "ranks repaired");
        }
        Ok(changed)
    })
}

pub(crate) fn unlink(parent: NodeId, child: NodeId) {
    GRAPH.with(|graph| {
        if let Some(entry) = graph.borrow_mut().nodes.get_mut(parent) {
            entry.children.retain(|c| *c != child);
        }
    });
}

/// Number of live nodes on this thread.
#[must_use]
pub fn live_nodes() -> usize {
    GRAPH.with(|graph| graph.borrow().nodes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_ranks_child_above_parent() {
        let a = NodeGuard::new("a");
        let b = NodeGuard::new("b");
        attach(a.id(), b.id());
        assert!(rank(b.id()) > rank(a.id()));
        assert_eq!(children(a.id()).as_slice(), &[b.id()]);
    }

    #[test]
    fn link_propagates_rank_to_descendants() {
        let a = NodeGuard::new("a");
        let b = NodeGuard::new("b");
        let c = NodeGuard::new("c");
        let d = NodeGuard::new("d");
        attach(b.id(), c.id());
        attach(d.id(), a.id());
        // d -> a and b -> c; adding a -> b must push b and c above a.
        let before = rank_epoch();
        assert!(link(a.id(), b.id()).expect("acyclic"));
        assert!(rank(b.id()) > rank(a.id()));
        assert!(rank(c.id()) > rank(b.id()));
        assert!(rank_epoch() > before);
    }

    #[test]
    fn link_rejects_cycles() {
        let a = NodeGuard::new("a");
        let b = NodeGuard::new("loop");
        attach(a.id(), b.id());
        let err = link(b.id(), a.id()).expect_err("cycle");
        assert_eq!(err, Error::CyclicDependency { node: "a" });
        assert!(!children(b.id()).contains(&a.id()));
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let a = NodeGuard::new("self");
        assert!(link(a.id(), a.id()).is_err());
    }

    #[test]
    fn released_children_are_pruned() {
        let a = NodeGuard::new("a");
        let b = NodeGuard::new("b");
        attach(a.id(), b.id());
        drop(b);
        assert!(children(a.id()).is_empty());
    }

    #[test]
    fn unlink_removes_edge() {
        let a = NodeGuard::new("a");
        let b = NodeGuard::new("b");
        attach(a.id(), b.id());
        unlink(a.id(), b.id());
        assert!(children(a.id()).is_empty());
        assert!(link(b.id(), a.id()).is_ok());
    }
}
