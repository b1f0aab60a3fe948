//! Execution lineage over group nodes.
//!
//! Each group is backed by its own kernel; branching or splitting a group
//! records where its kernel state came from. The resulting
//! predecessor/successor links form a forest:
//!
//! ```text
//!   g1 ──► g2 ──► g4
//!    │
//!    └───► g3
//! ```
//!
//! Both ends of every link are kept in sync: if `g2.predecessorId == g1`
//! then `g1.successorIds` contains `g2`. Links to groups that have not
//! arrived yet are left dangling and ignored by the consistency check.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::ids::NodeId;
use crate::model::ShadowDocument;

/// Make `predecessor` the predecessor of `successor`, updating both ends.
///
/// Returns `false` and leaves the document alone when `successor` is
/// missing or the link would close a cycle.
pub fn link(doc: &mut ShadowDocument, predecessor: &NodeId, successor: &NodeId) -> bool {
    if predecessor == successor || is_upstream(doc, successor, predecessor) {
        log::warn!("Refusing lineage link {predecessor} -> {successor}: it would close a cycle");
        return false;
    }
    let Some(node) = doc.nodes.get_mut(successor) else {
        return false;
    };
    let previous = node.data.predecessor_id.replace(predecessor.clone());

    if let Some(previous) = previous.filter(|p| p != predecessor) {
        if let Some(old) = doc.nodes.get_mut(&previous) {
            old.data.successor_ids.remove(successor);
        }
    }
    if let Some(pred) = doc.nodes.get_mut(predecessor) {
        pred.data.successor_ids.insert(successor.clone());
    }
    true
}

/// Whether `ancestor` lies on the predecessor chain above `id`.
pub fn is_upstream(doc: &ShadowDocument, ancestor: &NodeId, id: &NodeId) -> bool {
    let mut current = doc.nodes.get(id).and_then(|n| n.data.predecessor_id.as_ref());
    for _ in 0..doc.nodes.len() {
        match current {
            Some(p) if p == ancestor => return true,
            Some(p) => current = doc.nodes.get(p).and_then(|n| n.data.predecessor_id.as_ref()),
            None => return false,
        }
    }
    false
}

/// Whether following predecessors from any node always ends at a root.
pub fn is_acyclic(doc: &ShadowDocument) -> bool {
    doc.nodes.keys().all(|id| !is_upstream(doc, id, id))
}

/// Detach `id` from the lineage before it is removed.
///
/// Its successors become roots.
pub fn unlink(doc: &mut ShadowDocument, id: &NodeId) {
    let Some(node) = doc.nodes.get(id) else {
        return;
    };
    let predecessor = node.data.predecessor_id.clone();

    if let Some(pred) = predecessor.and_then(|p| doc.nodes.get_mut(&p)) {
        pred.data.successor_ids.remove(id);
    }
    for other in doc.nodes.values_mut() {
        if other.data.predecessor_id.as_ref() == Some(id) {
            other.data.predecessor_id = None;
        }
    }
    if let Some(node) = doc.nodes.get_mut(id) {
        node.data.successor_ids.clear();
    }
}

/// Whether every present predecessor/successor pair agrees.
pub fn is_consistent(doc: &ShadowDocument) -> bool {
    doc.nodes.values().all(|node| {
        let upward = match node.data.predecessor_id.as_ref().and_then(|p| doc.nodes.get(p)) {
            Some(pred) => pred.data.successor_ids.contains(&node.id),
            None => true,
        };
        let downward = node.data.successor_ids.iter().all(|s| match doc.nodes.get(s) {
            Some(succ) => succ.data.predecessor_id.as_ref() == Some(&node.id),
            None => true,
        });
        upward && downward
    })
}

/// Groups downstream of `group`, breadth-first, excluding `group` itself.
pub fn downstream(doc: &ShadowDocument, group: &NodeId) -> Vec<NodeId> {
    let mut seen = BTreeSet::from([group.clone()]);
    let mut order = Vec::new();
    let mut frontier = VecDeque::from([group.clone()]);

    while let Some(current) = frontier.pop_front() {
        let Some(node) = doc.nodes.get(&current) else {
            continue;
        };
        for successor in &node.data.successor_ids {
            if doc.nodes.contains_key(successor) && seen.insert(successor.clone()) {
                order.push(successor.clone());
                frontier.push_back(successor.clone());
            }
        }
    }
    order
}

/// Cells waiting to run in one group, in submission order.
#[derive(Debug, Default, Clone)]
pub struct ExecutionQueue {
    pending: VecDeque<NodeId>,
}

impl ExecutionQueue {
    /// Queue a cell. Returns `false` if it was already waiting.
    pub fn enqueue(&mut self, cell: NodeId) -> bool {
        if self.pending.contains(&cell) {
            return false;
        }
        self.pending.push_back(cell);
        true
    }

    pub fn next(&mut self) -> Option<NodeId> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Per-group run bookkeeping for the local client.
///
/// Running a group makes every downstream group stale: their kernels were
/// forked from state that has since changed.
#[derive(Debug, Default)]
pub struct ExecutionState {
    queues: HashMap<NodeId, ExecutionQueue>,
    runs: HashMap<NodeId, u64>,
    stale: BTreeSet<NodeId>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_mut(&mut self, group: &NodeId) -> &mut ExecutionQueue {
        self.queues.entry(group.clone()).or_default()
    }

    pub fn queue(&self, group: &NodeId) -> Option<&ExecutionQueue> {
        self.queues.get(group)
    }

    /// Record a run of `group` and return the groups it influenced.
    pub fn mark_run(&mut self, doc: &ShadowDocument, group: &NodeId) -> Vec<NodeId> {
        *self.runs.entry(group.clone()).or_insert(0) += 1;
        self.stale.remove(group);
        let influenced = downstream(doc, group);
        self.stale.extend(influenced.iter().cloned());
        influenced
    }

    pub fn is_stale(&self, group: &NodeId) -> bool {
        self.stale.contains(group)
    }

    pub fn run_count(&self, group: &NodeId) -> u64 {
        self.runs.get(group).copied().unwrap_or(0)
    }

    /// Drop all state for a removed group.
    pub fn forget(&mut self, group: &NodeId) {
        self.queues.remove(group);
        self.runs.remove(group);
        self.stale.remove(group);
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.runs.clear();
        self.stale.clear();
    }
}
