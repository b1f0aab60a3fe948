//! Shadow store: the client's copy of the last converged document.
//!
//! Local text edits are diffed against the shadow, and remote patches are
//! applied onto it. Every structural operation mirrors one protocol message
//! and is idempotent, so duplicate or reordered delivery never corrupts the
//! replica. Operations naming a node that is not present are silent no-ops:
//! a remote message may race with a local delete.

use std::collections::BTreeSet;

use crate::ids::{self, NodeId};
use crate::lineage;
use crate::model::{Edge, Node, Position, ShadowDocument, Size};
use crate::patch::{self, Patch};
use crate::protocol::SyncMessage;

#[derive(Debug, Clone, Default)]
pub struct ShadowStore {
    doc: ShadowDocument,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole document. Used only at session (re)initialization.
    ///
    /// Text-bearing nodes without text get an empty string, and edges whose
    /// endpoints are missing are dropped.
    pub fn reset(&mut self, nodes: Vec<Node>, edges: Vec<Edge>) {
        let mut doc = ShadowDocument::default();
        for node in nodes {
            doc.nodes.insert(node.id.clone(), normalized(node));
        }
        for edge in edges {
            if doc.nodes.contains_key(&edge.source_id) && doc.nodes.contains_key(&edge.target_id) {
                doc.edges.insert(edge.id.clone(), edge);
            } else {
                log::debug!("Dropping dangling edge {} on reset", edge.id);
            }
        }
        self.doc = doc;
    }

    /// Discard the replica (disconnect).
    pub fn clear(&mut self) {
        self.doc = ShadowDocument::default();
    }

    pub fn document(&self) -> &ShadowDocument {
        &self.doc
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.doc.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.doc.nodes.contains_key(id)
    }

    pub fn text(&self, id: &NodeId) -> Option<&str> {
        self.doc.nodes.get(id).and_then(Node::text)
    }

    // ── text ─────────────────────────────────────────────────────

    /// Diff the shadow text of `id` against `new_text`. Does not mutate.
    pub fn generate_patch(&self, id: &NodeId, new_text: &str) -> Option<Patch> {
        let node = self.doc.nodes.get(id)?;
        if !node.kind.carries_text() {
            return None;
        }
        Some(patch::diff(node.text().unwrap_or_default(), new_text))
    }

    /// Apply a patch this client generated. Returns the new shadow text.
    pub fn apply_local_patch(&mut self, id: &NodeId, patch: &Patch) -> Option<String> {
        self.apply_patch(id, patch, "local")
    }

    /// Apply a patch received from a peer. Returns the new shadow text.
    pub fn apply_remote_patch(&mut self, id: &NodeId, patch: &Patch) -> Option<String> {
        self.apply_patch(id, patch, "remote")
    }

    fn apply_patch(&mut self, id: &NodeId, patch: &Patch, origin: &str) -> Option<String> {
        let node = self.doc.nodes.get_mut(id)?;
        if !node.kind.carries_text() {
            return None;
        }
        let text = node.data.text.get_or_insert_with(String::new);
        let applied = patch::apply(text, patch);
        if !applied.is_clean() {
            log::warn!(
                "{origin} patch for {id} did not apply cleanly: {:?}",
                applied.outcomes
            );
        }
        *text = applied.text.clone();
        Some(applied.text)
    }

    // ── structure ────────────────────────────────────────────────

    /// Insert a node. A node that already exists is left untouched, so a
    /// duplicate `add` cannot roll back later edits.
    ///
    /// The parent does not have to exist yet. A group carrying a
    /// predecessor is linked into the lineage.
    pub fn add_node(&mut self, node: Node) -> bool {
        if self.doc.nodes.contains_key(&node.id) {
            log::debug!("Node {} already present, ignoring add", node.id);
            return false;
        }
        let id = node.id.clone();
        let predecessor = node.data.predecessor_id.clone();
        self.doc.nodes.insert(id.clone(), normalized(node));
        self.settle_successors(&id);
        if let Some(predecessor) = predecessor {
            if !lineage::link(&mut self.doc, &predecessor, &id) {
                if let Some(node) = self.doc.nodes.get_mut(&id) {
                    node.data.predecessor_id = None;
                }
            }
        }
        true
    }

    /// Make a newly inserted node's successor set agree with the nodes
    /// already present: claim those that name it as predecessor, drop
    /// those that name another.
    fn settle_successors(&mut self, id: &NodeId) {
        let waiting: Vec<NodeId> = self
            .doc
            .nodes
            .values()
            .filter(|n| n.data.predecessor_id.as_ref() == Some(id))
            .map(|n| n.id.clone())
            .collect();
        let claimed: Vec<NodeId> = self
            .doc
            .nodes
            .get(id)
            .map(|n| n.data.successor_ids.iter().cloned().collect())
            .unwrap_or_default();
        let foreign: Vec<NodeId> = claimed
            .into_iter()
            .filter(|s| {
                self.doc
                    .nodes
                    .get(s)
                    .is_some_and(|succ| succ.data.predecessor_id.as_ref() != Some(id))
            })
            .collect();

        if let Some(node) = self.doc.nodes.get_mut(id) {
            node.data.successor_ids.extend(waiting);
            for s in &foreign {
                node.data.successor_ids.remove(s);
            }
        }
    }

    /// Insert an edge whose endpoints are both present.
    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if !self.doc.nodes.contains_key(&edge.source_id)
            || !self.doc.nodes.contains_key(&edge.target_id)
        {
            log::debug!("Ignoring edge {} with missing endpoint", edge.id);
            return false;
        }
        self.doc.edges.insert(edge.id.clone(), edge);
        true
    }

    /// Insert or refresh an execution output node and its edge.
    pub fn add_output(&mut self, output: Node, edge: Option<Edge>) {
        match self.doc.nodes.get_mut(&output.id) {
            Some(existing) => existing.data.outputs = output.data.outputs,
            None => {
                self.doc.nodes.insert(output.id.clone(), output);
            }
        }
        if let Some(edge) = edge {
            self.add_edge(edge);
        }
    }

    /// Set a node's position and parent (`None` means top level).
    pub fn move_node(&mut self, id: &NodeId, position: Position, parent: Option<NodeId>) {
        if let Some(node) = self.doc.nodes.get_mut(id) {
            node.position = position;
            node.parent_id = parent;
        }
    }

    pub fn resize_node(&mut self, id: &NodeId, size: Size) {
        if let Some(node) = self.doc.nodes.get_mut(id) {
            node.size = Some(size);
        }
    }

    /// Remove a node and everything hanging off it.
    ///
    /// Cascades to the paired output node, to all children of a group
    /// (recursively), and to every edge touching a removed node. Returns
    /// the removed ids; empty if `id` was already gone.
    pub fn delete_node(&mut self, id: &NodeId) -> Vec<NodeId> {
        let mut doomed = BTreeSet::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if !self.doc.nodes.contains_key(&next) || !doomed.insert(next.clone()) {
                continue;
            }
            stack.push(ids::output_id(&next));
            stack.extend(self.doc.children_of(&next).map(|child| child.id.clone()));
        }

        for removed in &doomed {
            lineage::unlink(&mut self.doc, removed);
        }
        for removed in &doomed {
            self.doc.nodes.remove(removed);
        }
        self.doc
            .edges
            .retain(|_, edge| !doomed.contains(&edge.source_id) && !doomed.contains(&edge.target_id));

        doomed.into_iter().collect()
    }

    /// Attach `children` to `parent`.
    ///
    /// Stored positions are left as they are, so the outcome does not
    /// depend on where the parent sits when the message lands. The author
    /// follows up with a `move` per child carrying its position in the new
    /// frame (see [`ShadowStore::positions_in_frame`]). Children that
    /// would end up inside themselves are skipped.
    pub fn reparent(&mut self, children: &[NodeId], parent: &NodeId) {
        for child in children {
            if !self.can_adopt(parent, child) {
                continue;
            }
            if let Some(node) = self.doc.nodes.get_mut(child) {
                node.parent_id = Some(parent.clone());
            }
        }
    }

    /// Where each of `children` has to sit inside `parent` to keep its
    /// on-screen position. Children that cannot move there are left out.
    pub fn positions_in_frame(&self, children: &[NodeId], parent: &NodeId) -> Vec<(NodeId, Position)> {
        let origin = self.doc.absolute_position(parent);
        children
            .iter()
            .filter(|child| self.can_adopt(parent, child))
            .filter_map(|child| {
                let absolute = self.doc.absolute_position(child)?;
                let position = match &origin {
                    Some(origin) => absolute.relative_to(origin),
                    None => absolute,
                };
                Some((child.clone(), position))
            })
            .collect()
    }

    fn can_adopt(&self, parent: &NodeId, child: &NodeId) -> bool {
        if child == parent || self.is_ancestor(child, parent) {
            log::warn!("Refusing to move {child} into its own subtree {parent}");
            return false;
        }
        true
    }

    /// Whether `ancestor` appears on the parent chain of `id`.
    fn is_ancestor(&self, ancestor: &NodeId, id: &NodeId) -> bool {
        let mut current = self.doc.nodes.get(id).and_then(|n| n.parent_id.as_ref());
        for _ in 0..self.doc.nodes.len() {
            match current {
                Some(p) if p == ancestor => return true,
                Some(p) => current = self.doc.nodes.get(p).and_then(|n| n.parent_id.as_ref()),
                None => return false,
            }
        }
        false
    }

    /// Point the edge `source → old_target` at `new_target` instead.
    pub fn retarget_edge(&mut self, source: &NodeId, old_target: &NodeId, new_target: &NodeId) -> bool {
        if !self.doc.nodes.contains_key(new_target) {
            return false;
        }
        let Some(edge) = self.doc.edges.remove(&ids::edge_id(source, old_target)) else {
            return false;
        };
        let replacement = Edge::new(source.clone(), new_target.clone(), edge.kind);
        self.doc.edges.insert(replacement.id.clone(), replacement);
        true
    }

    /// Splice a new group between an existing predecessor and its successors.
    ///
    /// `node` names both its predecessor (optional: a new root otherwise)
    /// and the successors it takes over. The edge from the predecessor is
    /// retargeted at `node`; `edge` connects `node` onward.
    pub fn insert_predecessor(&mut self, node: Node, edge: Option<Edge>) {
        let id = node.id.clone();
        let predecessor = node.data.predecessor_id.clone();
        let successors = node.data.successor_ids.clone();

        if !self.doc.nodes.contains_key(&id) {
            let mut fresh = normalized(node);
            fresh.data.predecessor_id = None;
            fresh.data.successor_ids.clear();
            self.doc.nodes.insert(id.clone(), fresh);
            self.settle_successors(&id);
        }

        for successor in &successors {
            if !lineage::link(&mut self.doc, &id, successor) {
                continue;
            }
            if let Some(pred) = &predecessor {
                self.retarget_edge(pred, successor, &id);
            }
        }
        if let Some(pred) = &predecessor {
            lineage::link(&mut self.doc, pred, &id);
        }
        if let Some(edge) = edge {
            self.add_edge(edge);
        }
    }

    /// Apply any protocol message to the replica.
    ///
    /// Presence messages leave the document untouched. Used by the relay,
    /// which keeps a shadow per room but has no live view.
    pub fn apply_message(&mut self, msg: &SyncMessage) {
        match msg {
            SyncMessage::Init { nodes, edges, .. } => self.reset(nodes.clone(), edges.clone()),
            SyncMessage::Update { node_id, patch, .. } => {
                self.apply_remote_patch(node_id, patch);
            }
            SyncMessage::Add { node, output_node, edge, .. } => {
                self.add_node(node.clone());
                if let Some(output) = output_node {
                    self.add_node(output.clone());
                }
                if let Some(edge) = edge {
                    self.add_edge(edge.clone());
                }
            }
            SyncMessage::Move { node_id, position, parent_id, .. } => {
                self.move_node(node_id, *position, parent_id.clone());
            }
            SyncMessage::Delete { node_id, .. } => {
                self.delete_node(node_id);
            }
            SyncMessage::Resize { node_id, height, width, .. } => {
                self.resize_node(node_id, Size::new(*width, *height));
            }
            SyncMessage::ChangeParentNode { node_id, child_ids, .. } => {
                self.reparent(child_ids, node_id);
            }
            SyncMessage::Predecessor { node, edge, .. } => {
                self.insert_predecessor(node.clone(), edge.clone());
            }
            SyncMessage::NewOutput { output_node, edge, .. } => {
                self.add_output(output_node.clone(), edge.clone());
            }
            SyncMessage::ClickedNode { .. } | SyncMessage::NewUser { .. } | SyncMessage::Close { .. } => {}
        }
    }
}

fn normalized(mut node: Node) -> Node {
    if node.kind.carries_text() && node.data.text.is_none() {
        node.data.text = Some(String::new());
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeKind, NodeKind, OutputFragment};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn group(name: &str) -> Node {
        Node::group(name, Position::ORIGIN, Size::new(400.0, 300.0))
    }

    /// A group with one code cell, its output, and the edge between them.
    fn populated() -> ShadowStore {
        let mut store = ShadowStore::new();
        let cell = Node::code("c1", "x=1", Position::new(10.0, 10.0)).with_parent("g1");
        let output = Node::output_for(&cell, Position::new(10.0, 60.0), vec![OutputFragment::text("1")]);
        let edge = Edge::new("c1", "c1_output", EdgeKind::Structural);
        store.reset(vec![group("g1"), cell, output], vec![edge]);
        store
    }

    #[test]
    fn test_reset_normalizes_missing_text() {
        let mut store = ShadowStore::new();
        let mut node = Node::code("c1", "", Position::ORIGIN);
        node.data.text = None;
        store.reset(vec![node], vec![]);
        assert_eq!(store.text(&id("c1")), Some(""));
    }

    #[test]
    fn test_reset_drops_dangling_edges() {
        let mut store = ShadowStore::new();
        store.reset(vec![group("g1")], vec![Edge::new("g1", "ghost", EdgeKind::Structural)]);
        assert!(store.document().edges.is_empty());
    }

    #[test]
    fn test_generate_patch_does_not_mutate() {
        let store = populated();
        let patch = store.generate_patch(&id("c1"), "x=2").unwrap();
        assert!(!patch.is_empty());
        assert_eq!(store.text(&id("c1")), Some("x=1"));
    }

    #[test]
    fn test_local_then_remote_patch() {
        let mut store = populated();
        let patch = store.generate_patch(&id("c1"), "x=2").unwrap();
        assert_eq!(store.apply_local_patch(&id("c1"), &patch).as_deref(), Some("x=2"));

        let mut peer = populated();
        assert_eq!(peer.apply_remote_patch(&id("c1"), &patch).as_deref(), Some("x=2"));
        assert_eq!(peer.text(&id("c1")), Some("x=2"));
    }

    #[test]
    fn test_patch_on_missing_or_textless_node() {
        let mut store = populated();
        let patch = patch::diff("a", "b");
        assert!(store.generate_patch(&id("nope"), "b").is_none());
        assert!(store.apply_remote_patch(&id("nope"), &patch).is_none());
        assert!(store.apply_remote_patch(&id("g1"), &patch).is_none());
    }

    #[test]
    fn test_duplicate_add_keeps_later_edits() {
        let mut store = populated();
        let patch = store.generate_patch(&id("c1"), "x=5").unwrap();
        store.apply_local_patch(&id("c1"), &patch);

        let stale = Node::code("c1", "x=1", Position::ORIGIN);
        assert!(!store.add_node(stale));
        assert_eq!(store.text(&id("c1")), Some("x=5"));
    }

    #[test]
    fn test_add_before_parent_records_parent() {
        let mut store = ShadowStore::new();
        store.add_node(Node::code("c2", "", Position::new(5.0, 5.0)).with_parent("g9"));
        store.add_node(group("g9"));
        let child = store.node(&id("c2")).unwrap();
        assert_eq!(child.parent_id, Some(id("g9")));
        assert_eq!(store.document().children_of(&id("g9")).count(), 1);
    }

    #[test]
    fn test_add_edge_requires_endpoints() {
        let mut store = populated();
        assert!(!store.add_edge(Edge::new("c1", "ghost", EdgeKind::Structural)));
        assert!(store.add_edge(Edge::new("g1", "c1", EdgeKind::Structural)));
    }

    #[test]
    fn test_cascade_delete_cell() {
        let mut store = populated();
        let removed = store.delete_node(&id("c1"));

        assert_eq!(removed, vec![id("c1"), id("c1_output")]);
        assert!(!store.contains(&id("c1_output")));
        assert!(store.document().edges.is_empty());
        assert!(store.contains(&id("g1")));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut store = populated();
        store.delete_node(&id("c1"));
        let once = store.document().clone();
        assert!(store.delete_node(&id("c1")).is_empty());
        assert_eq!(store.document(), &once);
    }

    #[test]
    fn test_delete_group_removes_children() {
        let mut store = populated();
        store.add_node(Node::markdown("m1", "# notes", Position::ORIGIN).with_parent("g1"));
        let removed = store.delete_node(&id("g1"));

        assert_eq!(removed.len(), 4);
        assert!(store.document().nodes.is_empty());
    }

    #[test]
    fn test_delete_group_unlinks_lineage() {
        let mut store = ShadowStore::new();
        store.add_node(group("g1"));
        store.add_node(group("g2").with_predecessor("g1"));
        store.add_node(group("g3").with_predecessor("g2"));

        store.delete_node(&id("g2"));
        assert!(store.node(&id("g1")).unwrap().data.successor_ids.is_empty());
        assert!(store.node(&id("g3")).unwrap().data.predecessor_id.is_none());
        assert!(lineage::is_consistent(store.document()));
    }

    #[test]
    fn test_successor_before_predecessor() {
        let mut store = ShadowStore::new();
        store.add_node(group("g2").with_predecessor("g1"));
        assert!(lineage::is_consistent(store.document()));

        let mut stale = group("g1");
        stale.data.successor_ids.insert(id("g9"));
        store.add_node(group("g9"));
        store.add_node(stale);

        let g1 = store.node(&id("g1")).unwrap();
        assert!(g1.data.successor_ids.contains(&id("g2")));
        assert!(!g1.data.successor_ids.contains(&id("g9")));
        assert!(lineage::is_consistent(store.document()));
    }

    #[test]
    fn test_move_and_resize() {
        let mut store = populated();
        store.move_node(&id("c1"), Position::new(1.0, 2.0), None);
        store.resize_node(&id("g1"), Size::new(800.0, 600.0));

        let cell = store.node(&id("c1")).unwrap();
        assert_eq!(cell.position, Position::new(1.0, 2.0));
        assert!(cell.parent_id.is_none());
        assert_eq!(store.node(&id("g1")).unwrap().size, Some(Size::new(800.0, 600.0)));

        // Unknown ids are ignored.
        store.move_node(&id("nope"), Position::ORIGIN, None);
        store.resize_node(&id("nope"), Size::new(1.0, 1.0));
    }

    #[test]
    fn test_reparent_keeps_stored_position() {
        let mut store = ShadowStore::new();
        store.add_node(Node::group("g1", Position::new(100.0, 100.0), Size::new(300.0, 300.0)));
        store.add_node(Node::code("c1", "", Position::new(150.0, 130.0)));

        store.reparent(&[id("c1")], &id("g1"));
        let cell = store.node(&id("c1")).unwrap();
        assert_eq!(cell.position, Position::new(150.0, 130.0));
        assert_eq!(cell.parent_id, Some(id("g1")));

        let once = store.document().clone();
        store.reparent(&[id("c1")], &id("g1"));
        assert_eq!(store.document(), &once);
    }

    #[test]
    fn test_positions_in_frame() {
        let mut store = ShadowStore::new();
        store.add_node(Node::group("g1", Position::new(100.0, 100.0), Size::new(300.0, 300.0)));
        store.add_node(Node::group("g2", Position::new(10.0, 10.0), Size::new(100.0, 100.0)).with_parent("g1"));
        store.add_node(Node::code("c1", "", Position::new(150.0, 130.0)));

        let placed = store.positions_in_frame(&[id("c1"), id("g1"), id("ghost")], &id("g2"));
        assert_eq!(placed, vec![(id("c1"), Position::new(40.0, 20.0))]);
    }

    #[test]
    fn test_reparent_commutes_with_parent_move() {
        let mut base = ShadowStore::new();
        base.add_node(Node::group("g2", Position::new(100.0, 100.0), Size::new(300.0, 300.0)));
        base.add_node(Node::code("c1", "", Position::new(150.0, 150.0)));

        let client = uuid::Uuid::new_v4();
        let mut adopt = vec![SyncMessage::ChangeParentNode {
            client,
            node_id: id("g2"),
            child_ids: vec![id("c1")],
        }];
        for (child, position) in base.positions_in_frame(&[id("c1")], &id("g2")) {
            adopt.push(SyncMessage::Move {
                client,
                node_id: child,
                position,
                parent_id: Some(id("g2")),
            });
        }
        let shift = SyncMessage::Move {
            client: uuid::Uuid::new_v4(),
            node_id: id("g2"),
            position: Position::new(300.0, 0.0),
            parent_id: None,
        };

        let mut first = base.clone();
        let mut second = base.clone();
        for msg in adopt.iter().chain([&shift]) {
            first.apply_message(msg);
        }
        for msg in [&shift].into_iter().chain(adopt.iter()) {
            second.apply_message(msg);
        }
        assert_eq!(first.document(), second.document());
        assert_eq!(first.node(&id("c1")).unwrap().position, Position::new(50.0, 50.0));
    }

    #[test]
    fn test_reparent_refuses_cycles() {
        let mut store = ShadowStore::new();
        store.add_node(group("g1"));
        store.add_node(group("g2").with_parent("g1"));

        store.reparent(&[id("g1")], &id("g2"));
        assert!(store.node(&id("g1")).unwrap().parent_id.is_none());
    }

    #[test]
    fn test_retarget_edge() {
        let mut store = ShadowStore::new();
        for name in ["g1", "g2", "g3"] {
            store.add_node(group(name));
        }
        store.add_edge(Edge::new("g1", "g2", EdgeKind::ExecutionLineage));

        assert!(store.retarget_edge(&id("g1"), &id("g2"), &id("g3")));
        let edges = store.document().edges_vec();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, id("g3"));
        assert_eq!(edges[0].kind, EdgeKind::ExecutionLineage);

        // Second delivery finds nothing to move.
        assert!(!store.retarget_edge(&id("g1"), &id("g2"), &id("g3")));
        assert_eq!(store.document().edges.len(), 1);
    }

    #[test]
    fn test_insert_predecessor_splices() {
        let mut store = ShadowStore::new();
        store.add_node(group("g1"));
        store.add_node(group("g2").with_predecessor("g1"));
        store.add_edge(Edge::new("g1", "g2", EdgeKind::ExecutionLineage));

        let mut spliced = group("gx").with_predecessor("g1");
        spliced.data.successor_ids.insert(id("g2"));
        let edge = Edge::new("gx", "g2", EdgeKind::ExecutionLineage);
        store.insert_predecessor(spliced.clone(), Some(edge.clone()));

        let doc = store.document();
        assert_eq!(doc.nodes[&id("g2")].data.predecessor_id, Some(id("gx")));
        assert_eq!(doc.nodes[&id("gx")].data.predecessor_id, Some(id("g1")));
        assert!(doc.nodes[&id("g1")].data.successor_ids.contains(&id("gx")));
        assert!(!doc.nodes[&id("g1")].data.successor_ids.contains(&id("g2")));
        assert_eq!(doc.edges.len(), 2);
        assert!(doc.edges.contains_key(&ids::edge_id(&id("g1"), &id("gx"))));
        assert!(lineage::is_consistent(doc));

        let once = doc.clone();
        store.insert_predecessor(spliced, Some(edge));
        assert_eq!(store.document(), &once);
    }

    #[test]
    fn test_insert_predecessor_before_root() {
        let mut store = ShadowStore::new();
        store.add_node(group("g1"));

        let mut root = group("g0");
        root.data.successor_ids.insert(id("g1"));
        store.insert_predecessor(root, Some(Edge::new("g0", "g1", EdgeKind::ExecutionLineage)));

        assert_eq!(store.node(&id("g1")).unwrap().data.predecessor_id, Some(id("g0")));
        assert!(store.node(&id("g0")).unwrap().data.predecessor_id.is_none());
        assert_eq!(store.document().edges.len(), 1);
        assert!(lineage::is_consistent(store.document()));
    }

    #[test]
    fn test_add_output_refreshes_results() {
        let mut store = populated();
        let cell = store.node(&id("c1")).unwrap().clone();
        let fresh = Node::output_for(&cell, Position::ORIGIN, vec![OutputFragment::text("2")]);
        store.add_output(fresh, Some(Edge::new("c1", "c1_output", EdgeKind::Structural)));

        let output = store.node(&id("c1_output")).unwrap();
        assert_eq!(output.kind, NodeKind::Output);
        assert_eq!(output.data.outputs, vec![OutputFragment::text("2")]);
        assert_eq!(output.position, Position::new(10.0, 60.0));
        assert_eq!(store.document().edges.len(), 1);
    }
}
