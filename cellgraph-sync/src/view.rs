//! Seams to the rendering surface and to user settings.
//!
//! The session never draws anything. It keeps whatever implements
//! [`LiveView`] in step with the shadow replica, and reads the one
//! preference it cares about from a [`SettingsProvider`].

use crate::ids::{EdgeId, NodeId};
use crate::model::{Edge, Node};

/// The rendered, interactive node-and-edge state owned by the UI.
pub trait LiveView: Send + Sync {
    fn get_nodes(&self) -> Vec<Node>;
    fn get_edges(&self) -> Vec<Edge>;
    fn set_nodes(&mut self, nodes: Vec<Node>);
    fn set_edges(&mut self, edges: Vec<Edge>);
    /// Remove the listed nodes and edges. Unknown ids are ignored.
    fn delete_elements(&mut self, nodes: &[NodeId], edges: &[EdgeId]);
}

/// User preferences consulted while handling structural edits.
pub trait SettingsProvider: Send + Sync {
    /// Grow a group to fit children dropped into it.
    fn auto_expand_parent_on_drop(&self) -> bool;
}

/// Fixed settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSettings {
    pub auto_expand_parent_on_drop: bool,
}

impl Default for StaticSettings {
    fn default() -> Self {
        Self {
            auto_expand_parent_on_drop: true,
        }
    }
}

impl SettingsProvider for StaticSettings {
    fn auto_expand_parent_on_drop(&self) -> bool {
        self.auto_expand_parent_on_drop
    }
}

/// In-memory live view for headless clients and tests.
///
/// Keeps insertion order the way a canvas keeps z-order.
#[derive(Debug, Clone, Default)]
pub struct MemoryView {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn text(&self, id: &NodeId) -> Option<&str> {
        self.node(id).and_then(Node::text)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

impl LiveView for MemoryView {
    fn get_nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn get_edges(&self) -> Vec<Edge> {
        self.edges.clone()
    }

    fn set_nodes(&mut self, nodes: Vec<Node>) {
        self.nodes = nodes;
    }

    fn set_edges(&mut self, edges: Vec<Edge>) {
        self.edges = edges;
    }

    fn delete_elements(&mut self, nodes: &[NodeId], edges: &[EdgeId]) {
        self.nodes.retain(|n| !nodes.contains(&n.id));
        self.edges.retain(|e| !edges.contains(&e.id));
    }
}

/// Insert `node` into the view, or replace the node with the same id.
pub(crate) fn upsert_node(view: &mut dyn LiveView, node: Node) {
    let mut nodes = view.get_nodes();
    match nodes.iter_mut().find(|n| n.id == node.id) {
        Some(slot) => *slot = node,
        None => nodes.push(node),
    }
    view.set_nodes(nodes);
}

/// Insert `edge` into the view, or replace the edge with the same id.
pub(crate) fn upsert_edge(view: &mut dyn LiveView, edge: Edge) {
    let mut edges = view.get_edges();
    match edges.iter_mut().find(|e| e.id == edge.id) {
        Some(slot) => *slot = edge,
        None => edges.push(edge),
    }
    view.set_edges(edges);
}
