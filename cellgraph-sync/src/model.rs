//! Shared document model: nodes, edges, and the document holding them.
//!
//! Field names follow the JSON wire format (camelCase) so the same types
//! serve the protocol, the shadow replica, and the live view.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ids::{self, EdgeId, NodeId};

/// Kind of cell a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Code,
    Markdown,
    Group,
    Output,
    Comment,
}

impl NodeKind {
    /// Whether nodes of this kind hold editable text.
    pub fn carries_text(self) -> bool {
        matches!(self, NodeKind::Code | NodeKind::Markdown | NodeKind::Comment)
    }
}

/// 2D position. Relative to the parent when the node has one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset_by(&self, other: &Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y)
    }

    pub fn relative_to(&self, origin: &Position) -> Position {
        Position::new(self.x - origin.x, self.y - origin.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// One piece of an execution result (a stream chunk, a rich display, an error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFragment {
    pub mime_type: String,
    pub content: String,
}

/// Mime type of fragments reporting a failed execution.
pub const ERROR_MIME: &str = "application/vnd.cellgraph.error";

impl OutputFragment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            mime_type: ERROR_MIME.to_string(),
            content: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.mime_type == ERROR_MIME
    }
}

/// Per-kind payload of a node.
///
/// Code, markdown and comment nodes use `text`; groups use the lineage
/// fields; output nodes use `outputs`. Absent fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor_id: Option<NodeId>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub successor_ids: BTreeSet<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_session_ref: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputFragment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub data: NodeData,
}

impl Node {
    fn bare(id: NodeId, kind: NodeKind, position: Position) -> Self {
        Self {
            id,
            kind,
            position,
            size: None,
            parent_id: None,
            data: NodeData::default(),
        }
    }

    pub fn code(id: impl Into<NodeId>, text: impl Into<String>, position: Position) -> Self {
        let mut node = Self::bare(id.into(), NodeKind::Code, position);
        node.data.text = Some(text.into());
        node
    }

    pub fn markdown(id: impl Into<NodeId>, text: impl Into<String>, position: Position) -> Self {
        let mut node = Self::bare(id.into(), NodeKind::Markdown, position);
        node.data.text = Some(text.into());
        node
    }

    pub fn group(id: impl Into<NodeId>, position: Position, size: Size) -> Self {
        let mut node = Self::bare(id.into(), NodeKind::Group, position);
        node.size = Some(size);
        node
    }

    /// Output node paired with `owner`, placed in the owner's parent.
    pub fn output_for(owner: &Node, position: Position, outputs: Vec<OutputFragment>) -> Self {
        let mut node = Self::bare(ids::output_id(&owner.id), NodeKind::Output, position);
        node.parent_id = owner.parent_id.clone();
        node.data.outputs = outputs;
        node
    }

    pub fn with_parent(mut self, parent: impl Into<NodeId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_predecessor(mut self, predecessor: impl Into<NodeId>) -> Self {
        self.data.predecessor_id = Some(predecessor.into());
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.data.text.as_deref()
    }

    pub fn is_group(&self) -> bool {
        self.kind == NodeKind::Group
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    Structural,
    ExecutionLineage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>, kind: EdgeKind) -> Self {
        let source_id = source.into();
        let target_id = target.into();
        Self {
            id: ids::edge_id(&source_id, &target_id),
            source_id,
            target_id,
            kind,
        }
    }

    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source_id == node || &self.target_id == node
    }
}

/// A full replica of the shared graph.
///
/// Ordered maps keep iteration stable, so two converged replicas compare
/// equal and serialize identically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShadowDocument {
    pub nodes: BTreeMap<NodeId, Node>,
    pub edges: BTreeMap<EdgeId, Edge>,
}

impl ShadowDocument {
    /// Absolute position of a node, walking up its parent chain.
    ///
    /// Parents that have not arrived yet contribute nothing; cycles are cut
    /// after visiting every node once.
    pub fn absolute_position(&self, id: &NodeId) -> Option<Position> {
        let mut node = self.nodes.get(id)?;
        let mut position = node.position;
        for _ in 0..self.nodes.len() {
            let Some(parent) = node.parent_id.as_ref().and_then(|p| self.nodes.get(p)) else {
                break;
            };
            position = position.offset_by(&parent.position);
            node = parent;
        }
        Some(position)
    }

    /// Direct children of `parent`.
    pub fn children_of<'a>(&'a self, parent: &'a NodeId) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.parent_id.as_ref() == Some(parent))
    }

    pub fn nodes_vec(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn edges_vec(&self) -> Vec<Edge> {
        self.edges.values().cloned().collect()
    }
}
