//! Identifier types and the naming conventions derived from them.
//!
//! Two ids in the document are never chosen freely:
//!
//! ```text
//! output node of "c1"        → "c1_output"
//! edge from "g1" to "g2"     → "g1-g2"
//! ```
//!
//! Cascade deletes and duplicate-delivery checks depend on these being
//! computed the same way on every replica, so every call site goes through
//! this module instead of formatting strings itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix appended to a cell id to name its paired output node.
pub const OUTPUT_SUFFIX: &str = "_output";

/// Identifier of a node in the shared graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of an edge. Always produced by [`edge_id`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of the output node paired with `owner`.
pub fn output_id(owner: &NodeId) -> NodeId {
    NodeId(format!("{}{OUTPUT_SUFFIX}", owner.0))
}

/// Whether `id` names an output node.
pub fn is_output_id(id: &NodeId) -> bool {
    id.0.len() > OUTPUT_SUFFIX.len() && id.0.ends_with(OUTPUT_SUFFIX)
}

/// The cell an output node belongs to, if `id` names an output node.
pub fn output_owner(id: &NodeId) -> Option<NodeId> {
    if !is_output_id(id) {
        return None;
    }
    id.0
        .strip_suffix(OUTPUT_SUFFIX)
        .map(|owner| NodeId(owner.to_string()))
}

/// Id of the edge running from `source` to `target`.
pub fn edge_id(source: &NodeId, target: &NodeId) -> EdgeId {
    EdgeId(format!("{}-{}", source.0, target.0))
}
