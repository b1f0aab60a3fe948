//! JSON wire protocol between sessions and the relay.
//!
//! Every frame is one JSON object sent as a WebSocket text message. The
//! `msg_type` field selects the variant and every variant carries the
//! sending `client`:
//!
//! ```text
//! {"msg_type":"update","client":"6f1c…","nodeId":"c1","patch":"@@ -1,3 +1,3 @@\n x%3D\n-1\n+2\n"}
//! ```
//!
//! The relay's `init` reply is stamped with [`RELAY_CLIENT`]. The `newUser`
//! and `close` announcements it makes carry the joining or leaving client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ids::NodeId;
use crate::model::{Edge, Node, Position};
use crate::patch::Patch;
use crate::presence::ClientPresence;

/// Identity of one connected session.
pub type ClientId = Uuid;

/// Sender id the relay uses for messages it authors.
pub const RELAY_CLIENT: ClientId = Uuid::nil();

/// Top-level protocol message. A closed set: handlers match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum SyncMessage {
    /// Full-state handshake. Sent by a joining client with its current
    /// view, and by the relay in reply when the room already has state.
    #[serde(rename = "init", rename_all = "camelCase")]
    Init {
        client: ClientId,
        display_name: String,
        color_code: String,
        #[serde(default)]
        nodes: Vec<Node>,
        #[serde(default)]
        edges: Vec<Edge>,
        /// Roster of the room, filled in by the relay.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        users: Vec<ClientPresence>,
    },

    /// Text edit of one node.
    #[serde(rename = "update", rename_all = "camelCase")]
    Update {
        client: ClientId,
        node_id: NodeId,
        patch: Patch,
    },

    /// Structural add, optionally with the paired output node and edge.
    #[serde(rename = "add", rename_all = "camelCase")]
    Add {
        client: ClientId,
        node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_node: Option<Node>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge: Option<Edge>,
    },

    /// Free move or drop. `parent_id` is the node's full new parentage.
    #[serde(rename = "move", rename_all = "camelCase")]
    Move {
        client: ClientId,
        node_id: NodeId,
        position: Position,
        #[serde(default)]
        parent_id: Option<NodeId>,
    },

    #[serde(rename = "delete", rename_all = "camelCase")]
    Delete { client: ClientId, node_id: NodeId },

    #[serde(rename = "resize", rename_all = "camelCase")]
    Resize {
        client: ClientId,
        node_id: NodeId,
        height: f64,
        width: f64,
    },

    /// Group membership change for one or more children.
    #[serde(rename = "changeParentNode", rename_all = "camelCase")]
    ChangeParentNode {
        client: ClientId,
        node_id: NodeId,
        child_ids: Vec<NodeId>,
    },

    /// Kernel lineage split: a new group spliced in before its successors.
    #[serde(rename = "predecessor", rename_all = "camelCase")]
    Predecessor {
        client: ClientId,
        node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge: Option<Edge>,
    },

    /// A freshly surfaced execution result.
    #[serde(rename = "new_output", rename_all = "camelCase")]
    NewOutput {
        client: ClientId,
        output_node: Node,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge: Option<Edge>,
    },

    /// Focus moved. `None` clears the sender's focus.
    #[serde(rename = "clickedNode", rename_all = "camelCase")]
    ClickedNode {
        client: ClientId,
        #[serde(default)]
        node_id: Option<NodeId>,
        display_name: String,
    },

    #[serde(rename = "newUser", rename_all = "camelCase")]
    NewUser {
        client: ClientId,
        display_name: String,
        color_code: String,
    },

    #[serde(rename = "close", rename_all = "camelCase")]
    Close {
        client: ClientId,
        display_name: String,
        color_code: String,
    },
}

impl SyncMessage {
    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// The sending client, present in every variant.
    pub fn client(&self) -> ClientId {
        match self {
            SyncMessage::Init { client, .. }
            | SyncMessage::Update { client, .. }
            | SyncMessage::Add { client, .. }
            | SyncMessage::Move { client, .. }
            | SyncMessage::Delete { client, .. }
            | SyncMessage::Resize { client, .. }
            | SyncMessage::ChangeParentNode { client, .. }
            | SyncMessage::Predecessor { client, .. }
            | SyncMessage::NewOutput { client, .. }
            | SyncMessage::ClickedNode { client, .. }
            | SyncMessage::NewUser { client, .. }
            | SyncMessage::Close { client, .. } => *client,
        }
    }

    /// The `msg_type` discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Init { .. } => "init",
            SyncMessage::Update { .. } => "update",
            SyncMessage::Add { .. } => "add",
            SyncMessage::Move { .. } => "move",
            SyncMessage::Delete { .. } => "delete",
            SyncMessage::Resize { .. } => "resize",
            SyncMessage::ChangeParentNode { .. } => "changeParentNode",
            SyncMessage::Predecessor { .. } => "predecessor",
            SyncMessage::NewOutput { .. } => "new_output",
            SyncMessage::ClickedNode { .. } => "clickedNode",
            SyncMessage::NewUser { .. } => "newUser",
            SyncMessage::Close { .. } => "close",
        }
    }

    /// Whether this message changes the shared document.
    pub fn mutates_document(&self) -> bool {
        !matches!(
            self,
            SyncMessage::Init { .. }
                | SyncMessage::ClickedNode { .. }
                | SyncMessage::NewUser { .. }
                | SyncMessage::Close { .. }
        )
    }
}

/// Protocol and transport errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unexpected binary frame of {0} bytes")]
    BinaryFrame(usize),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeKind, OutputFragment, Size};
    use crate::patch;

    fn roundtrip(msg: &SyncMessage) -> SyncMessage {
        let text = msg.encode().unwrap();
        SyncMessage::decode(&text).unwrap()
    }

    #[test]
    fn test_update_wire_shape() {
        let client = Uuid::new_v4();
        let msg = SyncMessage::Update {
            client,
            node_id: NodeId::from("c1"),
            patch: patch::diff("x=1", "x=2"),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["msg_type"], "update");
        assert_eq!(json["client"], client.to_string());
        assert_eq!(json["nodeId"], "c1");
        assert_eq!(json["patch"], "@@ -1,3 +1,3 @@\n x%3D\n-1\n+2\n");
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_patch_text_is_preserved_exactly() {
        let text = "@@ -1,7 +1,8 @@\n prin\n-t\n+ts\n %3D1\n";
        let frame = format!(
            r#"{{"msg_type":"update","client":"{}","nodeId":"c1","patch":{}}}"#,
            Uuid::new_v4(),
            serde_json::to_string(text).unwrap()
        );
        match SyncMessage::decode(&frame).unwrap() {
            SyncMessage::Update { patch, .. } => assert_eq!(patch::serialize(&patch), text),
            other => panic!("expected update, got {}", other.kind()),
        }
    }

    #[test]
    fn test_add_with_output_roundtrip() {
        let cell = Node::code("c1", "print(1)", Position::new(10.0, 10.0)).with_parent("g1");
        let output = Node::output_for(&cell, Position::new(10.0, 80.0), vec![OutputFragment::text("1")]);
        let msg = SyncMessage::Add {
            client: Uuid::new_v4(),
            node: cell,
            output_node: Some(output),
            edge: Some(Edge::new("c1", "c1_output", EdgeKind::Structural)),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["msg_type"], "add");
        assert_eq!(json["outputNode"]["id"], "c1_output");
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_add_without_optionals() {
        let frame = format!(
            r#"{{"msg_type":"add","client":"{}","node":{{"id":"g1","type":"group","position":{{"x":0,"y":0}},"size":{{"width":400,"height":300}}}}}}"#,
            Uuid::new_v4()
        );
        match SyncMessage::decode(&frame).unwrap() {
            SyncMessage::Add { node, output_node, edge, .. } => {
                assert!(node.is_group());
                assert_eq!(node.size, Some(Size::new(400.0, 300.0)));
                assert!(output_node.is_none());
                assert!(edge.is_none());
            }
            other => panic!("expected add, got {}", other.kind()),
        }
    }

    #[test]
    fn test_move_to_top_level() {
        let frame = format!(
            r#"{{"msg_type":"move","client":"{}","nodeId":"c1","position":{{"x":1.5,"y":2}}}}"#,
            Uuid::new_v4()
        );
        match SyncMessage::decode(&frame).unwrap() {
            SyncMessage::Move { position, parent_id, .. } => {
                assert_eq!(position, Position::new(1.5, 2.0));
                assert!(parent_id.is_none());
            }
            other => panic!("expected move, got {}", other.kind()),
        }
    }

    #[test]
    fn test_discriminant_names() {
        let client = Uuid::new_v4();
        let cases = [
            (
                SyncMessage::ChangeParentNode {
                    client,
                    node_id: NodeId::from("g1"),
                    child_ids: vec![NodeId::from("c1")],
                },
                "changeParentNode",
            ),
            (
                SyncMessage::NewOutput {
                    client,
                    output_node: Node::output_for(
                        &Node::code("c1", "", Position::ORIGIN),
                        Position::ORIGIN,
                        vec![],
                    ),
                    edge: None,
                },
                "new_output",
            ),
            (
                SyncMessage::ClickedNode {
                    client,
                    node_id: Some(NodeId::from("c1")),
                    display_name: "ada".into(),
                },
                "clickedNode",
            ),
            (
                SyncMessage::NewUser {
                    client,
                    display_name: "ada".into(),
                    color_code: "#336699".into(),
                },
                "newUser",
            ),
        ];
        for (msg, name) in cases {
            let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(json["msg_type"], name);
            assert_eq!(msg.kind(), name);
            assert_eq!(msg.client(), client);
        }
    }

    #[test]
    fn test_init_roster_defaults_empty() {
        let frame = format!(
            r##"{{"msg_type":"init","client":"{}","displayName":"ada","colorCode":"#112233","nodes":[],"edges":[]}}"##,
            Uuid::new_v4()
        );
        match SyncMessage::decode(&frame).unwrap() {
            SyncMessage::Init { users, display_name, .. } => {
                assert!(users.is_empty());
                assert_eq!(display_name, "ada");
            }
            other => panic!("expected init, got {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        let frame = format!(r#"{{"msg_type":"teleport","client":"{}"}}"#, Uuid::new_v4());
        assert!(matches!(SyncMessage::decode(&frame), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_missing_client_rejected() {
        let frame = r#"{"msg_type":"delete","nodeId":"c1"}"#;
        assert!(SyncMessage::decode(frame).is_err());
    }

    #[test]
    fn test_malformed_patch_rejected() {
        let frame = format!(
            r#"{{"msg_type":"update","client":"{}","nodeId":"c1","patch":"garbage"}}"#,
            Uuid::new_v4()
        );
        assert!(SyncMessage::decode(&frame).is_err());
    }

    #[test]
    fn test_mutates_document() {
        let client = Uuid::new_v4();
        assert!(SyncMessage::Delete { client, node_id: NodeId::from("c1") }.mutates_document());
        assert!(!SyncMessage::NewUser {
            client,
            display_name: String::new(),
            color_code: String::new(),
        }
        .mutates_document());
    }
}
