//! Presence: who is connected and which node each of them has focused.
//!
//! ## Flow
//!
//! ```text
//! init (relay roster) ──► PresenceRoster::rebuild()
//! newUser             ──► join
//! clickedNode         ──► focus moves (at most one node per client)
//! close               ──► client removed with its focus
//! ```
//!
//! The roster is ephemeral. It is rebuilt from the relay on every `init`
//! and cleared on disconnect.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::NodeId;
use crate::protocol::{ClientId, SyncMessage};

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable `#rrggbb` color for a client, derived from its id.
pub fn color_code(id: ClientId) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Roster
// ───────────────────────────────────────────────────────────────────

/// One connected client as the rest of the room sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPresence {
    pub client_id: ClientId,
    pub display_name: String,
    pub color_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_node_id: Option<NodeId>,
}

impl ClientPresence {
    pub fn new(client_id: ClientId, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
            color_code: color_code(client_id),
            focused_node_id: None,
        }
    }
}

/// Everyone in the room, plus a per-node index of who is looking at it.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    local: Option<ClientId>,
    clients: BTreeMap<ClientId, ClientPresence>,
    focus: BTreeMap<NodeId, BTreeSet<ClientId>>,
}

impl PresenceRoster {
    /// Roster owned by the session of `local`.
    pub fn new(local: ClientId) -> Self {
        Self {
            local: Some(local),
            ..Self::default()
        }
    }

    /// Roster kept by the relay, which has no local client.
    pub fn for_relay() -> Self {
        Self::default()
    }

    /// Update the roster from a protocol message. Returns `true` if it changed.
    pub fn handle_message(&mut self, msg: &SyncMessage) -> bool {
        match msg {
            SyncMessage::Init {
                client,
                display_name,
                color_code,
                users,
                ..
            } => {
                let mut entries = users.clone();
                if !client.is_nil() && !users.iter().any(|u| u.client_id == *client) {
                    entries.push(ClientPresence {
                        client_id: *client,
                        display_name: display_name.clone(),
                        color_code: color_code.clone(),
                        focused_node_id: None,
                    });
                }
                self.rebuild(entries);
                true
            }
            SyncMessage::NewUser {
                client,
                display_name,
                color_code,
            } => self.join(ClientPresence {
                client_id: *client,
                display_name: display_name.clone(),
                color_code: color_code.clone(),
                focused_node_id: None,
            }),
            SyncMessage::Close { client, .. } => self.leave(client),
            SyncMessage::ClickedNode {
                client,
                node_id,
                display_name,
            } => {
                if !self.clients.contains_key(client) {
                    self.join(ClientPresence::new(*client, display_name.clone()));
                }
                self.focus(client, node_id.clone())
            }
            _ => false,
        }
    }

    /// Replace the roster wholesale.
    pub fn rebuild(&mut self, entries: Vec<ClientPresence>) {
        self.clients.clear();
        self.focus.clear();
        for entry in entries {
            let id = entry.client_id;
            let focused = entry.focused_node_id.clone();
            self.clients.insert(id, ClientPresence { focused_node_id: None, ..entry });
            if focused.is_some() {
                self.focus(&id, focused);
            }
        }
    }

    /// Add a client. An existing entry keeps its focus.
    pub fn join(&mut self, presence: ClientPresence) -> bool {
        match self.clients.get_mut(&presence.client_id) {
            Some(existing) => {
                let changed = existing.display_name != presence.display_name
                    || existing.color_code != presence.color_code;
                existing.display_name = presence.display_name;
                existing.color_code = presence.color_code;
                changed
            }
            None => {
                self.clients.insert(presence.client_id, presence);
                true
            }
        }
    }

    /// Remove a client and its focus.
    pub fn leave(&mut self, client: &ClientId) -> bool {
        self.clear_focus(client);
        self.clients.remove(client).is_some()
    }

    /// Move `client`'s focus to `node`, or clear it with `None`.
    pub fn focus(&mut self, client: &ClientId, node: Option<NodeId>) -> bool {
        let Some(entry) = self.clients.get(client) else {
            return false;
        };
        if entry.focused_node_id == node {
            return false;
        }
        self.clear_focus(client);
        if let Some(node) = node {
            self.focus.entry(node.clone()).or_default().insert(*client);
            if let Some(entry) = self.clients.get_mut(client) {
                entry.focused_node_id = Some(node);
            }
        }
        true
    }

    fn clear_focus(&mut self, client: &ClientId) {
        self.focus.retain(|_, holders| {
            holders.remove(client);
            !holders.is_empty()
        });
        if let Some(entry) = self.clients.get_mut(client) {
            entry.focused_node_id = None;
        }
    }

    /// Drop focus slots for a node that was deleted.
    pub fn forget_node(&mut self, node: &NodeId) {
        if let Some(holders) = self.focus.remove(node) {
            for client in holders {
                if let Some(entry) = self.clients.get_mut(&client) {
                    entry.focused_node_id = None;
                }
            }
        }
    }

    pub fn get(&self, client: &ClientId) -> Option<&ClientPresence> {
        self.clients.get(client)
    }

    /// Clients focused on `node`.
    pub fn focused_on(&self, node: &NodeId) -> Vec<&ClientPresence> {
        self.focus
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.clients.get(id))
            .collect()
    }

    /// All clients except the local one.
    pub fn remote(&self) -> impl Iterator<Item = &ClientPresence> {
        let local = self.local;
        self.clients
            .values()
            .filter(move |p| Some(p.client_id) != local)
    }

    pub fn snapshot(&self) -> Vec<ClientPresence> {
        self.clients.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
        self.focus.clear();
    }

    pub fn local(&self) -> Option<ClientId> {
        self.local
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(client: ClientId, name: &str) -> SyncMessage {
        SyncMessage::NewUser {
            client,
            display_name: name.into(),
            color_code: color_code(client),
        }
    }

    fn click(client: ClientId, node: Option<&str>) -> SyncMessage {
        SyncMessage::ClickedNode {
            client,
            node_id: node.map(NodeId::from),
            display_name: "someone".into(),
        }
    }

    #[test]
    fn test_color_code_is_stable_hex() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = color_code(id);
        assert_eq!(a, color_code(id));
        assert_eq!(a.len(), 7);
        assert!(a.starts_with('#'));
        assert!(a[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hsl_gray() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_join_and_leave() {
        let local = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::new(local);

        assert!(roster.handle_message(&new_user(peer, "grace")));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get(&peer).unwrap().display_name, "grace");

        assert!(roster.handle_message(&SyncMessage::Close {
            client: peer,
            display_name: "grace".into(),
            color_code: color_code(peer),
        }));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_focus_is_exclusive() {
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        roster.handle_message(&new_user(peer, "grace"));

        roster.handle_message(&click(peer, Some("c1")));
        roster.handle_message(&click(peer, Some("c2")));

        assert!(roster.focused_on(&NodeId::from("c1")).is_empty());
        assert_eq!(roster.focused_on(&NodeId::from("c2")).len(), 1);
        assert_eq!(roster.get(&peer).unwrap().focused_node_id, Some(NodeId::from("c2")));
    }

    #[test]
    fn test_shared_focus_slot() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut roster = PresenceRoster::for_relay();
        roster.handle_message(&new_user(a, "a"));
        roster.handle_message(&new_user(b, "b"));
        roster.handle_message(&click(a, Some("c1")));
        roster.handle_message(&click(b, Some("c1")));

        assert_eq!(roster.focused_on(&NodeId::from("c1")).len(), 2);
        roster.handle_message(&click(a, None));
        assert_eq!(roster.focused_on(&NodeId::from("c1")).len(), 1);
    }

    #[test]
    fn test_close_removes_focus() {
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        roster.handle_message(&new_user(peer, "grace"));
        roster.handle_message(&click(peer, Some("c1")));
        roster.leave(&peer);

        assert!(roster.focused_on(&NodeId::from("c1")).is_empty());
        assert!(roster.get(&peer).is_none());
    }

    #[test]
    fn test_click_from_unknown_client_joins() {
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        assert!(roster.handle_message(&click(peer, Some("c1"))));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_init_rebuilds_roster() {
        let local = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::new(local);
        roster.handle_message(&new_user(stale, "old"));

        let mut focused = ClientPresence::new(peer, "grace");
        focused.focused_node_id = Some(NodeId::from("g1"));
        roster.handle_message(&SyncMessage::Init {
            client: crate::protocol::RELAY_CLIENT,
            display_name: String::new(),
            color_code: String::new(),
            nodes: vec![],
            edges: vec![],
            users: vec![ClientPresence::new(local, "me"), focused],
        });

        assert!(roster.get(&stale).is_none());
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.remote().count(), 1);
        assert_eq!(roster.focused_on(&NodeId::from("g1")).len(), 1);
    }

    #[test]
    fn test_forget_node_clears_slot() {
        let peer = Uuid::new_v4();
        let mut roster = PresenceRoster::for_relay();
        roster.handle_message(&new_user(peer, "grace"));
        roster.handle_message(&click(peer, Some("c1")));
        roster.forget_node(&NodeId::from("c1"));

        assert!(roster.focused_on(&NodeId::from("c1")).is_empty());
        assert!(roster.get(&peer).unwrap().focused_node_id.is_none());
    }
}
