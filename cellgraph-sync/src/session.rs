//! Sync session: one client's connection to a shared cell graph.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──relay init──► Synchronized
//!       ▲                                                    │
//!       └──────────── disconnect() / socket lost ────────────┘
//! ```
//!
//! On connect the session sends an `init` carrying its whole live view and
//! adopts the relay's `init` reply wholesale. Reconnecting is always a
//! fresh `init`; nothing survives a disconnect except the live view.
//!
//! Every local operation updates the live view and the shadow, then emits
//! one message. Two operations emit follow-ups: `move_node` may add a
//! `resize` of the parent, and `change_parent` sends a `move` per child
//! plus that `resize`. Remote messages drive the same shadow operations and the
//! equivalent live-view change. Handling is sequential: the session is
//! `&mut self` throughout, so a diff and its local apply can never
//! interleave with another edit of the same node.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{BackendError, BackendRegistry, BackendState, ExecutionTransport};
use crate::client::{ConnectionState, LinkEvent, RelayLink};
use crate::ids::{self, NodeId};
use crate::lineage::ExecutionState;
use crate::model::{Edge, EdgeKind, Node, NodeKind, OutputFragment, Position, Size};
use crate::patch;
use crate::presence::{self, PresenceRoster};
use crate::protocol::{ClientId, ProtocolError, SyncMessage};
use crate::shadow::ShadowStore;
use crate::view::{self, LiveView, SettingsProvider};

/// Space kept between a group's border and its children when it grows.
const EXPAND_PADDING: f64 = 20.0;
/// Footprint assumed for nodes that carry no explicit size.
const DEFAULT_NODE_SIZE: Size = Size {
    width: 300.0,
    height: 80.0,
};
/// Vertical gap between a cell and its output node.
const OUTPUT_GAP: f64 = 20.0;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay room URL, e.g. `ws://127.0.0.1:9090/notebook-42`
    pub relay_url: String,
    pub display_name: String,
    /// Notebook path handed to the execution transport
    pub notebook_path: String,
    pub credentials: Option<String>,
    /// How long structural operations wait for a group's backend
    pub backend_ready_timeout: Duration,
    /// How long `connect` waits for the relay's `init`
    pub handshake_timeout: Duration,
    /// Capacity of the event and link channels
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090/default".to_string(),
            display_name: "anonymous".to_string(),
            notebook_path: "untitled.ipynb".to_string(),
            credentials: None,
            backend_ready_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Synchronized,
    Disconnected,
    RosterChanged,
    BackendReady(NodeId),
    BackendUnavailable { group: NodeId, reason: String },
    /// A remote edit changed a node's text.
    TextChanged { node_id: NodeId, text: String, clean: bool },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("relay did not complete the handshake")]
    Handshake,
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Queue `event` for the embedder without blocking. A full or closed
/// channel drops it.
fn send_event(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = tx.try_send(event) {
        log::debug!("Session event dropped: {e}");
    }
}

/// One client's view of the shared graph.
pub struct SyncSession<V: LiveView> {
    config: SessionConfig,
    client_id: ClientId,
    state: ConnectionState,
    shadow: ShadowStore,
    roster: PresenceRoster,
    execution: ExecutionState,
    backends: Arc<BackendRegistry>,
    transport: Arc<dyn ExecutionTransport>,
    settings: Arc<dyn SettingsProvider>,
    view: V,
    link: Option<RelayLink>,
    inbound: Option<mpsc::Receiver<LinkEvent>>,
    acquisitions: Vec<JoinHandle<()>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl<V: LiveView> SyncSession<V> {
    pub fn new(
        config: SessionConfig,
        view: V,
        transport: Arc<dyn ExecutionTransport>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        let client_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            config,
            client_id,
            state: ConnectionState::Disconnected,
            shadow: ShadowStore::new(),
            roster: PresenceRoster::new(client_id),
            execution: ExecutionState::new(),
            backends: Arc::new(BackendRegistry::new()),
            transport,
            settings,
            view,
            link: None,
            inbound: None,
            acquisitions: Vec::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn shadow(&self) -> &ShadowStore {
        &self.shadow
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    /// Mutable access for UI-side edits that have not been pushed yet.
    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn execution(&self) -> &ExecutionState {
        &self.execution
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether `group` has a ready backend.
    pub async fn is_executable(&self, group: &NodeId) -> bool {
        matches!(self.backends.state(group).await, Some(BackendState::Ready(_)))
    }

    fn emit(&self, event: SessionEvent) {
        send_event(&self.event_tx, event);
    }

    // ── connection ───────────────────────────────────────────────

    /// Connect to the relay and complete the `init` handshake.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Disconnected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        let (link, mut inbound) = match RelayLink::connect(
            &self.config.relay_url,
            self.client_id,
            self.config.event_capacity,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        let init = SyncMessage::Init {
            client: self.client_id,
            display_name: self.config.display_name.clone(),
            color_code: presence::color_code(self.client_id),
            nodes: self.view.get_nodes(),
            edges: self.view.get_edges(),
            users: Vec::new(),
        };
        if let Err(e) = link.send(&init).await {
            link.close().await;
            self.state = ConnectionState::Disconnected;
            return Err(e.into());
        }

        let reply = tokio::time::timeout(self.config.handshake_timeout, async {
            while let Some(event) = inbound.recv().await {
                match event {
                    LinkEvent::Message(msg @ SyncMessage::Init { .. }) => return Some(msg),
                    LinkEvent::Message(other) => {
                        log::debug!("Ignoring {} received before init", other.kind());
                    }
                    LinkEvent::Closed => return None,
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let Some(reply) = reply else {
            log::error!("Relay at {} did not answer init", self.config.relay_url);
            link.close().await;
            self.state = ConnectionState::Disconnected;
            return Err(SessionError::Handshake);
        };

        self.link = Some(link);
        self.inbound = Some(inbound);
        self.apply_init(reply);
        self.state = ConnectionState::Synchronized;
        log::info!(
            "Session {} synchronized with {} nodes",
            self.client_id,
            self.shadow.document().nodes.len()
        );
        self.emit(SessionEvent::Synchronized);
        Ok(())
    }

    /// Leave the room and drop all replicated state.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            let close = SyncMessage::Close {
                client: self.client_id,
                display_name: self.config.display_name.clone(),
                color_code: presence::color_code(self.client_id),
            };
            if let Err(e) = link.send(&close).await {
                log::debug!("Could not announce close: {e}");
            }
            link.close().await;
        }
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        let was_connected = self.state != ConnectionState::Disconnected;
        self.link = None;
        self.inbound = None;
        for task in self.acquisitions.drain(..) {
            task.abort();
        }
        self.shadow.clear();
        self.roster.clear();
        self.execution.clear();
        self.backends.clear().await;
        self.state = ConnectionState::Disconnected;
        if was_connected {
            log::info!("Session {} disconnected", self.client_id);
            self.emit(SessionEvent::Disconnected);
        }
    }

    fn link(&self) -> Result<&RelayLink, SessionError> {
        match (&self.link, self.state) {
            (Some(link), ConnectionState::Synchronized) => Ok(link),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Send `msg` to the relay. A link that is no longer open means the
    /// socket is gone, so the session tears down before reporting it.
    async fn send(&mut self, msg: SyncMessage) -> Result<(), SessionError> {
        let link = self.link()?;
        let sent = if link.is_open() {
            link.send(&msg).await
        } else {
            Err(ProtocolError::ConnectionClosed)
        };
        match sent {
            Ok(()) => Ok(()),
            Err(e @ (ProtocolError::ConnectionClosed | ProtocolError::WebSocket(_))) => {
                log::warn!("Lost relay while sending {}: {e}", msg.kind());
                self.teardown().await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── inbound ──────────────────────────────────────────────────

    /// Wait for and handle the next relay message.
    ///
    /// Returns `false` once the connection is gone.
    pub async fn process_next(&mut self) -> Result<bool, SessionError> {
        let inbound = self.inbound.as_mut().ok_or(SessionError::NotConnected)?;
        match inbound.recv().await {
            Some(LinkEvent::Message(msg)) => {
                self.apply_remote(msg).await;
                Ok(true)
            }
            Some(LinkEvent::Closed) | None => {
                self.teardown().await;
                Ok(false)
            }
        }
    }

    /// Handle every message already received, without waiting.
    pub async fn process_available(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(inbound) = self.inbound.as_mut() else {
                break;
            };
            match inbound.try_recv() {
                Ok(LinkEvent::Message(msg)) => {
                    self.apply_remote(msg).await;
                    handled += 1;
                }
                Ok(LinkEvent::Closed) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.teardown().await;
                    break;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }
        handled
    }

    /// Handle relay messages until the connection closes.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while self.process_next().await? {}
        Ok(())
    }

    /// Apply one message from a peer to the shadow and the live view.
    pub async fn apply_remote(&mut self, msg: SyncMessage) {
        log::debug!("← {} from {}", msg.kind(), msg.client());
        match msg {
            SyncMessage::Init { .. } => self.apply_init(msg),
            SyncMessage::Update { node_id, patch, .. } => {
                let Some(text) = self.shadow.apply_remote_patch(&node_id, &patch) else {
                    log::debug!("Update for unknown node {node_id}");
                    return;
                };
                let view_text = self.view_text(&node_id).unwrap_or_default();
                let applied = patch::apply(&view_text, &patch);
                let clean = applied.is_clean();
                self.set_view_text(&node_id, applied.text);
                self.emit(SessionEvent::TextChanged { node_id, text, clean });
            }
            SyncMessage::Add { node, output_node, edge, .. } => {
                self.apply_add(node, output_node, edge);
            }
            SyncMessage::Move { node_id, position, parent_id, .. } => {
                self.shadow.move_node(&node_id, position, parent_id);
                self.refresh_view_node(&node_id);
            }
            SyncMessage::Delete { node_id, .. } => self.apply_delete(&node_id).await,
            SyncMessage::Resize { node_id, height, width, .. } => {
                self.shadow.resize_node(&node_id, Size::new(width, height));
                self.refresh_view_node(&node_id);
            }
            SyncMessage::ChangeParentNode { node_id, child_ids, .. } => {
                self.apply_reparent(&node_id, &child_ids);
            }
            SyncMessage::Predecessor { node, edge, .. } => self.apply_predecessor(node, edge),
            SyncMessage::NewOutput { output_node, edge, .. } => {
                self.apply_output(output_node, edge);
            }
            SyncMessage::ClickedNode { .. } | SyncMessage::NewUser { .. } | SyncMessage::Close { .. } => {
                if self.roster.handle_message(&msg) {
                    self.emit(SessionEvent::RosterChanged);
                }
            }
        }
    }

    fn apply_init(&mut self, msg: SyncMessage) {
        let SyncMessage::Init { nodes, edges, users, .. } = msg else {
            return;
        };
        self.shadow.reset(nodes, edges);
        self.view.set_nodes(self.shadow.document().nodes_vec());
        self.view.set_edges(self.shadow.document().edges_vec());

        self.roster.rebuild(users);
        self.emit(SessionEvent::RosterChanged);

        self.execution.clear();
        let groups: Vec<NodeId> = self
            .shadow
            .document()
            .nodes
            .values()
            .filter(|n| n.is_group())
            .map(|n| n.id.clone())
            .collect();
        for group in groups {
            self.start_acquisition(group);
        }
    }

    // ── shared apply paths ───────────────────────────────────────

    fn apply_add(&mut self, node: Node, output: Option<Node>, edge: Option<Edge>) {
        let id = node.id.clone();
        let is_group = node.is_group();
        if self.shadow.add_node(node) {
            self.refresh_view_node(&id);
            if let Some(predecessor) = self.shadow.node(&id).and_then(|n| n.data.predecessor_id.clone()) {
                self.refresh_view_node(&predecessor);
            }
            if is_group {
                self.start_acquisition(id.clone());
            }
        }
        if let Some(output) = output {
            let output_id = output.id.clone();
            if self.shadow.add_node(output) {
                self.refresh_view_node(&output_id);
            }
        }
        if let Some(edge) = edge {
            let touched = [edge.source_id.clone(), edge.target_id.clone()];
            if self.shadow.add_edge(edge) {
                self.refresh_view_edges(&touched);
            }
        }
    }

    async fn apply_delete(&mut self, id: &NodeId) {
        let neighbours: Vec<NodeId> = self
            .shadow
            .node(id)
            .map(|n| {
                n.data
                    .successor_ids
                    .iter()
                    .cloned()
                    .chain(n.data.predecessor_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let removed = self.shadow.delete_node(id);
        if removed.is_empty() {
            return;
        }

        let stale_edges: Vec<_> = self
            .view
            .get_edges()
            .into_iter()
            .filter(|e| removed.iter().any(|r| e.touches(r)))
            .map(|e| e.id)
            .collect();
        self.view.delete_elements(&removed, &stale_edges);
        for other in &neighbours {
            self.refresh_view_node(other);
        }

        for node in &removed {
            self.roster.forget_node(node);
            self.execution.forget(node);
            self.backends.remove(node).await;
        }
    }

    fn apply_reparent(&mut self, parent: &NodeId, children: &[NodeId]) {
        self.shadow.reparent(children, parent);
        for child in children {
            self.refresh_view_node(child);
        }
    }

    fn apply_predecessor(&mut self, node: Node, edge: Option<Edge>) {
        let id = node.id.clone();
        let is_new = !self.shadow.contains(&id);
        let mut touched: Vec<NodeId> = node.data.successor_ids.iter().cloned().collect();
        touched.extend(node.data.predecessor_id.clone());
        touched.push(id.clone());

        self.shadow.insert_predecessor(node, edge);
        for other in &touched {
            self.refresh_view_node(other);
        }
        self.refresh_view_edges(&touched);
        if is_new && self.shadow.node(&id).is_some_and(Node::is_group) {
            self.start_acquisition(id);
        }
    }

    fn apply_output(&mut self, output: Node, edge: Option<Edge>) {
        let id = output.id.clone();
        let mut touched = vec![id.clone()];
        touched.extend(edge.as_ref().map(|e| e.source_id.clone()));
        self.shadow.add_output(output, edge);
        self.refresh_view_node(&id);
        self.refresh_view_edges(&touched);
    }

    // ── live-view mirroring ──────────────────────────────────────

    fn view_text(&self, id: &NodeId) -> Option<String> {
        self.view
            .get_nodes()
            .into_iter()
            .find(|n| &n.id == id)
            .and_then(|n| n.data.text)
    }

    fn set_view_text(&mut self, id: &NodeId, text: String) {
        let mut nodes = self.view.get_nodes();
        match nodes.iter_mut().find(|n| &n.id == id) {
            Some(node) => node.data.text = Some(text),
            None => {
                if let Some(shadow) = self.shadow.node(id) {
                    nodes.push(shadow.clone());
                }
            }
        }
        self.view.set_nodes(nodes);
    }

    /// Copy the shadow's version of `id` into the live view.
    ///
    /// The view keeps its own text: it is reconciled through patches only.
    fn refresh_view_node(&mut self, id: &NodeId) {
        let Some(mut node) = self.shadow.node(id).cloned() else {
            return;
        };
        if let Some(text) = self.view_text(id) {
            node.data.text = Some(text);
        }
        view::upsert_node(&mut self.view, node);
    }

    /// Make the view's edges at `nodes` match the shadow's.
    fn refresh_view_edges(&mut self, nodes: &[NodeId]) {
        let doc = self.shadow.document();
        let touches = |e: &Edge| nodes.iter().any(|n| e.touches(n));

        let stale: Vec<_> = self
            .view
            .get_edges()
            .into_iter()
            .filter(|e| touches(e) && !doc.edges.contains_key(&e.id))
            .map(|e| e.id)
            .collect();
        if !stale.is_empty() {
            self.view.delete_elements(&[], &stale);
        }
        let current: Vec<Edge> = doc.edges.values().filter(|e| touches(*e)).cloned().collect();
        for edge in current {
            view::upsert_edge(&mut self.view, edge);
        }
    }

    // ── backends ─────────────────────────────────────────────────

    /// Start creating `group`'s kernel session in the background.
    fn start_acquisition(&mut self, group: NodeId) {
        let registry = self.backends.clone();
        let transport = self.transport.clone();
        let events = self.event_tx.clone();
        let path = self.config.notebook_path.clone();
        let credentials = self.config.credentials.clone();

        self.acquisitions.retain(|task| !task.is_finished());
        self.acquisitions.push(tokio::spawn(async move {
            let Some(claim) = registry.register(&group).await else {
                return;
            };
            match transport.create_session(&group, &path, credentials.as_deref()).await {
                Ok(handle) => {
                    registry.set_ready(claim, handle).await;
                    log::info!("Backend ready for group {group}");
                    send_event(&events, SessionEvent::BackendReady(group));
                }
                Err(e) => {
                    let reason = e.to_string();
                    log::warn!("Backend unavailable for group {group}: {reason}");
                    registry.set_unavailable(claim, &group, reason.clone()).await;
                    send_event(&events, SessionEvent::BackendUnavailable { group, reason });
                }
            }
        }));
    }

    /// Wait for the backend of `parent` if it is a group.
    async fn settle_parent_backend(&self, parent: Option<&NodeId>) {
        let Some(parent) = parent else {
            return;
        };
        if !self.shadow.node(parent).is_some_and(Node::is_group) {
            return;
        }
        if let Err(e) = self
            .backends
            .wait_ready(parent, self.config.backend_ready_timeout)
            .await
        {
            log::warn!("Attaching to {parent} without a backend: {e}");
        }
    }

    // ── outbound ─────────────────────────────────────────────────

    /// Local text edit of `id`.
    pub async fn edit_text(&mut self, id: &NodeId, new_text: &str) -> Result<(), SessionError> {
        self.link()?;
        let patch = self
            .shadow
            .generate_patch(id, new_text)
            .ok_or_else(|| SessionError::UnknownNode(id.clone()))?;
        if patch.is_empty() {
            return Ok(());
        }
        self.shadow.apply_local_patch(id, &patch);
        self.set_view_text(id, new_text.to_string());
        self.send(SyncMessage::Update {
            client: self.client_id,
            node_id: id.clone(),
            patch,
        })
        .await
    }

    /// Add a node, optionally with its output node and an edge.
    ///
    /// Adding into a group waits for that group's backend first.
    pub async fn add_node(
        &mut self,
        node: Node,
        output: Option<Node>,
        edge: Option<Edge>,
    ) -> Result<(), SessionError> {
        self.link()?;
        self.settle_parent_backend(node.parent_id.as_ref()).await;
        self.apply_add(node.clone(), output.clone(), edge.clone());
        self.send(SyncMessage::Add {
            client: self.client_id,
            node,
            output_node: output,
            edge,
        })
        .await
    }

    /// Move a node. `parent` is its complete new parentage.
    ///
    /// Emits one `move`, followed by a `resize` of `parent` when
    /// auto-expand is on and the node no longer fits.
    pub async fn move_node(
        &mut self,
        id: &NodeId,
        position: Position,
        parent: Option<NodeId>,
    ) -> Result<(), SessionError> {
        self.link()?;
        if !self.shadow.contains(id) {
            return Err(SessionError::UnknownNode(id.clone()));
        }
        self.settle_parent_backend(parent.as_ref()).await;
        self.shadow.move_node(id, position, parent.clone());
        self.refresh_view_node(id);
        self.send(SyncMessage::Move {
            client: self.client_id,
            node_id: id.clone(),
            position,
            parent_id: parent.clone(),
        })
        .await?;
        if let Some(parent) = parent {
            self.expand_to_fit(&parent).await?;
        }
        Ok(())
    }

    pub async fn delete_node(&mut self, id: &NodeId) -> Result<(), SessionError> {
        self.link()?;
        self.apply_delete(id).await;
        self.send(SyncMessage::Delete {
            client: self.client_id,
            node_id: id.clone(),
        })
        .await
    }

    pub async fn resize_node(&mut self, id: &NodeId, size: Size) -> Result<(), SessionError> {
        self.link()?;
        if !self.shadow.contains(id) {
            return Err(SessionError::UnknownNode(id.clone()));
        }
        self.shadow.resize_node(id, size);
        self.refresh_view_node(id);
        self.send(SyncMessage::Resize {
            client: self.client_id,
            node_id: id.clone(),
            height: size.height,
            width: size.width,
        })
        .await
    }

    /// Move `children` into the group `parent`, keeping them in place on
    /// screen.
    ///
    /// Emits `changeParentNode`, then one `move` per adopted child with its
    /// position in the parent's frame, then a `resize` if the parent has
    /// to grow. Each of these assigns fields outright, so peers converge
    /// whatever else they apply in between.
    pub async fn change_parent(&mut self, parent: &NodeId, children: &[NodeId]) -> Result<(), SessionError> {
        self.link()?;
        if !self.shadow.contains(parent) {
            return Err(SessionError::UnknownNode(parent.clone()));
        }
        self.settle_parent_backend(Some(parent)).await;
        let placed = self.shadow.positions_in_frame(children, parent);
        self.apply_reparent(parent, children);
        for (child, position) in &placed {
            self.shadow.move_node(child, *position, Some(parent.clone()));
            self.refresh_view_node(child);
        }

        self.send(SyncMessage::ChangeParentNode {
            client: self.client_id,
            node_id: parent.clone(),
            child_ids: children.to_vec(),
        })
        .await?;
        for (child, position) in placed {
            self.send(SyncMessage::Move {
                client: self.client_id,
                node_id: child,
                position,
                parent_id: Some(parent.clone()),
            })
            .await?;
        }
        self.expand_to_fit(parent).await
    }

    /// Grow `parent` to contain its children, if the setting asks for it.
    async fn expand_to_fit(&mut self, parent: &NodeId) -> Result<(), SessionError> {
        if !self.settings.auto_expand_parent_on_drop() {
            return Ok(());
        }
        let Some(size) = self.required_size(parent) else {
            return Ok(());
        };
        log::debug!("Expanding {parent} to {}x{}", size.width, size.height);
        self.resize_node(parent, size).await
    }

    /// Size `parent` needs to contain its children, if it is too small.
    fn required_size(&self, parent: &NodeId) -> Option<Size> {
        let doc = self.shadow.document();
        let current = doc.nodes.get(parent)?.size?;
        let (mut width, mut height) = (current.width, current.height);
        for child in doc.children_of(parent) {
            let footprint = child.size.unwrap_or(DEFAULT_NODE_SIZE);
            width = width.max(child.position.x + footprint.width + EXPAND_PADDING);
            height = height.max(child.position.y + footprint.height + EXPAND_PADDING);
        }
        (width > current.width || height > current.height).then(|| Size::new(width, height))
    }

    /// Splice a new group into the lineage.
    pub async fn insert_predecessor(&mut self, node: Node, edge: Option<Edge>) -> Result<(), SessionError> {
        self.link()?;
        self.apply_predecessor(node.clone(), edge.clone());
        self.send(SyncMessage::Predecessor {
            client: self.client_id,
            node,
            edge,
        })
        .await
    }

    /// Publish an execution result for `cell`.
    pub async fn surface_output(
        &mut self,
        cell: &NodeId,
        outputs: Vec<OutputFragment>,
    ) -> Result<(), SessionError> {
        self.link()?;
        let owner = self
            .shadow
            .node(cell)
            .cloned()
            .ok_or_else(|| SessionError::UnknownNode(cell.clone()))?;

        let output_id = ids::output_id(cell);
        let position = match self.shadow.node(&output_id) {
            Some(existing) => existing.position,
            None => {
                let height = owner.size.unwrap_or(DEFAULT_NODE_SIZE).height;
                Position::new(owner.position.x, owner.position.y + height + OUTPUT_GAP)
            }
        };
        let output = Node::output_for(&owner, position, outputs);
        let edge = Edge::new(cell.clone(), output_id, EdgeKind::Structural);

        self.apply_output(output.clone(), Some(edge.clone()));
        self.send(SyncMessage::NewOutput {
            client: self.client_id,
            output_node: output,
            edge: Some(edge),
        })
        .await
    }

    /// Focus `node` (or nothing) for the rest of the room.
    pub async fn click_node(&mut self, node: Option<NodeId>) -> Result<(), SessionError> {
        self.link()?;
        let msg = SyncMessage::ClickedNode {
            client: self.client_id,
            node_id: node,
            display_name: self.config.display_name.clone(),
        };
        if self.roster.handle_message(&msg) {
            self.emit(SessionEvent::RosterChanged);
        }
        self.send(msg).await
    }

    // ── execution ────────────────────────────────────────────────

    /// Run every code cell of `group`, then of each group it influences.
    ///
    /// Cells run top to bottom. Each result is surfaced as `new_output`.
    /// Returns the influenced groups.
    pub async fn run_group(&mut self, group: &NodeId) -> Result<Vec<NodeId>, SessionError> {
        self.link()?;
        if !self.shadow.node(group).is_some_and(Node::is_group) {
            return Err(SessionError::UnknownNode(group.clone()));
        }
        let influenced = self.execution.mark_run(self.shadow.document(), group);

        self.run_cells(group).await?;
        for downstream in &influenced {
            if let Err(e) = self.run_cells(downstream).await {
                log::warn!("Skipping downstream group {downstream}: {e}");
            }
        }
        Ok(influenced)
    }

    async fn run_cells(&mut self, group: &NodeId) -> Result<(), SessionError> {
        let handle = self
            .backends
            .wait_ready(group, self.config.backend_ready_timeout)
            .await?;

        let mut cells: Vec<&Node> = self
            .shadow
            .document()
            .children_of(group)
            .filter(|n| n.kind == NodeKind::Code)
            .collect();
        cells.sort_by(|a, b| {
            a.position
                .y
                .total_cmp(&b.position.y)
                .then(a.position.x.total_cmp(&b.position.x))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ordered: Vec<NodeId> = cells.into_iter().map(|n| n.id.clone()).collect();

        let queue = self.execution.queue_mut(group);
        for cell in ordered {
            queue.enqueue(cell);
        }

        while let Some(cell) = self.execution.queue_mut(group).next() {
            let Some(code) = self.shadow.text(&cell).map(str::to_owned) else {
                continue;
            };
            match self.transport.execute(&handle, &cell, &code).await {
                Ok(outputs) => self.surface_output(&cell, outputs).await?,
                Err(e) => {
                    log::warn!("{e}");
                    self.surface_output(&cell, vec![OutputFragment::error(e.to_string())])
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendHandle, SessionDescriptor};
    use crate::view::{MemoryView, StaticSettings};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl ExecutionTransport for NullTransport {
        async fn create_session(
            &self,
            group: &NodeId,
            _path: &str,
            _credentials: Option<&str>,
        ) -> Result<BackendHandle, BackendError> {
            Ok(BackendHandle {
                group: group.clone(),
                connection: "null".into(),
                descriptor: SessionDescriptor {
                    session_id: group.to_string(),
                    kernel_name: "null".into(),
                },
            })
        }

        async fn execute(
            &self,
            _handle: &BackendHandle,
            _cell: &NodeId,
            code: &str,
        ) -> Result<Vec<OutputFragment>, BackendError> {
            Ok(vec![OutputFragment::text(code)])
        }
    }

    fn session() -> SyncSession<MemoryView> {
        SyncSession::new(
            SessionConfig::default(),
            MemoryView::new(),
            Arc::new(NullTransport),
            Arc::new(StaticSettings::default()),
        )
    }

    fn remote() -> ClientId {
        Uuid::new_v4()
    }

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.backend_ready_timeout, Duration::from_secs(30));
        assert!(config.credentials.is_none());
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let mut s = session();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert!(s.take_event_rx().is_some());
        assert!(s.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_local_ops_require_connection() {
        let mut s = session();
        let err = s.edit_text(&id("c1"), "x").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(matches!(
            s.delete_node(&id("c1")).await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_remote_update_reaches_view() {
        let mut s = session();
        let mut events = s.take_event_rx().unwrap();
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::code("c1", "x=1", Position::ORIGIN),
            output_node: None,
            edge: None,
        })
        .await;
        s.apply_remote(SyncMessage::Update {
            client: remote(),
            node_id: id("c1"),
            patch: patch::diff("x=1", "x=2"),
        })
        .await;

        assert_eq!(s.shadow().text(&id("c1")), Some("x=2"));
        assert_eq!(s.view().text(&id("c1")), Some("x=2"));
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::TextChanged {
                node_id: id("c1"),
                text: "x=2".into(),
                clean: true
            }
        );
    }

    #[tokio::test]
    async fn test_remote_update_keeps_view_edits() {
        let mut s = session();
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::code("c1", "a = 1\nb = 2\n", Position::ORIGIN),
            output_node: None,
            edge: None,
        })
        .await;
        // The UI has typed on the last line but not yet pushed the edit.
        s.set_view_text(&id("c1"), "a = 1\nb = 2\nc\n".to_string());

        s.apply_remote(SyncMessage::Update {
            client: remote(),
            node_id: id("c1"),
            patch: patch::diff("a = 1\nb = 2\n", "a = 9\nb = 2\n"),
        })
        .await;

        assert_eq!(s.shadow().text(&id("c1")), Some("a = 9\nb = 2\n"));
        assert_eq!(s.view().text(&id("c1")), Some("a = 9\nb = 2\nc\n"));
    }

    #[tokio::test]
    async fn test_child_before_group() {
        let mut s = session();
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::code("c1", "", Position::new(10.0, 10.0)).with_parent("g1"),
            output_node: None,
            edge: None,
        })
        .await;
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::group("g1", Position::new(100.0, 0.0), Size::new(400.0, 300.0)),
            output_node: None,
            edge: None,
        })
        .await;

        let doc = s.shadow().document();
        assert_eq!(doc.children_of(&id("g1")).count(), 1);
        assert_eq!(doc.absolute_position(&id("c1")), Some(Position::new(110.0, 10.0)));
        assert_eq!(s.view().nodes().len(), 2);

        let handle = s
            .backends()
            .wait_ready(&id("g1"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handle.group, id("g1"));
    }

    #[tokio::test]
    async fn test_remote_delete_cascades_in_view() {
        let mut s = session();
        let cell = Node::code("c1", "1", Position::ORIGIN);
        let output = Node::output_for(&cell, Position::new(0.0, 100.0), vec![]);
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: cell,
            output_node: Some(output),
            edge: Some(Edge::new("c1", "c1_output", EdgeKind::Structural)),
        })
        .await;
        assert_eq!(s.view().edges().len(), 1);

        let delete = SyncMessage::Delete {
            client: remote(),
            node_id: id("c1"),
        };
        s.apply_remote(delete.clone()).await;
        s.apply_remote(delete).await;

        assert!(s.view().nodes().is_empty());
        assert!(s.view().edges().is_empty());
        assert!(s.shadow().document().nodes.is_empty());
    }

    #[tokio::test]
    async fn test_presence_messages_update_roster() {
        let mut s = session();
        let mut events = s.take_event_rx().unwrap();
        let peer = remote();
        s.apply_remote(SyncMessage::NewUser {
            client: peer,
            display_name: "grace".into(),
            color_code: presence::color_code(peer),
        })
        .await;
        s.apply_remote(SyncMessage::ClickedNode {
            client: peer,
            node_id: Some(id("c1")),
            display_name: "grace".into(),
        })
        .await;

        assert_eq!(s.roster().focused_on(&id("c1")).len(), 1);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::RosterChanged);
    }

    #[tokio::test]
    async fn test_required_size_grows_group() {
        let mut s = session();
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::group("g1", Position::ORIGIN, Size::new(200.0, 100.0)),
            output_node: None,
            edge: None,
        })
        .await;
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::code("c1", "", Position::new(50.0, 40.0)).with_parent("g1"),
            output_node: None,
            edge: None,
        })
        .await;

        assert_eq!(s.required_size(&id("g1")), Some(Size::new(370.0, 140.0)));
        assert_eq!(s.required_size(&id("c1")), None);
    }

    #[tokio::test]
    async fn test_full_event_channel_drops_event() {
        let (tx, mut rx) = mpsc::channel(1);
        send_event(&tx, SessionEvent::Synchronized);
        send_event(&tx, SessionEvent::Disconnected);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Synchronized);
        assert!(rx.try_recv().is_err());

        drop(rx);
        send_event(&tx, SessionEvent::RosterChanged);
    }

    #[tokio::test]
    async fn test_remote_splice_retargets_view_edges() {
        let mut s = session();
        let mut events = s.take_event_rx().unwrap();
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::group("g1", Position::ORIGIN, Size::new(400.0, 300.0)),
            output_node: None,
            edge: None,
        })
        .await;
        s.apply_remote(SyncMessage::Add {
            client: remote(),
            node: Node::group("g2", Position::ORIGIN, Size::new(400.0, 300.0)).with_predecessor("g1"),
            output_node: None,
            edge: Some(Edge::new("g1", "g2", EdgeKind::ExecutionLineage)),
        })
        .await;
        assert_eq!(s.view().edges().len(), 1);

        let mut g1b = Node::group("g1b", Position::ORIGIN, Size::new(400.0, 300.0)).with_predecessor("g1");
        g1b.data.successor_ids.insert(id("g2"));
        s.apply_remote(SyncMessage::Predecessor {
            client: remote(),
            node: g1b,
            edge: Some(Edge::new("g1b", "g2", EdgeKind::ExecutionLineage)),
        })
        .await;

        let mut edges: Vec<_> = s.view().edges().iter().map(|e| e.id.clone()).collect();
        edges.sort();
        assert_eq!(
            edges,
            vec![ids::edge_id(&id("g1"), &id("g1b")), ids::edge_id(&id("g1b"), &id("g2"))]
        );
        let g1 = s.view().node(&id("g1")).unwrap();
        assert!(g1.data.successor_ids.contains(&id("g1b")));
        assert!(!g1.data.successor_ids.contains(&id("g2")));

        // The spliced group gets its own backend.
        s.backends()
            .wait_ready(&id("g1b"), Duration::from_secs(1))
            .await
            .unwrap();
        let mut ready = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::BackendReady(group) = event {
                ready.push(group);
            }
        }
        assert!(ready.contains(&id("g1b")));
    }
}
