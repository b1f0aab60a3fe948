//! Relay server: routes protocol messages between the sessions of a room.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── Room ("/notebook-42") ── ShadowStore + PresenceRoster
//! Session B ──┘                │
//!                         BroadcastGroup
//!                    ┌─────────┼─────────┐
//!                    ▼         ▼         ▼
//!                Session A  Session B  Session C
//! ```
//!
//! Rooms are named by the WebSocket request path. Each room keeps its own
//! shadow replica, so a late joiner's `init` is answered with the converged
//! document and roster. The first client into an empty room seeds it with
//! its own document. Every other message is applied to the room's shadow
//! and fanned out to all members except its sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, RelayFrame};
use crate::model::ShadowDocument;
use crate::presence::{ClientPresence, PresenceRoster};
use crate::protocol::{ProtocolError, SyncMessage, RELAY_CLIENT};
use crate::shadow::ShadowStore;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_clients_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    /// Snapshots resent to members that fell behind the broadcast.
    pub resyncs: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("room {0} is full")]
    RoomFull(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Protocol(ProtocolError::WebSocket(e))
    }
}

/// One shared notebook: replica, roster, fan-out.
struct Room {
    shadow: ShadowStore,
    roster: PresenceRoster,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            shadow: ShadowStore::new(),
            roster: PresenceRoster::for_relay(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    /// The relay's `init` reply: converged document plus roster.
    fn snapshot_message(&self) -> SyncMessage {
        let doc = self.shadow.document();
        SyncMessage::Init {
            client: RELAY_CLIENT,
            display_name: "relay".to_string(),
            color_code: String::new(),
            nodes: doc.nodes_vec(),
            edges: doc.edges_vec(),
            users: self.roster.snapshot(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A joined member, as its connection task sees it.
struct Member {
    room: String,
    presence: ClientPresence,
    frames: broadcast::Receiver<Arc<RelayFrame>>,
    announced_close: bool,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats.clone(), config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                let mut s = stats.write().await;
                s.active_connections = s.active_connections.saturating_sub(1);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), RelayError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let room_name = room_name(&path);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection from {addr} for room {room_name}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let result = loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    let msg = match SyncMessage::decode(text.as_str()) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("Failed to decode frame from {addr}: {e}");
                            stats.write().await.rejected_frames += 1;
                            continue;
                        }
                    };

                    match &mut member {
                        None => match msg {
                            SyncMessage::Init { .. } => {
                                match Self::join(&rooms, &config, &room_name, msg, &mut ws_sender).await {
                                    Ok(joined) => member = Some(joined),
                                    Err(e) => break Err(e),
                                }
                            }
                            other => {
                                log::warn!("Dropping {} from {addr} before init", other.kind());
                                stats.write().await.rejected_frames += 1;
                            }
                        },
                        Some(joined) => {
                            if msg.client() != joined.presence.client_id {
                                log::warn!("Dropping {} from {addr} claiming another client", msg.kind());
                                stats.write().await.rejected_frames += 1;
                                continue;
                            }
                            if let SyncMessage::Init { .. } = msg {
                                // Re-sync request: answer with the room state.
                                let reply = {
                                    let rooms_r = rooms.read().await;
                                    rooms_r.get(&joined.room).map(Room::snapshot_message)
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                                }
                                continue;
                            }
                            if let SyncMessage::Close { .. } = msg {
                                joined.announced_close = true;
                            }
                            Self::relay(&rooms, &joined.room, &msg).await?;
                        }
                    }
                }

                frame = async {
                    match member.as_mut() {
                        Some(joined) => joined.frames.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            let own = member.as_ref().is_some_and(|m| m.presence.client_id == frame.sender);
                            if !own {
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Member at {addr} lagged by {n} messages, resending the room");
                            let snapshot = match member.as_mut() {
                                Some(joined) => Self::resync(&rooms, joined, n).await,
                                None => None,
                            };
                            if let Some(snapshot) = snapshot {
                                ws_sender.send(Message::Text(snapshot.encode()?.into())).await?;
                                stats.write().await.resyncs += 1;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        if let Some(joined) = member {
            Self::leave(&rooms, &stats, joined).await;
        }
        result
    }

    /// Add a client to its room and answer its `init`.
    async fn join(
        rooms: &Rooms,
        config: &RelayConfig,
        room_name: &str,
        init: SyncMessage,
        ws_sender: &mut WsSink,
    ) -> Result<Member, RelayError> {
        let SyncMessage::Init {
            client,
            display_name,
            color_code,
            nodes,
            edges,
            ..
        } = init
        else {
            return Err(RelayError::Protocol(ProtocolError::ConnectionClosed));
        };
        let presence = ClientPresence {
            client_id: client,
            display_name: display_name.clone(),
            color_code: color_code.clone(),
            focused_node_id: None,
        };

        let (reply, frames) = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w
                .entry(room_name.to_string())
                .or_insert_with(|| Room::new(config.broadcast_capacity));

            let members = room.broadcast.member_count().await;
            if members >= config.max_clients_per_room {
                log::warn!("Room {room_name} is full, refusing {client}");
                return Err(RelayError::RoomFull(room_name.to_string()));
            }
            if members == 0 {
                log::info!("Room {room_name} seeded by {display_name} with {} nodes", nodes.len());
                room.shadow.reset(nodes, edges);
            }

            room.roster.join(presence.clone());
            let frames = room.broadcast.add_member(client).await;
            room.broadcast.broadcast(&SyncMessage::NewUser {
                client,
                display_name: display_name.clone(),
                color_code,
            })?;
            (room.snapshot_message(), frames)
        };

        ws_sender.send(Message::Text(reply.encode()?.into())).await?;
        log::info!("{display_name} ({client}) joined room {room_name}");

        Ok(Member {
            room: room_name.to_string(),
            presence,
            frames,
            announced_close: false,
        })
    }

    /// Apply a member's message to the room and fan it out.
    async fn relay(rooms: &Rooms, room_name: &str, msg: &SyncMessage) -> Result<(), RelayError> {
        let mut rooms_w = rooms.write().await;
        let Some(room) = rooms_w.get_mut(room_name) else {
            return Ok(());
        };
        room.shadow.apply_message(msg);
        room.roster.handle_message(msg);
        let reached = room.broadcast.broadcast(msg)?;
        log::debug!("Relayed {} in {room_name} to {} members", msg.kind(), reached.saturating_sub(1));
        Ok(())
    }

    /// Snapshot the room for a member that fell behind and restart its
    /// receiver at the current tail.
    ///
    /// Room writes hold the write lock, so nothing can be broadcast between
    /// the snapshot and the fresh receiver.
    async fn resync(rooms: &Rooms, joined: &mut Member, skipped: u64) -> Option<SyncMessage> {
        let rooms_r = rooms.read().await;
        let room = rooms_r.get(&joined.room)?;
        room.broadcast.record_lag(skipped);
        joined.frames = joined.frames.resubscribe();
        Some(room.snapshot_message())
    }

    /// Remove a member, announce it, and drop the room once empty.
    async fn leave(rooms: &Rooms, stats: &Arc<RwLock<RelayStats>>, member: Member) {
        let client = member.presence.client_id;
        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&member.room) {
            room.broadcast.remove_member(&client).await;
            room.roster.leave(&client);
            if !member.announced_close {
                let close = SyncMessage::Close {
                    client,
                    display_name: member.presence.display_name.clone(),
                    color_code: member.presence.color_code.clone(),
                };
                if let Err(e) = room.broadcast.broadcast(&close) {
                    log::warn!("Could not announce departure of {client}: {e}");
                }
            }
            log::info!("{} ({client}) left room {}", member.presence.display_name, member.room);

            if room.broadcast.member_count().await == 0 {
                rooms_w.remove(&member.room);
                log::info!("Room {} removed (empty)", member.room);
            }
        }
        stats.write().await.active_rooms = rooms_w.len();
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.read().await.len();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// The room's current replica, if the room exists.
    pub async fn room_document(&self, room: &str) -> Option<ShadowDocument> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|r| r.shadow.document().clone())
    }

    /// The room's current roster, if the room exists.
    pub async fn room_roster(&self, room: &str) -> Option<Vec<ClientPresence>> {
        self.rooms.read().await.get(room).map(|r| r.roster.snapshot())
    }
}

/// Room name for a request path: `/notebook-42` → `notebook-42`.
fn room_name(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
