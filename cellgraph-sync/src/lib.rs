//! # cellgraph-sync: Real-time collaboration for cell-graph notebooks
//!
//! Keeps several editors of one notebook graph converged through a relay.
//! Text is reconciled with fuzzy patches against a shadow replica; every
//! structural edit travels as a JSON message and is applied idempotently.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncSession │ ◄────────────────► │ RelayServer │
//! │ (per user)  │     JSON frames    │ (per room)  │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌─────────────┐
//! │ ShadowStore │                    │ ShadowStore │
//! │ + LiveView  │                    │ + roster    │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                   ┌───────┴────────┐
//!                                   │ BroadcastGroup │
//!                                   │ (fan-out)      │
//!                                   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`patch`]: Text reconciler with fuzzy patch placement
//! - [`model`] / [`ids`]: Graph model and derived identifiers
//! - [`shadow`]: Shadow replica with cascade and reparent semantics
//! - [`lineage`]: Execution lineage chains and per-group execution state
//! - [`protocol`]: JSON wire protocol
//! - [`presence`]: Participant roster and node focus
//! - [`backend`]: Execution backend acquisition per group
//! - [`session`]: Client-side sync session
//! - [`client`]: WebSocket link to the relay
//! - [`broadcast`] / [`server`]: Relay side

pub mod ids;
pub mod model;
pub mod patch;
pub mod shadow;
pub mod lineage;
pub mod protocol;
pub mod presence;
pub mod view;
pub mod backend;
pub mod client;
pub mod session;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use ids::{EdgeId, NodeId};
pub use model::{Edge, EdgeKind, Node, NodeData, NodeKind, OutputFragment, Position, ShadowDocument, Size};
pub use patch::{Applied, HunkOutcome, Patch, PatchError};
pub use shadow::ShadowStore;
pub use lineage::{ExecutionQueue, ExecutionState};
pub use protocol::{ClientId, ProtocolError, SyncMessage, RELAY_CLIENT};
pub use presence::{ClientPresence, PresenceRoster};
pub use view::{LiveView, MemoryView, SettingsProvider, StaticSettings};
pub use backend::{
    BackendClaim, BackendError, BackendHandle, BackendRegistry, BackendState, ExecutionTransport, SessionDescriptor,
};
pub use client::{ConnectionState, LinkEvent, RelayLink};
pub use session::{SessionConfig, SessionError, SessionEvent, SyncSession};
pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame};
pub use server::{RelayConfig, RelayError, RelayServer, RelayStats};
