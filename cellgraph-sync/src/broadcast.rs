//! Per-room fan-out of relay frames.
//!
//! One tokio broadcast channel per room; each member holds its own
//! receiver buffering up to `capacity` frames. Frames are encoded once and
//! shared. Every frame remembers its sender so a member's connection task
//! can skip its own messages.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ClientId, ProtocolError, SyncMessage};

/// An encoded message on its way to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub sender: ClientId,
    pub text: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_members: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    members: RwLock<HashSet<ClientId>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per member before a slow member
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Add a member and return its receiver.
    pub async fn add_member(&self, client: ClientId) -> broadcast::Receiver<Arc<RelayFrame>> {
        self.members.write().await.insert(client);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, client: &ClientId) -> bool {
        self.members.write().await.remove(client)
    }

    /// Encode `msg` once and send it to every member.
    ///
    /// The sender receives it too; filtering is the receiver's job.
    /// Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = RelayFrame {
            sender: msg.client(),
            text: msg.encode()?,
        };
        Ok(self.broadcast_raw(Arc::new(frame)))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RelayFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a member lost to lag.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, client: &ClientId) -> bool {
        self.members.read().await.contains(client)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_members: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
