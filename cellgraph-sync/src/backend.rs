//! Execution backends: one kernel session per group node.
//!
//! The transport that talks to kernels is external and reached through
//! [`ExecutionTransport`]. [`BackendRegistry`] tracks, per group, whether
//! its session is still being created, ready, or unavailable:
//!
//! ```text
//! add(group) ──► Pending ──create_session()──► Ready(handle)
//!                   │
//!                   └──────── error ─────────► Unavailable(reason)
//! ```
//!
//! Readiness is published on a `watch` channel so dependants wait for the
//! transition instead of polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::ids::NodeId;
use crate::model::OutputFragment;

/// Identity of a kernel session as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub kernel_name: String,
}

/// A live kernel connection for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    pub group: NodeId,
    pub connection: String,
    pub descriptor: SessionDescriptor,
}

/// Talks to whatever runs the code.
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// Start a kernel session for `group`.
    async fn create_session(
        &self,
        group: &NodeId,
        path: &str,
        credentials: Option<&str>,
    ) -> Result<BackendHandle, BackendError>;

    /// Run one cell's code and collect what it produced.
    async fn execute(
        &self,
        handle: &BackendHandle,
        cell: &NodeId,
        code: &str,
    ) -> Result<Vec<OutputFragment>, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("could not create a session for group {group}: {reason}")]
    SessionCreation { group: NodeId, reason: String },
    #[error("execution of {cell} failed: {reason}")]
    Execution { cell: NodeId, reason: String },
    #[error("backend for group {group} is unavailable: {reason}")]
    Unavailable { group: NodeId, reason: String },
    #[error("backend for group {group} not ready after {waited:?}")]
    Timeout { group: NodeId, waited: Duration },
}

/// Backend state of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Pending,
    Ready(BackendHandle),
    Unavailable(String),
}

/// Ticket for one acquisition attempt.
///
/// Results published under a ticket that no longer owns the slot are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendClaim(u64);

struct Slot {
    tx: watch::Sender<BackendState>,
    /// Acquisition that currently owns this group.
    claim: Option<BackendClaim>,
}

impl Slot {
    fn new(state: BackendState) -> Self {
        Self {
            tx: watch::channel(state).0,
            claim: None,
        }
    }
}

/// Per-group backend readiness.
#[derive(Default)]
pub struct BackendRegistry {
    slots: Mutex<HashMap<NodeId, Slot>>,
    next_claim: AtomicU64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `group` for acquisition.
    ///
    /// Returns a ticket exactly once per group, so a duplicate `add` never
    /// starts a second kernel.
    pub async fn register(&self, group: &NodeId) -> Option<BackendClaim> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .entry(group.clone())
            .or_insert_with(|| Slot::new(BackendState::Pending));
        if slot.claim.is_some() {
            return None;
        }
        let claim = BackendClaim(self.next_claim.fetch_add(1, Ordering::Relaxed));
        slot.claim = Some(claim);
        Some(claim)
    }

    pub async fn set_ready(&self, claim: BackendClaim, handle: BackendHandle) {
        let group = handle.group.clone();
        self.publish(&group, claim, BackendState::Ready(handle)).await;
    }

    pub async fn set_unavailable(&self, claim: BackendClaim, group: &NodeId, reason: impl Into<String>) {
        self.publish(group, claim, BackendState::Unavailable(reason.into()))
            .await;
    }

    /// Settle `group` if `claim` still owns it. A group removed or
    /// re-added while its acquisition ran keeps its current slot.
    async fn publish(&self, group: &NodeId, claim: BackendClaim, state: BackendState) {
        let slots = self.slots.lock().await;
        match slots.get(group) {
            Some(slot) if slot.claim == Some(claim) => {
                slot.tx.send_replace(state);
            }
            _ => log::debug!("Dropping stale backend result for group {group}"),
        }
    }

    /// Wait until `group`'s backend settles.
    ///
    /// The group does not need to be known yet: the wait resolves when its
    /// `add` lands later and acquisition finishes.
    pub async fn wait_ready(&self, group: &NodeId, timeout: Duration) -> Result<BackendHandle, BackendError> {
        let mut rx = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(group.clone())
                .or_insert_with(|| Slot::new(BackendState::Pending))
                .tx
                .subscribe()
        };

        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| !matches!(state, BackendState::Pending)),
        )
        .await
        .map_err(|_| BackendError::Timeout {
            group: group.clone(),
            waited: timeout,
        })?
        .map_err(|_| BackendError::Unavailable {
            group: group.clone(),
            reason: "group was removed".to_string(),
        })?;

        match &*settled {
            BackendState::Ready(handle) => Ok(handle.clone()),
            BackendState::Unavailable(reason) => Err(BackendError::Unavailable {
                group: group.clone(),
                reason: reason.clone(),
            }),
            BackendState::Pending => Err(BackendError::Timeout {
                group: group.clone(),
                waited: timeout,
            }),
        }
    }

    pub async fn state(&self, group: &NodeId) -> Option<BackendState> {
        self.slots.lock().await.get(group).map(|slot| slot.tx.borrow().clone())
    }

    pub async fn handle(&self, group: &NodeId) -> Option<BackendHandle> {
        match self.state(group).await? {
            BackendState::Ready(handle) => Some(handle),
            _ => None,
        }
    }

    /// Forget a group. Pending waiters fail.
    pub async fn remove(&self, group: &NodeId) {
        self.slots.lock().await.remove(group);
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle(group: &str) -> BackendHandle {
        BackendHandle {
            group: NodeId::from(group),
            connection: format!("ws://kernels/{group}"),
            descriptor: SessionDescriptor {
                session_id: format!("session-{group}"),
                kernel_name: "python3".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_register_then_ready() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        let claim = registry.register(&g1).await.unwrap();
        assert_eq!(registry.state(&g1).await, Some(BackendState::Pending));

        registry.set_ready(claim, handle("g1")).await;
        let got = registry.wait_ready(&g1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(got, handle("g1"));
    }

    #[tokio::test]
    async fn test_duplicate_register() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        let claim = registry.register(&g1).await.unwrap();
        registry.set_ready(claim, handle("g1")).await;
        assert!(registry.register(&g1).await.is_none());
        assert!(registry.handle(&g1).await.is_some());
    }

    #[tokio::test]
    async fn test_wait_before_register() {
        let registry = Arc::new(BackendRegistry::new());
        let g1 = NodeId::from("g1");

        let waiter = {
            let registry = registry.clone();
            let g1 = g1.clone();
            tokio::spawn(async move { registry.wait_ready(&g1, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The early waiter created the slot but did not claim it.
        let claim = registry.register(&g1).await.unwrap();
        registry.set_ready(claim, handle("g1")).await;

        assert_eq!(waiter.await.unwrap().unwrap(), handle("g1"));
    }

    #[tokio::test]
    async fn test_unavailable_fails_fast() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        let claim = registry.register(&g1).await.unwrap();
        registry.set_unavailable(claim, &g1, "no kernels").await;

        let err = registry.wait_ready(&g1, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            BackendError::Unavailable {
                group: g1,
                reason: "no kernels".into()
            }
        );
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        registry.register(&g1).await;

        let err = registry.wait_ready(&g1, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_remove_fails_waiters() {
        let registry = Arc::new(BackendRegistry::new());
        let g1 = NodeId::from("g1");
        registry.register(&g1).await;

        let waiter = {
            let registry = registry.clone();
            let g1 = g1.clone();
            tokio::spawn(async move { registry.wait_ready(&g1, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.remove(&g1).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_result_after_remove_is_dropped() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        let claim = registry.register(&g1).await.unwrap();
        registry.remove(&g1).await;

        registry.set_ready(claim, handle("g1")).await;
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.state(&g1).await, None);
    }

    #[tokio::test]
    async fn test_stale_result_skips_readded_group() {
        let registry = BackendRegistry::new();
        let g1 = NodeId::from("g1");
        let stale = registry.register(&g1).await.unwrap();
        registry.remove(&g1).await;
        let fresh = registry.register(&g1).await.unwrap();
        assert_ne!(stale, fresh);

        registry.set_ready(stale, handle("g1")).await;
        assert_eq!(registry.state(&g1).await, Some(BackendState::Pending));

        registry.set_unavailable(fresh, &g1, "no kernels").await;
        assert_eq!(
            registry.state(&g1).await,
            Some(BackendState::Unavailable("no kernels".into()))
        );
    }
}
