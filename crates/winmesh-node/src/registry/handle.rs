//! Client interface for interacting with the PeerActor.
//!
//! The `PeerHandle` provides a cheap-to-clone interface for sending commands
//! to the peer actor. `PeerRef` scopes the per-peer operations (close,
//! method calls, window builtins) to one identity.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`
//! - Queries degrade to `None` or empty results once the actor has stopped

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use winmesh_core::{PeerId, PeerView, ScreenId, ScreenTable};

use super::commands::{RegistryChange, RegistryCommand, RegistryError};
use crate::host::{FullscreenOptions, OpenOptions};
use crate::methods::{FOCUS, MOVE_TO, REQUEST_FULLSCREEN, RESIZE_TO};
use crate::notify::ListenerId;

// ============================================================================
// Peer Handle
// ============================================================================

/// Handle for interacting with a running peer.
///
/// # Usage
///
/// ```ignore
/// let handle = spawn_peer(context, PeerOptions::default(), cancel)?;
///
/// handle.set_local_state(json!({ "title": "Inbox" })).await?;
///
/// for peer in handle.peers().await {
///     println!("{}", peer.id);
/// }
/// ```
#[derive(Clone)]
pub struct PeerHandle {
    local_id: PeerId,
    sender: mpsc::Sender<RegistryCommand>,
    changes: watch::Receiver<u64>,
}

impl PeerHandle {
    pub fn new(
        local_id: PeerId,
        sender: mpsc::Sender<RegistryCommand>,
        changes: watch::Receiver<u64>,
    ) -> Self {
        Self {
            local_id,
            sender,
            changes,
        }
    }

    /// Identity of the peer this handle drives.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// True until the actor stops.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Every known peer, local one included, ordered by identity.
    ///
    /// Returns an empty vector if the actor has stopped.
    pub async fn peers(&self) -> Vec<PeerView> {
        self.request(|respond_to| RegistryCommand::GetPeers { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Looks up one peer. `None` if unknown or if the actor has stopped.
    pub async fn peer(&self, peer_id: &PeerId) -> Option<PeerView> {
        self.request(|respond_to| RegistryCommand::GetPeer {
            peer_id: peer_id.clone(),
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// The local peer's current view.
    pub async fn local(&self) -> Option<PeerView> {
        self.peer(&self.local_id).await
    }

    /// Peers with no resolvable parent.
    pub async fn orphans(&self) -> Vec<PeerView> {
        self.request(|respond_to| RegistryCommand::GetOrphans { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Peers naming `peer_id` as their parent.
    pub async fn children(&self, peer_id: &PeerId) -> Vec<PeerView> {
        self.peers()
            .await
            .into_iter()
            .filter(|peer| peer.parent.as_ref() == Some(peer_id))
            .collect()
    }

    /// The resolved parent of `peer_id`, if it is a live peer.
    pub async fn parent(&self, peer_id: &PeerId) -> Option<PeerView> {
        let parent_id = self.peer(peer_id).await?.parent?;
        self.peer(&parent_id).await
    }

    /// Latest reconciled screen table. `None` without screen tracking.
    pub async fn screens(&self) -> Option<ScreenTable> {
        self.request(|respond_to| RegistryCommand::GetScreens { respond_to })
            .await
            .ok()
            .flatten()
    }

    // ------------------------------------------------------------------------
    // Change notifications
    // ------------------------------------------------------------------------

    /// Registers a change listener.
    ///
    /// The listener runs on the actor task, at most once per tick, and must
    /// not block. With `fire_immediately` it is also called once with
    /// `None` on the next tick.
    pub async fn subscribe_to_changes(
        &self,
        listener: impl FnMut(Option<&RegistryChange>) + Send + 'static,
        fire_immediately: bool,
    ) -> Result<ListenerId, RegistryError> {
        self.request(|respond_to| RegistryCommand::Subscribe {
            listener: Box::new(listener),
            fire_immediately,
            respond_to,
        })
        .await
    }

    /// Removes a change listener. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.request(|respond_to| RegistryCommand::Unsubscribe { id, respond_to })
            .await
            .unwrap_or(false)
    }

    /// Registers a listener for `peer_id`'s state changes.
    ///
    /// Fires on every tick in which that peer's state changed, whether by a
    /// remote `update` or by a local mutation. The listener is dropped when
    /// the peer leaves.
    pub async fn subscribe_to_peer(
        &self,
        peer_id: &PeerId,
        listener: impl FnMut(Option<&RegistryChange>) + Send + 'static,
        fire_immediately: bool,
    ) -> Result<ListenerId, RegistryError> {
        self.request(|respond_to| RegistryCommand::SubscribePeer {
            peer_id: peer_id.clone(),
            listener: Box::new(listener),
            fire_immediately,
            respond_to,
        })
        .await?
    }

    /// Removes a per-peer listener. Returns false if it was not registered.
    pub async fn unsubscribe_from_peer(&self, peer_id: &PeerId, id: ListenerId) -> bool {
        self.request(|respond_to| RegistryCommand::UnsubscribePeer {
            peer_id: peer_id.clone(),
            id,
            respond_to,
        })
        .await
        .unwrap_or(false)
    }

    /// Counter bumped once per tick that carried a change.
    ///
    /// Closes when the actor stops.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Waits until `predicate` holds for the current peer list.
    ///
    /// Returns the matching list, or `None` if the actor stopped first.
    pub async fn wait_for(&self, predicate: impl Fn(&[PeerView]) -> bool) -> Option<Vec<PeerView>> {
        let mut changes = self.changes();
        loop {
            let _ = changes.borrow_and_update();
            let peers = self.peers().await;
            if predicate(&peers) {
                return Some(peers);
            }
            if changes.changed().await.is_err() {
                return None;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    /// Shallow-merges `patch` into the local caller payload and sends one
    /// `update`.
    pub async fn set_local_state(&self, patch: Value) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::SetLocalState { patch, respond_to })
            .await?
    }

    /// Asks the host to open a new peer with this one as opener.
    pub async fn open_related_peer(&self, options: OpenOptions) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::OpenRelated {
            options,
            respond_to,
        })
        .await?
    }

    /// Invokes `name` on `peer_id`.
    ///
    /// The local peer runs the method in place; any other peer gets one
    /// `run` message and nothing is executed here.
    pub async fn invoke(
        &self,
        peer_id: &PeerId,
        name: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        self.request(|respond_to| RegistryCommand::Invoke {
            peer_id: peer_id.clone(),
            name,
            args,
            respond_to,
        })
        .await?
    }

    /// Closes `peer_id`: terminates the local peer, or orders a controlled
    /// remote peer to close.
    pub async fn close_peer(&self, peer_id: &PeerId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::ClosePeer {
            peer_id: peer_id.clone(),
            respond_to,
        })
        .await?
    }

    pub(crate) async fn apply_screens(&self, table: Option<ScreenTable>) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::ApplyScreens { table, respond_to })
            .await?
    }

    /// Scopes per-peer operations to `peer_id`.
    pub fn peer_ref(&self, peer_id: PeerId) -> PeerRef {
        PeerRef {
            handle: self.clone(),
            id: peer_id,
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("local_id", &self.local_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// Peer Reference
// ============================================================================

/// Per-peer operations, addressed by identity.
///
/// Holding a `PeerRef` does not keep the peer alive; operations on a peer
/// that has left fail with `RegistryError::PeerNotFound`.
#[derive(Debug, Clone)]
pub struct PeerRef {
    handle: PeerHandle,
    id: PeerId,
}

impl PeerRef {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn is_local(&self) -> bool {
        self.handle.local_id() == &self.id
    }

    pub async fn view(&self) -> Option<PeerView> {
        self.handle.peer(&self.id).await
    }

    pub async fn close(&self) -> Result<(), RegistryError> {
        self.handle.close_peer(&self.id).await
    }

    /// Listens for this peer's state changes. See
    /// [`PeerHandle::subscribe_to_peer`].
    pub async fn subscribe_to_changes(
        &self,
        listener: impl FnMut(Option<&RegistryChange>) + Send + 'static,
        fire_immediately: bool,
    ) -> Result<ListenerId, RegistryError> {
        self.handle
            .subscribe_to_peer(&self.id, listener, fire_immediately)
            .await
    }

    pub async fn unsubscribe(&self, id: ListenerId) -> bool {
        self.handle.unsubscribe_from_peer(&self.id, id).await
    }

    pub async fn invoke(&self, name: impl Into<String>, args: Vec<Value>) -> Result<(), RegistryError> {
        self.handle.invoke(&self.id, name, args).await
    }

    pub async fn focus(&self) -> Result<(), RegistryError> {
        self.invoke(FOCUS, Vec::new()).await
    }

    pub async fn move_to(&self, x: i32, y: i32) -> Result<(), RegistryError> {
        self.invoke(MOVE_TO, vec![Value::from(x), Value::from(y)]).await
    }

    /// Moves the peer to `(x, y)` relative to the top-left corner of
    /// `screen`, resolved against the local screen table.
    pub async fn move_to_screen(&self, screen: &ScreenId, x: i32, y: i32) -> Result<(), RegistryError> {
        let descriptor = self
            .handle
            .screens()
            .await
            .and_then(|table| table.get(screen).cloned())
            .ok_or_else(|| RegistryError::ScreenNotFound(screen.clone()))?;
        self.move_to(
            x.saturating_add(descriptor.left),
            y.saturating_add(descriptor.top),
        )
        .await
    }

    pub async fn resize_to(&self, width: u32, height: u32) -> Result<(), RegistryError> {
        self.invoke(RESIZE_TO, vec![Value::from(width), Value::from(height)])
            .await
    }

    pub async fn request_fullscreen(&self, options: FullscreenOptions) -> Result<(), RegistryError> {
        self.invoke(REQUEST_FULLSCREEN, vec![to_value(&options)?]).await
    }
}

fn to_value(value: &impl Serialize) -> Result<Value, RegistryError> {
    serde_json::to_value(value).map_err(|e| RegistryError::Protocol(e.to_string()))
}
