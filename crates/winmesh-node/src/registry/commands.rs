//! Peer actor commands, errors, and change events.
//!
//! This module defines the message types for communicating with the `PeerActor`:
//! - `RegistryCommand`: Commands sent to the actor by a `PeerHandle`
//! - `RegistryError`: Errors returned to callers
//! - `RegistryChange`: Hint passed to change listeners on each flush
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use winmesh_core::{DomainError, PeerId, PeerView, ScreenId, ScreenTable};
use winmesh_protocol::ProtocolError;

use crate::host::{HostError, OpenOptions};
use crate::medium::MediumError;
use crate::methods::MethodError;
use crate::notify::{Listener, ListenerId};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the peer actor.
///
/// Each command carries a oneshot channel for the response, so callers can
/// await the outcome without sharing state with the actor.
pub enum RegistryCommand {
    /// Get every known peer, local one included.
    GetPeers {
        respond_to: oneshot::Sender<Vec<PeerView>>,
    },

    /// Get a single peer by identity. `None` if unknown.
    GetPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<PeerView>>,
    },

    /// Get peers with no resolvable parent.
    GetOrphans {
        respond_to: oneshot::Sender<Vec<PeerView>>,
    },

    /// Get the latest reconciled screen table, if screen tracking is active.
    GetScreens {
        respond_to: oneshot::Sender<Option<ScreenTable>>,
    },

    /// Register a change listener.
    Subscribe {
        listener: Listener<RegistryChange>,
        fire_immediately: bool,
        respond_to: oneshot::Sender<ListenerId>,
    },

    /// Remove a change listener. Responds false if it was not registered.
    Unsubscribe {
        id: ListenerId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Register a listener for one peer's state changes.
    ///
    /// The listener is dropped when the peer leaves.
    ///
    /// # Errors
    /// - `RegistryError::PeerNotFound` if the peer is unknown
    SubscribePeer {
        peer_id: PeerId,
        listener: Listener<RegistryChange>,
        fire_immediately: bool,
        respond_to: oneshot::Sender<Result<ListenerId, RegistryError>>,
    },

    /// Remove a per-peer listener. Responds false if it was not registered.
    UnsubscribePeer {
        peer_id: PeerId,
        id: ListenerId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Merge `patch` into the local peer's caller payload and propagate.
    SetLocalState {
        patch: Value,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Ask the host to open a new peer with the local peer as opener.
    OpenRelated {
        options: OpenOptions,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Invoke a method on a peer.
    ///
    /// Runs in place for the local peer; sends `run` otherwise.
    ///
    /// # Errors
    /// - `RegistryError::PeerNotFound` if the peer is unknown
    /// - `RegistryError::Method` if a local call fails
    Invoke {
        peer_id: PeerId,
        name: String,
        args: Vec<Value>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Close a peer.
    ///
    /// # Errors
    /// - `RegistryError::PeerNotFound` if the peer is unknown
    /// - `RegistryError::NotControlled` for a remote peer nobody opened
    ClosePeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Install a freshly reconciled screen table (or none, if screen
    /// tracking is unavailable).
    ApplyScreens {
        table: Option<ScreenTable>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
}

impl RegistryCommand {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetPeers { .. } => "get_peers",
            Self::GetPeer { .. } => "get_peer",
            Self::GetOrphans { .. } => "get_orphans",
            Self::GetScreens { .. } => "get_screens",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::SubscribePeer { .. } => "subscribe_peer",
            Self::UnsubscribePeer { .. } => "unsubscribe_peer",
            Self::SetLocalState { .. } => "set_local_state",
            Self::OpenRelated { .. } => "open_related",
            Self::Invoke { .. } => "invoke",
            Self::ClosePeer { .. } => "close_peer",
            Self::ApplyScreens { .. } => "apply_screens",
        }
    }
}

impl fmt::Debug for RegistryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegistryCommand").field(&self.name()).finish()
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors returned by peer operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// The named peer is not in the registry.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Only peers opened by another peer may be closed remotely.
    #[error("peer {0} is not controlled and cannot be closed remotely")]
    NotControlled(PeerId),

    /// The screen is not in the current screen table.
    #[error("screen not found: {0}")]
    ScreenNotFound(ScreenId),

    /// The actor has stopped.
    #[error("response channel closed")]
    ChannelClosed,

    #[error("medium error: {0}")]
    Medium(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<MediumError> for RegistryError {
    fn from(err: MediumError) -> Self {
        Self::Medium(err.to_string())
    }
}

impl From<ProtocolError> for RegistryError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// What triggered a change notification.
///
/// Only the first change of a tick is delivered; listeners should re-read
/// the registry rather than rely on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    /// A peer was added to the registry.
    Joined(PeerId),
    /// A peer was removed from the registry.
    Left(PeerId),
    /// A peer's state changed (or the screen table did, for the local peer).
    Updated(PeerId),
}

impl RegistryChange {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Joined(id) | Self::Left(id) | Self::Updated(id) => id,
        }
    }
}
