//! Domain-specific error types following panic-free policy.

use crate::PeerId;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Peer not found in the table
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: PeerId },

    /// Peer identity already known
    #[error("Peer already exists: {peer_id}")]
    PeerAlreadyExists { peer_id: PeerId },

    /// Attempt to remove the local peer from its own table
    #[error("Local peer {peer_id} cannot be removed")]
    LocalPeerPermanent { peer_id: PeerId },

    /// A mirror record was offered where the local record is required
    #[error("Peer {peer_id} is not a local record")]
    NotLocal { peer_id: PeerId },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
