//! winmesh Core - Shared types for peer presence and state mirroring
//!
//! This crate provides the domain types shared between the wire protocol
//! (`winmesh-protocol`) and the peer engine (`winmesh-node`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod peer;
pub mod screen;
pub mod table;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use peer::{
    PeerId, PeerInfo, PeerInfrastructure, PeerRecord, PeerState, PeerView, SerializedPeer,
    PEER_ID_LEN,
};
pub use screen::{ScreenDescriptor, ScreenEntry, ScreenId, ScreenTable};
pub use table::PeerTable;
