//! winmesh Protocol - Wire format for the broadcast medium
//!
//! This crate provides the message types exchanged between peers and the
//! JSON framing used to put them on the medium.

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use message::{Message, WireMessage};
pub use version::{ProtocolVersion, VersionError};
