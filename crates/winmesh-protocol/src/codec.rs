//! JSON framing for broadcast messages.

use thiserror::Error;

use crate::message::{Message, WireMessage};
use crate::version::VersionError;

/// Largest frame accepted from the medium.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Version(#[from] VersionError),
}

/// Encodes a message into a frame stamped with the current version.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let wire = WireMessage::new(message.clone());
    let bytes = serde_json::to_vec(&wire)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decodes a frame, rejecting oversized frames and incompatible versions.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let wire: WireMessage = serde_json::from_slice(frame)?;
    wire.protocol_version.ensure_compatible()?;
    Ok(wire.message)
}
