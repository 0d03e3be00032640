//! Broadcast message types.

use crate::version::ProtocolVersion;
use winmesh_core::{PeerId, PeerState, SerializedPeer};
use serde::{Deserialize, Serialize};

/// Messages exchanged between peers on the broadcast medium.
///
/// Every message is delivered to every other live peer on the channel.
/// Messages addressed to one peer (`order-close`, `run`) are ignored by
/// everyone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// A peer announces itself at startup and asks others to reply.
    Declare {
        node: SerializedPeer,
    },

    /// Reply to a declare, describing the replying peer.
    Info {
        node: SerializedPeer,
    },

    /// A peer is going away.
    Close {
        id: PeerId,
    },

    /// Asks the addressed peer to terminate itself.
    OrderClose {
        id: PeerId,
    },

    /// Full replacement of a peer's state.
    Update {
        id: PeerId,
        data: PeerState,
    },

    /// One-way method invocation on the addressed peer.
    Run {
        id: PeerId,
        name: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
}

impl Message {
    pub fn declare(node: SerializedPeer) -> Self {
        Self::Declare { node }
    }

    pub fn info(node: SerializedPeer) -> Self {
        Self::Info { node }
    }

    pub fn close(id: PeerId) -> Self {
        Self::Close { id }
    }

    pub fn order_close(id: PeerId) -> Self {
        Self::OrderClose { id }
    }

    pub fn update(id: PeerId, data: PeerState) -> Self {
        Self::Update { id, data }
    }

    pub fn run(id: PeerId, name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self::Run {
            id,
            name: name.into(),
            args,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Declare { .. } => "declare",
            Self::Info { .. } => "info",
            Self::Close { .. } => "close",
            Self::OrderClose { .. } => "order-close",
            Self::Update { .. } => "update",
            Self::Run { .. } => "run",
        }
    }

    /// Identity the message is about.
    pub fn subject(&self) -> &PeerId {
        match self {
            Self::Declare { node } | Self::Info { node } => &node.id,
            Self::Close { id }
            | Self::OrderClose { id }
            | Self::Update { id, .. }
            | Self::Run { id, .. } => id,
        }
    }
}

/// A message as it travels on the medium: payload plus version stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Protocol version of the sender
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: Message,
}

impl WireMessage {
    /// Wraps a message with the current protocol version.
    pub fn new(message: Message) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}
