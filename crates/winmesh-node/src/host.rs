//! Host window capability.
//!
//! Everything the engine needs from the surrounding window system is behind
//! the [`Host`] trait, injected at spawn time. Lifecycle changes flow the
//! other way, as [`HostSignal`]s on a channel the engine listens to.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use winmesh_core::PeerId;

/// Lifecycle signals delivered by the host to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// The host is about to destroy this peer.
    AboutToTerminate,
    VisibilityChanged(bool),
    FocusChanged(bool),
    FullscreenChanged(bool),
}

/// Options for opening a related peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Open as a secondary/popup surface.
    #[serde(default)]
    pub popup: bool,
}

/// Options forwarded to the host's fullscreen request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullscreenOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_ui: Option<String>,
}

/// Facts about the window at the moment the peer starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSnapshot {
    /// Peer that opened this window, if any.
    pub opener: Option<PeerId>,
    pub popup: bool,
    pub focused: bool,
    pub visible: bool,
    pub fullscreen: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host does not support {0}")]
    Unsupported(&'static str),
    #[error("host operation failed: {0}")]
    Failed(String),
}

/// Window operations the engine may perform on its own window.
///
/// Only `snapshot` and `terminate_self` are required; the rest default to
/// [`HostError::Unsupported`].
pub trait Host: Send + Sync {
    fn snapshot(&self) -> HostSnapshot;

    /// Asks the host to destroy this peer. The host is expected to follow
    /// up with [`HostSignal::AboutToTerminate`].
    fn terminate_self(&self) -> Result<(), HostError>;

    fn focus(&self) -> Result<(), HostError> {
        Err(HostError::Unsupported("focus"))
    }

    fn move_to(&self, _x: i32, _y: i32) -> Result<(), HostError> {
        Err(HostError::Unsupported("move_to"))
    }

    fn resize_to(&self, _width: u32, _height: u32) -> Result<(), HostError> {
        Err(HostError::Unsupported("resize_to"))
    }

    fn request_fullscreen(&self, _options: &FullscreenOptions) -> Result<(), HostError> {
        Err(HostError::Unsupported("request_fullscreen"))
    }

    /// Opens a new peer whose opener is `opener`.
    fn open_related(&self, _opener: &PeerId, _options: OpenOptions) -> Result<(), HostError> {
        Err(HostError::Unsupported("open_related"))
    }
}
