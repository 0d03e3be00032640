//! Peer registry using the Actor pattern.
//!
//! Each running peer owns exactly one registry: its own record plus a
//! mirror of every other peer it has heard of on the medium. The registry
//! lives inside a `PeerActor` task; everything else talks to it through a
//! `PeerHandle`.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  HostSignal   ┌──────────────────┐  Message   ┌──────────┐
//!  │     Host     │──────────────▶│    PeerActor     │◀──────────▶│  Medium  │
//!  └──────────────┘  (mpsc)       │                  │  (frames)  └──────────┘
//!         ▲                       │  PeerTable       │
//!         │ terminate / focus /   │  MethodTable     │
//!         │ open_related          │  Coalescer       │
//!         └───────────────────────│  ScreenTable     │
//!                                 └──────────────────┘
//!  ┌──────────────┐ RegistryCommand        ▲
//!  │  PeerHandle  │────────────────────────┘
//!  └──────────────┘ (mpsc + oneshot)       ▲
//!  ┌──────────────┐ ApplyScreens           │
//!  │ScreenReconciler│──────────────────────┘
//!  └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use winmesh_core::{PeerId, PeerInfo, PeerRecord, PeerState, PeerTable};
use winmesh_protocol::{encode, Message};

use crate::config::NodeConfig;
use crate::host::{Host, HostSignal};
use crate::medium::Medium;
use crate::methods::MethodTable;
use crate::screen::{ScreenReconciler, ScreenSource};

mod actor;
mod commands;
mod handle;

pub use actor::{ActorChannels, PeerActor, MAX_BATCH};
pub use commands::{RegistryChange, RegistryCommand, RegistryError};
pub use handle::{PeerHandle, PeerRef};

/// Collaborators a peer runs against.
pub struct PeerContext {
    pub medium: Arc<dyn Medium>,
    pub host: Arc<dyn Host>,
    /// Lifecycle signals from the host.
    pub signals: mpsc::Receiver<HostSignal>,
    /// Screen subsystem; `None` disables screen tracking.
    pub screens: Option<Arc<dyn ScreenSource>>,
}

impl fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerContext")
            .field("screens", &self.screens.is_some())
            .finish_non_exhaustive()
    }
}

/// Caller-supplied parts of a new peer.
#[derive(Debug)]
pub struct PeerOptions {
    /// Caller payload stored in the write-once `info`.
    pub info: Value,
    /// Initial caller payload of the mutable state.
    pub state: Value,
    /// Methods other peers may invoke. Builtins are added on spawn.
    pub methods: MethodTable,
    pub max_peers: usize,
    pub command_buffer: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

impl PeerOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            info: Value::Null,
            state: Value::Null,
            methods: MethodTable::new(),
            max_peers: config.max_peers,
            command_buffer: config.command_buffer,
        }
    }

    #[must_use]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }
}

/// Starts a peer and returns a handle to it.
///
/// This function:
/// 1. Builds the local record from the host snapshot (the opener becomes
///    the parent, and a peer with an opener is controlled)
/// 2. Subscribes to the medium, then broadcasts `declare`
/// 3. Spawns the PeerActor on a tokio task
/// 4. Spawns the screen reconciler if a screen source was given
///
/// Cancelling `cancel` stops the peer without announcing `close`; the host's
/// `AboutToTerminate` signal announces it first.
///
/// # Errors
///
/// Fails only if the `declare` cannot be encoded or sent.
pub fn spawn_peer(
    context: PeerContext,
    options: PeerOptions,
    cancel: CancellationToken,
) -> Result<PeerHandle, RegistryError> {
    let PeerContext {
        medium,
        host,
        signals,
        screens,
    } = context;

    let snapshot = host.snapshot();
    let local_id = PeerId::generate();
    let info = PeerInfo::new(snapshot.opener.is_some(), snapshot.popup).with_user(options.info);
    let state = PeerState {
        parent_id: snapshot.opener,
        screen_id: None,
        focused: snapshot.focused,
        visible: snapshot.visible,
        fullscreen: snapshot.fullscreen,
        user: options.state,
    };
    let peers = PeerTable::new(PeerRecord::local(local_id.clone(), info, state))?;

    let mut methods = options.methods;
    methods.install_builtins(Arc::clone(&host));

    // Subscribe before declaring so no reply is missed
    let frames = medium.subscribe();
    let declare = encode(&Message::declare(peers.local()?.serialize()))?;
    medium.send(Bytes::from(declare))?;

    let (cmd_tx, cmd_rx) = mpsc::channel(options.command_buffer.max(1));
    let token = cancel.child_token();
    let actor = PeerActor::new(
        peers,
        ActorChannels {
            commands: cmd_rx,
            signals,
            frames,
        },
        medium,
        host,
        methods,
        options.max_peers,
        token.clone(),
    );
    let handle = PeerHandle::new(local_id.clone(), cmd_tx, actor.changes());
    tokio::spawn(actor.run());

    if let Some(source) = screens {
        let reconciler = ScreenReconciler::new(source, handle.clone(), token);
        tokio::spawn(reconciler.run());
    }

    info!(peer_id = %local_id, "Peer started");
    Ok(handle)
}
