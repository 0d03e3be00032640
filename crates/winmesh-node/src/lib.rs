//! winmesh Node - Peer engine for presence and state mirroring
//!
//! This crate runs one peer of the protocol:
//! - `registry` - Peer actor owning the registry, plus its handle
//! - `medium` - Broadcast medium abstraction and the in-process `LocalBus`
//! - `host` - Window capability the engine drives and listens to
//! - `methods` - Locally registered methods, builtins included
//! - `notify` - Change-notification coalescer
//! - `screen` - Screen subsystem and reconciler
//! - `config` - Node configuration
//! - `sim` - In-process multi-peer simulation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        one peer                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   PeerHandle    │────▶│         PeerActor           │   │
//! │  │ (application)   │     │  (registry state owner)     │   │
//! │  └─────────────────┘     └──────┬───────────────┬──────┘   │
//! │                                 │               │           │
//! │  ┌─────────────────┐   signals  │               │ frames    │
//! │  │      Host       │◀──────────▶│               ▼           │
//! │  └─────────────────┘            │     ┌──────────────────┐  │
//! │  ┌─────────────────┐ ApplyScreens     │  Medium channel  │  │
//! │  │ScreenReconciler │────────────┘     │ (other peers)    │  │
//! │  └─────────────────┘                  └──────────────────┘  │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod host;
pub mod medium;
pub mod methods;
pub mod notify;
pub mod registry;
pub mod screen;
pub mod sim;

pub use config::{ConfigError, NodeConfig};
pub use host::{FullscreenOptions, Host, HostError, HostSignal, HostSnapshot, OpenOptions};
pub use medium::{LocalBus, LocalEndpoint, Medium, MediumError};
pub use methods::{MethodError, MethodTable};
pub use notify::ListenerId;
pub use registry::{
    spawn_peer, PeerContext, PeerHandle, PeerOptions, PeerRef, RegistryChange, RegistryError,
};
pub use screen::{Permission, ScreenDetails, ScreenError, ScreenEvent, ScreenSource};
