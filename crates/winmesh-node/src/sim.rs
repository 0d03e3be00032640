//! In-process simulation harness.
//!
//! Runs any number of peers inside one process over a [`LocalBus`], with a
//! [`SimulatedHost`] standing in for the window system and
//! [`SimulatedScreens`] for the screen subsystem. Used by the `winmesh`
//! binary and by the integration tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use winmesh_core::{PeerId, ScreenDescriptor};

use crate::config::NodeConfig;
use crate::host::{FullscreenOptions, Host, HostError, HostSignal, HostSnapshot, OpenOptions};
use crate::medium::LocalBus;
use crate::registry::{spawn_peer, PeerContext, PeerHandle, PeerOptions, RegistryError};
use crate::screen::{Permission, ScreenDetails, ScreenError, ScreenEvent, ScreenSource};

// ============================================================================
// Simulated Host
// ============================================================================

/// A host operation performed on a simulated window.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Terminate,
    Focus,
    MoveTo(i32, i32),
    ResizeTo(u32, u32),
    RequestFullscreen(FullscreenOptions),
    OpenRelated(OpenOptions),
}

/// Window stand-in that records every operation.
///
/// `terminate_self` answers with `AboutToTerminate`, as a real window would.
/// `open_related` spawns a new peer in the owning simulation.
#[derive(Debug)]
pub struct SimulatedHost {
    snapshot: HostSnapshot,
    signals: mpsc::Sender<HostSignal>,
    calls: Mutex<Vec<HostCall>>,
    simulation: Weak<SimulationInner>,
}

impl SimulatedHost {
    /// Creates a host outside any simulation, together with the signal
    /// receiver to hand to the peer.
    pub fn standalone(snapshot: HostSnapshot, buffer: usize) -> (Arc<Self>, mpsc::Receiver<HostSignal>) {
        Self::create(snapshot, buffer, Weak::new())
    }

    fn create(
        snapshot: HostSnapshot,
        buffer: usize,
        simulation: Weak<SimulationInner>,
    ) -> (Arc<Self>, mpsc::Receiver<HostSignal>) {
        let (signals, rx) = mpsc::channel(buffer.max(1));
        let host = Arc::new(Self {
            snapshot,
            signals,
            calls: Mutex::new(Vec::new()),
            simulation,
        });
        (host, rx)
    }

    /// Every operation performed so far, oldest first.
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    /// Delivers a lifecycle signal. Returns false once the peer has stopped
    /// listening.
    pub async fn emit(&self, signal: HostSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }

    /// Destroys the window: the peer announces `close` and stops.
    pub async fn terminate(&self) -> bool {
        self.emit(HostSignal::AboutToTerminate).await
    }

    fn record(&self, call: HostCall) {
        self.calls.lock().push(call);
    }
}

impl Host for SimulatedHost {
    fn snapshot(&self) -> HostSnapshot {
        self.snapshot.clone()
    }

    fn terminate_self(&self) -> Result<(), HostError> {
        self.record(HostCall::Terminate);
        self.signals
            .try_send(HostSignal::AboutToTerminate)
            .map_err(|e| HostError::Failed(e.to_string()))
    }

    fn focus(&self) -> Result<(), HostError> {
        self.record(HostCall::Focus);
        Ok(())
    }

    fn move_to(&self, x: i32, y: i32) -> Result<(), HostError> {
        self.record(HostCall::MoveTo(x, y));
        Ok(())
    }

    fn resize_to(&self, width: u32, height: u32) -> Result<(), HostError> {
        self.record(HostCall::ResizeTo(width, height));
        Ok(())
    }

    fn request_fullscreen(&self, options: &FullscreenOptions) -> Result<(), HostError> {
        self.record(HostCall::RequestFullscreen(options.clone()));
        Ok(())
    }

    fn open_related(&self, opener: &PeerId, options: OpenOptions) -> Result<(), HostError> {
        self.record(HostCall::OpenRelated(options));
        let simulation = self
            .simulation
            .upgrade()
            .ok_or(HostError::Unsupported("open_related"))?;
        simulation
            .spawn(Some(opener.clone()), options.popup, None, None)
            .map(|_| ())
            .map_err(|e| HostError::Failed(e.to_string()))
    }
}

// ============================================================================
// Simulated Screens
// ============================================================================

/// Screen subsystem stand-in whose layout can be changed at will.
#[derive(Debug)]
pub struct SimulatedScreens {
    permission: Mutex<Result<Permission, ScreenError>>,
    details: Mutex<ScreenDetails>,
    events: broadcast::Sender<ScreenEvent>,
}

impl SimulatedScreens {
    pub fn new(screens: Vec<ScreenDescriptor>, current: Option<usize>) -> Self {
        Self {
            permission: Mutex::new(Ok(Permission::Granted)),
            details: Mutex::new(ScreenDetails { screens, current }),
            events: broadcast::channel(16).0,
        }
    }

    /// A subsystem that reports itself as missing.
    pub fn unsupported() -> Self {
        let screens = Self::new(Vec::new(), None);
        *screens.permission.lock() = Err(ScreenError::Unsupported);
        screens
    }

    pub fn set_current(&self, current: Option<usize>) {
        self.details.lock().current = current;
        self.publish(ScreenEvent::CurrentScreenChanged);
    }

    pub fn set_screens(&self, screens: Vec<ScreenDescriptor>, current: Option<usize>) {
        *self.details.lock() = ScreenDetails { screens, current };
        self.publish(ScreenEvent::ScreensChanged);
    }

    pub fn set_permission(&self, permission: Permission) {
        *self.permission.lock() = Ok(permission);
        self.publish(ScreenEvent::PermissionChanged(permission));
    }

    fn publish(&self, event: ScreenEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "No screen listeners");
        }
    }
}

#[async_trait]
impl ScreenSource for SimulatedScreens {
    async fn query_permission(&self) -> Result<Permission, ScreenError> {
        self.permission.lock().clone()
    }

    async fn enumerate(&self) -> Result<ScreenDetails, ScreenError> {
        let permission = self.permission.lock().clone()?;
        match permission {
            Permission::Granted => Ok(self.details.lock().clone()),
            Permission::Denied | Permission::Prompt => Err(ScreenError::PermissionDenied),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ScreenEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// One simulated window: its peer handle and its host.
#[derive(Debug, Clone)]
pub struct SimPeer {
    pub handle: PeerHandle,
    pub host: Arc<SimulatedHost>,
}

impl SimPeer {
    pub fn id(&self) -> &PeerId {
        self.handle.local_id()
    }
}

#[derive(Debug)]
struct SimulationInner {
    bus: LocalBus,
    config: NodeConfig,
    peers: Mutex<Vec<SimPeer>>,
    cancel: CancellationToken,
    me: Weak<SimulationInner>,
}

impl SimulationInner {
    fn spawn(
        &self,
        opener: Option<PeerId>,
        popup: bool,
        screens: Option<Arc<dyn ScreenSource>>,
        options: Option<PeerOptions>,
    ) -> Result<SimPeer, RegistryError> {
        let snapshot = HostSnapshot {
            opener,
            popup,
            focused: true,
            visible: true,
            fullscreen: false,
        };
        let (host, signals) =
            SimulatedHost::create(snapshot, self.config.signal_buffer, self.me.clone());

        let context = PeerContext {
            medium: Arc::new(self.bus.endpoint(&self.config.channel_name)),
            host: host.clone(),
            signals,
            screens,
        };
        let options = options.unwrap_or_else(|| PeerOptions::from_config(&self.config));
        let handle = spawn_peer(context, options, self.cancel.child_token())?;

        let peer = SimPeer { handle, host };
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

/// A set of peers sharing one in-process bus.
#[derive(Debug, Clone)]
pub struct Simulation {
    inner: Arc<SimulationInner>,
}

impl Simulation {
    pub fn new(config: NodeConfig) -> Self {
        let inner = Arc::new_cyclic(|me| SimulationInner {
            bus: LocalBus::new(),
            config,
            peers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            me: me.clone(),
        });
        Self { inner }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Starts a peer nobody opened.
    pub fn spawn_root(&self) -> Result<SimPeer, RegistryError> {
        self.inner.spawn(None, false, None, None)
    }

    /// Starts a peer with full control over its parts.
    pub fn spawn_with(
        &self,
        opener: Option<PeerId>,
        popup: bool,
        screens: Option<Arc<dyn ScreenSource>>,
        options: PeerOptions,
    ) -> Result<SimPeer, RegistryError> {
        self.inner.spawn(opener, popup, screens, Some(options))
    }

    /// Every peer ever started, in start order.
    pub fn peers(&self) -> Vec<SimPeer> {
        self.inner.peers.lock().clone()
    }

    /// Peers whose actor is still running.
    pub fn live_peers(&self) -> Vec<SimPeer> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.handle.is_connected())
            .collect()
    }

    pub fn find(&self, peer_id: &PeerId) -> Option<SimPeer> {
        self.peers().into_iter().find(|peer| peer.id() == peer_id)
    }

    /// Waits until every live peer knows exactly the set of live peers.
    ///
    /// Returns false if a peer stopped while waiting.
    pub async fn converge(&self) -> bool {
        let live = self.live_peers();
        let expected: BTreeSet<PeerId> = live.iter().map(|peer| peer.id().clone()).collect();

        for peer in &live {
            let reached = peer
                .handle
                .wait_for(|views| {
                    views.len() == expected.len()
                        && views.iter().all(|view| expected.contains(&view.id))
                })
                .await;
            if reached.is_none() {
                warn!(peer_id = %peer.id(), "Peer stopped before converging");
                return false;
            }
        }
        true
    }

    /// Stops every peer without announcing `close`.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}
