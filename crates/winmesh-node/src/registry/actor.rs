//! Peer actor - owns the registry and runs the protocol.
//!
//! The PeerActor is the single owner of the peer registry in a process.
//! Every input (host signals, handle commands, medium frames) is processed
//! on its task, one at a time, so no two handlers ever interleave.
//!
//! # Ticks
//!
//! One turn of the event loop is one scheduling tick: the actor waits for an
//! event, then drains whatever else is already queued (up to [`MAX_BATCH`]),
//! then flushes the change coalescer. Outgoing `update` messages are sent as
//! each mutation happens and are never batched.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Frames that fail to decode, and messages naming unknown peers, are
//!   logged and dropped
//! - Response send failures are ignored (the caller went away)

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use winmesh_core::{PeerId, PeerRecord, PeerState, PeerTable, PeerView, ScreenTable, SerializedPeer};
use winmesh_protocol::{decode, encode, Message};

use super::commands::{RegistryChange, RegistryCommand, RegistryError};
use crate::host::{Host, HostSignal, OpenOptions};
use crate::medium::{Medium, MediumReceiver, MediumResult};
use crate::methods::MethodTable;
use crate::notify::{Coalescer, Listener, ListenerId};

/// Maximum number of events handled in one tick.
pub const MAX_BATCH: usize = 64;

/// Inputs the actor listens to.
pub struct ActorChannels {
    pub commands: mpsc::Receiver<RegistryCommand>,
    pub signals: mpsc::Receiver<HostSignal>,
    pub frames: MediumReceiver,
}

enum Event {
    Cancelled,
    Signal(HostSignal),
    Command(RegistryCommand),
    Frame(MediumResult<Bytes>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

// ============================================================================
// Peer Actor
// ============================================================================

/// The peer actor - owns the registry of known peers.
///
/// # Ownership
///
/// The actor owns:
/// - `peers`: the local record plus one mirror per known remote peer
/// - `methods`: the local method table, builtins included
/// - `notifier`: change listeners registered through the handle
/// - `peer_notifiers`: per-peer listeners, dropped with their peer
/// - `screens`: the latest reconciled screen table
pub struct PeerActor {
    commands: mpsc::Receiver<RegistryCommand>,
    signals: mpsc::Receiver<HostSignal>,
    frames: MediumReceiver,

    medium: Arc<dyn Medium>,
    host: Arc<dyn Host>,

    peers: PeerTable,
    methods: MethodTable,
    notifier: Coalescer<RegistryChange>,
    peer_notifiers: HashMap<PeerId, Coalescer<RegistryChange>>,
    screens: Option<ScreenTable>,

    /// Registry capacity, local peer included.
    max_peers: usize,

    /// Cancelled on teardown; the screen reconciler shares it.
    cancel: CancellationToken,

    /// Bumped on every flush that carried a change.
    changes: watch::Sender<u64>,
    dirty: bool,
}

impl PeerActor {
    pub fn new(
        peers: PeerTable,
        channels: ActorChannels,
        medium: Arc<dyn Medium>,
        host: Arc<dyn Host>,
        methods: MethodTable,
        max_peers: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            commands: channels.commands,
            signals: channels.signals,
            frames: channels.frames,
            medium,
            host,
            peers,
            methods,
            notifier: Coalescer::new(),
            peer_notifiers: HashMap::new(),
            screens: None,
            max_peers: max_peers.max(1),
            cancel,
            changes,
            dirty: false,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.peers.local_id()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Receiver for the change counter.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Runs the actor event loop.
    ///
    /// Stops on cancellation, on the host's terminate signal (after
    /// announcing `close`), or when the medium closes.
    pub async fn run(mut self) {
        info!(peer_id = %self.local_id(), "Peer actor starting");

        loop {
            let event = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => Event::Cancelled,
                Some(signal) = self.signals.recv() => Event::Signal(signal),
                Some(cmd) = self.commands.recv() => Event::Command(cmd),
                frame = self.frames.recv() => Event::Frame(frame),
            };

            if self.process_batch(event) == Flow::Stop {
                break;
            }
            self.flush_notifications();
        }

        info!(
            peer_id = %self.local_id(),
            total_peers = self.peers.len(),
            "Peer actor stopped"
        );
    }

    fn process_batch(&mut self, first: Event) -> Flow {
        let mut next = Some(first);
        let mut handled = 0;

        while let Some(event) = next.take() {
            if self.handle_event(event) == Flow::Stop {
                return Flow::Stop;
            }
            handled += 1;
            if handled >= MAX_BATCH {
                break;
            }
            next = self.try_next_event();
        }
        Flow::Continue
    }

    /// Next already-queued event, in the same priority order as `run`.
    fn try_next_event(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return Some(Event::Cancelled);
        }
        if let Ok(signal) = self.signals.try_recv() {
            return Some(Event::Signal(signal));
        }
        if let Ok(cmd) = self.commands.try_recv() {
            return Some(Event::Command(cmd));
        }
        match self.frames.try_recv() {
            Ok(Some(payload)) => Some(Event::Frame(Ok(payload))),
            Ok(None) => None,
            Err(e) => Some(Event::Frame(Err(e))),
        }
    }

    fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Cancelled => {
                info!(peer_id = %self.local_id(), "Peer cancelled, detaching");
                Flow::Stop
            }
            Event::Signal(signal) => self.handle_signal(signal),
            Event::Command(cmd) => {
                self.handle_command(cmd);
                Flow::Continue
            }
            Event::Frame(Ok(payload)) => {
                self.handle_frame(&payload);
                Flow::Continue
            }
            Event::Frame(Err(e)) => {
                warn!(peer_id = %self.local_id(), error = %e, "Medium closed, peer stopping");
                Flow::Stop
            }
        }
    }

    /// Delivers the pending change notifications, registry-wide first, then
    /// per peer.
    pub fn flush_notifications(&mut self) -> usize {
        if std::mem::take(&mut self.dirty) {
            self.changes.send_modify(|count| *count = count.wrapping_add(1));
        }
        let mut calls = self.notifier.flush();
        for notifier in self.peer_notifiers.values_mut() {
            calls += notifier.flush();
        }
        calls
    }

    fn notify(&mut self, change: RegistryChange) {
        self.dirty = true;
        self.notifier.trigger(change);
    }

    /// Schedules a notification for listeners of one peer's state.
    fn notify_peer(&mut self, peer_id: &PeerId) {
        if let Some(notifier) = self.peer_notifiers.get_mut(peer_id) {
            notifier.trigger(RegistryChange::Updated(peer_id.clone()));
        }
    }

    // ========================================================================
    // Host Signals
    // ========================================================================

    fn handle_signal(&mut self, signal: HostSignal) -> Flow {
        let result = match signal {
            HostSignal::AboutToTerminate => {
                self.teardown();
                return Flow::Stop;
            }
            HostSignal::VisibilityChanged(visible) => {
                self.mutate_if_changed(|state| &mut state.visible, visible)
            }
            HostSignal::FocusChanged(focused) => {
                self.mutate_if_changed(|state| &mut state.focused, focused)
            }
            HostSignal::FullscreenChanged(fullscreen) => {
                self.mutate_if_changed(|state| &mut state.fullscreen, fullscreen)
            }
        };

        if let Err(e) = result {
            warn!(peer_id = %self.local_id(), ?signal, error = %e, "Failed to propagate host signal");
        }
        Flow::Continue
    }

    fn mutate_if_changed(
        &mut self,
        field: impl Fn(&mut PeerState) -> &mut bool,
        value: bool,
    ) -> Result<(), RegistryError> {
        let mut current = self.peers.local()?.state().clone();
        if *field(&mut current) == value {
            return Ok(());
        }
        self.mutate_local(|state| *field(state) = value)
    }

    /// Announces `close` for the local peer and detaches everything.
    ///
    /// After this the actor handles nothing else: the caller breaks out of
    /// the loop and dropping the actor drops every listener.
    fn teardown(&mut self) {
        let local_id = self.local_id().clone();
        info!(peer_id = %local_id, "Host terminating, announcing close");

        if let Err(e) = self.broadcast(&Message::close(local_id.clone())) {
            warn!(peer_id = %local_id, error = %e, "Failed to announce close");
        }

        self.commands.close();
        self.signals.close();
        self.cancel.cancel();
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Dispatches a command to the appropriate handler.
    pub fn handle_command(&mut self, cmd: RegistryCommand) {
        trace!(command = cmd.name(), "Handling command");
        match cmd {
            RegistryCommand::GetPeers { respond_to } => {
                let _ = respond_to.send(self.peers.views());
            }
            RegistryCommand::GetPeer {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.peers.view(&peer_id));
            }
            RegistryCommand::GetOrphans { respond_to } => {
                let _ = respond_to.send(self.handle_get_orphans());
            }
            RegistryCommand::GetScreens { respond_to } => {
                let _ = respond_to.send(self.screens.clone());
            }
            RegistryCommand::Subscribe {
                listener,
                fire_immediately,
                respond_to,
            } => {
                let id = self.notifier.subscribe(listener, fire_immediately);
                debug!(listener = %id, fire_immediately, "Change listener subscribed");
                let _ = respond_to.send(id);
            }
            RegistryCommand::Unsubscribe { id, respond_to } => {
                let _ = respond_to.send(self.notifier.unsubscribe(id));
            }
            RegistryCommand::SubscribePeer {
                peer_id,
                listener,
                fire_immediately,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_subscribe_peer(peer_id, listener, fire_immediately));
            }
            RegistryCommand::UnsubscribePeer {
                peer_id,
                id,
                respond_to,
            } => {
                let removed = self
                    .peer_notifiers
                    .get_mut(&peer_id)
                    .is_some_and(|notifier| notifier.unsubscribe(id));
                let _ = respond_to.send(removed);
            }
            RegistryCommand::SetLocalState { patch, respond_to } => {
                let _ = respond_to.send(self.handle_set_local_state(patch));
            }
            RegistryCommand::OpenRelated {
                options,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_open_related(options));
            }
            RegistryCommand::Invoke {
                peer_id,
                name,
                args,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_invoke(peer_id, name, args));
            }
            RegistryCommand::ClosePeer {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_close_peer(peer_id));
            }
            RegistryCommand::ApplyScreens { table, respond_to } => {
                let _ = respond_to.send(self.handle_apply_screens(table));
            }
        }
    }

    fn handle_get_orphans(&self) -> Vec<PeerView> {
        self.peers
            .orphans()
            .into_iter()
            .filter_map(|record| self.peers.view(record.id()))
            .collect()
    }

    fn handle_subscribe_peer(
        &mut self,
        peer_id: PeerId,
        listener: Listener<RegistryChange>,
        fire_immediately: bool,
    ) -> Result<ListenerId, RegistryError> {
        if !self.peers.contains(&peer_id) {
            return Err(RegistryError::PeerNotFound(peer_id));
        }
        let id = self
            .peer_notifiers
            .entry(peer_id.clone())
            .or_default()
            .subscribe(listener, fire_immediately);
        debug!(peer_id = %peer_id, listener = %id, fire_immediately, "Peer listener subscribed");
        Ok(id)
    }

    fn handle_set_local_state(&mut self, patch: Value) -> Result<(), RegistryError> {
        self.mutate_local(|state| state.merge_user(patch))
    }

    fn handle_open_related(&mut self, options: OpenOptions) -> Result<(), RegistryError> {
        debug!(peer_id = %self.local_id(), popup = options.popup, "Opening related peer");
        self.host.open_related(self.peers.local_id(), options)?;
        Ok(())
    }

    /// Local calls run in place; remote calls become one `run` message.
    fn handle_invoke(
        &mut self,
        peer_id: PeerId,
        name: String,
        args: Vec<Value>,
    ) -> Result<(), RegistryError> {
        if self.peers.is_local(&peer_id) {
            debug!(method = %name, "Invoking local method");
            return Ok(self.methods.call(&name, &args)?);
        }
        if !self.peers.contains(&peer_id) {
            return Err(RegistryError::PeerNotFound(peer_id));
        }

        debug!(peer_id = %peer_id, method = %name, "Sending run");
        self.broadcast(&Message::run(peer_id, name, args))
    }

    fn handle_close_peer(&mut self, peer_id: PeerId) -> Result<(), RegistryError> {
        if self.peers.is_local(&peer_id) {
            info!(peer_id = %peer_id, "Closing local peer");
            self.host.terminate_self()?;
            return Ok(());
        }

        let record = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| RegistryError::PeerNotFound(peer_id.clone()))?;
        if !record.info().controlled {
            return Err(RegistryError::NotControlled(peer_id));
        }

        info!(peer_id = %peer_id, "Ordering peer to close");
        self.broadcast(&Message::order_close(peer_id))
    }

    /// Stores the table and points the local state at its current screen.
    fn handle_apply_screens(&mut self, table: Option<ScreenTable>) -> Result<(), RegistryError> {
        let current = table.as_ref().and_then(|table| table.current.clone());
        let table_changed = self.screens != table;
        self.screens = table;

        let local_screen = self.peers.local()?.state().screen_id.clone();
        if local_screen != current {
            debug!(
                peer_id = %self.local_id(),
                screen = ?current,
                "Current screen changed"
            );
            return self.mutate_local(|state| state.screen_id = current);
        }
        if table_changed {
            let local_id = self.local_id().clone();
            self.notify(RegistryChange::Updated(local_id));
        }
        Ok(())
    }

    // ========================================================================
    // Local Propagation
    // ========================================================================

    /// Edits the local state, sends one `update`, then schedules a change
    /// notification.
    ///
    /// The edit is committed only once its `update` encodes; a rejected edit
    /// leaves the local state untouched.
    fn mutate_local(&mut self, edit: impl FnOnce(&mut PeerState)) -> Result<(), RegistryError> {
        let local = self.peers.local()?;
        let local_id = local.id().clone();
        let mut state = local.state().clone();
        edit(&mut state);

        let message = Message::update(local_id.clone(), state.clone());
        let frame = encode(&message)?;
        self.peers.local_mut()?.replace_state(state);

        let sent = self.send_frame(&message, frame);
        self.notify_peer(&local_id);
        self.notify(RegistryChange::Updated(local_id));
        sent
    }

    fn broadcast(&self, message: &Message) -> Result<(), RegistryError> {
        let frame = encode(message)?;
        self.send_frame(message, frame)
    }

    fn send_frame(&self, message: &Message, frame: Vec<u8>) -> Result<(), RegistryError> {
        self.medium.send(Bytes::from(frame))?;
        trace!(kind = message.kind(), subject = %message.subject(), "Message sent");
        Ok(())
    }

    fn local_node(&self) -> Option<SerializedPeer> {
        self.peers.local().ok().map(PeerRecord::serialize)
    }

    // ========================================================================
    // Medium Messages
    // ========================================================================

    fn handle_frame(&mut self, payload: &[u8]) {
        match decode(payload) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!(peer_id = %self.local_id(), error = %e, "Dropping undecodable frame");
            }
        }
    }

    /// Applies one protocol message.
    pub fn handle_message(&mut self, message: Message) {
        trace!(kind = message.kind(), subject = %message.subject(), "Message received");
        match message {
            Message::Declare { node } => self.handle_declare(node),
            Message::Info { node } => self.handle_info(node),
            Message::Close { id } => self.handle_close(id),
            Message::OrderClose { id } => self.handle_order_close(id),
            Message::Update { id, data } => self.handle_update(id, data),
            Message::Run { id, name, args } => self.handle_run(id, name, args),
        }
    }

    /// Inserts the declaring peer and always answers with `info`.
    fn handle_declare(&mut self, node: SerializedPeer) {
        if self.peers.is_local(&node.id) {
            warn!(peer_id = %node.id, "Declare carries the local identity, ignoring");
            return;
        }

        let peer_id = node.id.clone();
        if self.peers.contains(&peer_id) {
            debug!(peer_id = %peer_id, "Duplicate declare, keeping existing record");
            self.notify(RegistryChange::Updated(peer_id));
        } else if self.insert_remote(node) {
            self.notify(RegistryChange::Joined(peer_id));
        }

        match self.local_node() {
            Some(local) => {
                if let Err(e) = self.broadcast(&Message::info(local)) {
                    warn!(error = %e, "Failed to reply to declare");
                }
            }
            None => warn!("Local record missing, cannot reply to declare"),
        }
    }

    /// Inserts an unknown peer. Known peers are left alone without a reply.
    fn handle_info(&mut self, node: SerializedPeer) {
        if self.peers.is_local(&node.id) {
            warn!(peer_id = %node.id, "Info carries the local identity, ignoring");
            return;
        }
        if self.peers.contains(&node.id) {
            trace!(peer_id = %node.id, "Info for known peer, ignoring");
            return;
        }

        let peer_id = node.id.clone();
        if self.insert_remote(node) {
            self.notify(RegistryChange::Joined(peer_id));
        }
    }

    fn insert_remote(&mut self, node: SerializedPeer) -> bool {
        if self.peers.len() >= self.max_peers {
            warn!(
                peer_id = %node.id,
                current = self.peers.len(),
                max = self.max_peers,
                "Registry is full, ignoring peer"
            );
            return false;
        }

        let peer_id = node.id.clone();
        match self.peers.insert_remote(PeerRecord::remote(node)) {
            Ok(()) => {
                info!(
                    peer_id = %peer_id,
                    total_peers = self.peers.len(),
                    "Peer joined"
                );
                true
            }
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Peer not inserted");
                false
            }
        }
    }

    /// Forgets a peer, clearing the local parent if it was that peer.
    ///
    /// The cleared parent is not re-broadcast; the next local mutation
    /// carries it.
    fn handle_close(&mut self, peer_id: PeerId) {
        let parent_closed = self
            .peers
            .local()
            .is_ok_and(|local| local.state().parent_id.as_ref() == Some(&peer_id));
        if parent_closed {
            if let Ok(local) = self.peers.local_mut() {
                local.edit_state(|state| state.parent_id = None);
                info!(parent_id = %peer_id, "Parent closed, local parent cleared");
            }
        }

        if self.peers.is_local(&peer_id) {
            warn!(peer_id = %peer_id, "Close names the local identity, ignoring");
        } else {
            match self.peers.remove(&peer_id) {
                Ok(_) => {
                    self.peer_notifiers.remove(&peer_id);
                    info!(
                        peer_id = %peer_id,
                        total_peers = self.peers.len(),
                        "Peer left"
                    );
                }
                Err(e) => debug!(peer_id = %peer_id, error = %e, "Close for unknown peer"),
            }
        }

        self.notify(RegistryChange::Left(peer_id));
    }

    fn handle_order_close(&mut self, peer_id: PeerId) {
        if !self.peers.is_local(&peer_id) {
            return;
        }
        info!(peer_id = %peer_id, "Ordered to close");
        if let Err(e) = self.host.terminate_self() {
            warn!(peer_id = %peer_id, error = %e, "Host refused to terminate");
        }
    }

    /// Replaces a mirror's state wholesale. Unknown peers are not synthesized.
    fn handle_update(&mut self, peer_id: PeerId, state: PeerState) {
        if self.peers.is_local(&peer_id) {
            warn!(peer_id = %peer_id, "Remote update for the local peer, ignoring");
            return;
        }
        match self.peers.get_mut(&peer_id) {
            Some(record) => {
                record.replace_state(state);
                debug!(peer_id = %peer_id, "Peer state replaced");
                self.notify_peer(&peer_id);
                self.notify(RegistryChange::Updated(peer_id));
            }
            None => debug!(peer_id = %peer_id, "Update for unknown peer, ignoring"),
        }
    }

    fn handle_run(&mut self, peer_id: PeerId, name: String, args: Vec<Value>) {
        if !self.peers.is_local(&peer_id) {
            return;
        }
        debug!(method = %name, "Running method on request");
        if let Err(e) = self.methods.call(&name, &args) {
            warn!(method = %name, error = %e, "Method call failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostError, HostSnapshot};
    use crate::medium::{Frame, MediumReceiver};
    use crate::methods::MethodError;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{broadcast, oneshot};
    use winmesh_core::{PeerInfo, ScreenDescriptor};

    /// Medium that records everything sent through it.
    struct RecordingMedium {
        sent: Mutex<Vec<Bytes>>,
        bus: broadcast::Sender<Frame>,
    }

    impl RecordingMedium {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                bus: broadcast::channel(16).0,
            }
        }

        fn take(&self) -> Vec<Message> {
            self.sent
                .lock()
                .drain(..)
                .map(|frame| decode(&frame).unwrap())
                .collect()
        }
    }

    impl Medium for RecordingMedium {
        fn send(&self, payload: Bytes) -> MediumResult<()> {
            self.sent.lock().push(payload);
            Ok(())
        }

        fn subscribe(&self) -> MediumReceiver {
            MediumReceiver::new(u64::MAX, self.bus.subscribe())
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        terminations: AtomicUsize,
        opened: Mutex<Vec<(PeerId, OpenOptions)>>,
    }

    impl Host for RecordingHost {
        fn snapshot(&self) -> HostSnapshot {
            HostSnapshot::default()
        }

        fn terminate_self(&self) -> Result<(), HostError> {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn open_related(&self, opener: &PeerId, options: OpenOptions) -> Result<(), HostError> {
            self.opened.lock().push((opener.clone(), options));
            Ok(())
        }
    }

    struct Harness {
        actor: PeerActor,
        medium: Arc<RecordingMedium>,
        host: Arc<RecordingHost>,
        _commands: mpsc::Sender<RegistryCommand>,
        signals: mpsc::Sender<HostSignal>,
    }

    fn create_actor(local: &str, parent: Option<&str>) -> Harness {
        create_actor_with(local, parent, MethodTable::new(), 16)
    }

    fn create_actor_with(
        local: &str,
        parent: Option<&str>,
        methods: MethodTable,
        max_peers: usize,
    ) -> Harness {
        let state = PeerState {
            parent_id: parent.map(PeerId::new),
            visible: true,
            ..Default::default()
        };
        let record = PeerRecord::local(PeerId::new(local), PeerInfo::new(parent.is_some(), false), state);
        let peers = PeerTable::new(record).unwrap();

        let medium = Arc::new(RecordingMedium::new());
        let host = Arc::new(RecordingHost::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let channels = ActorChannels {
            commands: cmd_rx,
            signals: signal_rx,
            frames: medium.subscribe(),
        };

        let actor = PeerActor::new(
            peers,
            channels,
            medium.clone(),
            host.clone(),
            methods,
            max_peers,
            CancellationToken::new(),
        );
        Harness {
            actor,
            medium,
            host,
            _commands: cmd_tx,
            signals: signal_tx,
        }
    }

    fn node(id: &str, parent: Option<&str>, controlled: bool) -> SerializedPeer {
        SerializedPeer {
            id: PeerId::new(id),
            data: PeerState {
                parent_id: parent.map(PeerId::new),
                ..Default::default()
            },
            info: PeerInfo::new(controlled, false),
        }
    }

    fn count_notifications(actor: &mut PeerActor) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        actor.notifier.subscribe(
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        calls
    }

    #[test]
    fn test_declare_inserts_and_replies_with_info() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::declare(node("b", Some("a"), true)));

        assert_eq!(h.actor.peer_count(), 2);
        let sent = h.medium.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::Info { node } => assert_eq!(node.id.as_str(), "a"),
            other => panic!("expected info, got {other:?}"),
        }
        assert!(h.actor.notifier.is_pending());
    }

    #[test]
    fn test_duplicate_declare_still_replies() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::declare(node("b", None, false)));
        h.actor.handle_message(Message::declare(node("b", None, false)));

        assert_eq!(h.actor.peer_count(), 2);
        assert_eq!(h.medium.take().len(), 2);
    }

    #[test]
    fn test_info_is_idempotent() {
        let mut h = create_actor("a", None);
        let calls = count_notifications(&mut h.actor);

        h.actor.handle_message(Message::info(node("b", None, false)));
        h.actor.flush_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.actor.handle_message(Message::info(node("b", None, false)));
        h.actor.flush_notifications();

        assert_eq!(h.actor.peer_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Info is never answered
        assert!(h.medium.take().is_empty());
    }

    #[test]
    fn test_update_replaces_whole_state() {
        let mut h = create_actor("a", None);
        let mut peer = node("b", None, false);
        peer.data.user = json!({"title": "draft", "dirty": true});
        h.actor.handle_message(Message::info(peer));

        let replacement = PeerState {
            user: json!({"title": "final"}),
            focused: true,
            ..Default::default()
        };
        h.actor
            .handle_message(Message::update(PeerId::new("b"), replacement.clone()));

        let view = h.actor.peers.view(&PeerId::new("b")).unwrap();
        assert_eq!(view.state, replacement);
        assert_eq!(view.update_count, 1);
    }

    #[test]
    fn test_update_for_unknown_peer_is_ignored() {
        let mut h = create_actor("a", None);
        h.actor
            .handle_message(Message::update(PeerId::new("ghost"), PeerState::default()));
        assert_eq!(h.actor.peer_count(), 1);
        assert!(!h.actor.notifier.is_pending());
    }

    #[test]
    fn test_close_of_parent_clears_local_parent() {
        let mut h = create_actor("b", Some("a"));
        h.actor.handle_message(Message::info(node("a", None, false)));
        h.actor.flush_notifications();

        h.actor.handle_message(Message::close(PeerId::new("a")));

        let local = h.actor.peers.local().unwrap();
        assert_eq!(local.state().parent_id, None);
        assert_eq!(h.actor.peer_count(), 1);
        assert!(h.actor.notifier.is_pending());
        // Clearing the parent is not broadcast
        assert!(h.medium.take().is_empty());
    }

    #[test]
    fn test_close_for_unknown_peer_is_tolerated() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::close(PeerId::new("ghost")));
        assert_eq!(h.actor.peer_count(), 1);
    }

    #[test]
    fn test_local_peer_is_permanent() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::close(PeerId::new("a")));
        h.actor.handle_message(Message::declare(node("a", None, false)));
        h.actor
            .handle_message(Message::update(PeerId::new("a"), PeerState::default()));

        let local = h.actor.peers.local().unwrap();
        assert!(local.is_local());
        assert!(local.state().visible);
        assert_eq!(h.actor.peer_count(), 1);
    }

    #[test]
    fn test_order_close_only_reaches_addressee() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::order_close(PeerId::new("b")));
        assert_eq!(h.host.terminations.load(Ordering::SeqCst), 0);

        h.actor.handle_message(Message::order_close(PeerId::new("a")));
        assert_eq!(h.host.terminations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_invoke_short_circuits() {
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        let methods = MethodTable::new().with("ping", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut h = create_actor_with("a", None, methods, 16);
        h.actor.handle_message(Message::info(node("b", None, false)));

        h.actor
            .handle_invoke(PeerId::new("a"), "ping".into(), vec![])
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(h.medium.take().is_empty());

        h.actor
            .handle_invoke(PeerId::new("b"), "ping".into(), vec![json!(1)])
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.medium.take(),
            vec![Message::run(PeerId::new("b"), "ping", vec![json!(1)])]
        );
    }

    #[test]
    fn test_invoke_errors() {
        let mut h = create_actor("a", None);
        assert_eq!(
            h.actor
                .handle_invoke(PeerId::new("ghost"), "ping".into(), vec![]),
            Err(RegistryError::PeerNotFound(PeerId::new("ghost")))
        );
        assert_eq!(
            h.actor.handle_invoke(PeerId::new("a"), "ping".into(), vec![]),
            Err(RegistryError::Method(MethodError::NotFound("ping".into())))
        );
    }

    #[test]
    fn test_run_for_other_peer_is_ignored() {
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        let methods = MethodTable::new().with("ping", move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut h = create_actor_with("a", None, methods, 16);

        h.actor
            .handle_message(Message::run(PeerId::new("b"), "ping", vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        h.actor
            .handle_message(Message::run(PeerId::new("a"), "ping", vec![]));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Unknown method is logged, not fatal
        h.actor
            .handle_message(Message::run(PeerId::new("a"), "missing", vec![]));
    }

    #[test]
    fn test_mutations_are_propagated_individually() {
        let mut h = create_actor("a", None);
        let calls = count_notifications(&mut h.actor);

        for step in 0..3 {
            h.actor
                .handle_set_local_state(json!({ "step": step }))
                .unwrap();
        }

        let sent = h.medium.take();
        assert_eq!(sent.len(), 3);
        for (step, message) in sent.iter().enumerate() {
            match message {
                Message::Update { id, data } => {
                    assert_eq!(id.as_str(), "a");
                    assert_eq!(data.user["step"], json!(step));
                }
                other => panic!("expected update, got {other:?}"),
            }
        }

        assert_eq!(h.actor.flush_notifications(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_local_state_merges_keys() {
        let mut h = create_actor("a", None);
        h.actor.handle_set_local_state(json!({"x": 1})).unwrap();
        h.actor.handle_set_local_state(json!({"y": 2})).unwrap();

        let local = h.actor.peers.local().unwrap();
        assert_eq!(local.state().user, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_close_peer_rules() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::info(node("free", None, false)));
        h.actor
            .handle_message(Message::info(node("child", Some("a"), true)));
        h.medium.take();

        assert_eq!(
            h.actor.handle_close_peer(PeerId::new("free")),
            Err(RegistryError::NotControlled(PeerId::new("free")))
        );
        assert_eq!(
            h.actor.handle_close_peer(PeerId::new("ghost")),
            Err(RegistryError::PeerNotFound(PeerId::new("ghost")))
        );

        h.actor.handle_close_peer(PeerId::new("child")).unwrap();
        assert_eq!(
            h.medium.take(),
            vec![Message::order_close(PeerId::new("child"))]
        );

        h.actor.handle_close_peer(PeerId::new("a")).unwrap();
        assert_eq!(h.host.terminations.load(Ordering::SeqCst), 1);
        assert!(h.medium.take().is_empty());
    }

    #[test]
    fn test_open_related_passes_local_opener() {
        let mut h = create_actor("a", None);
        h.actor
            .handle_open_related(OpenOptions { popup: true })
            .unwrap();
        let opened = h.host.opened.lock();
        assert_eq!(opened.as_slice(), &[(PeerId::new("a"), OpenOptions { popup: true })]);
    }

    #[test]
    fn test_host_signals_propagate_changes_only() {
        let mut h = create_actor("a", None);

        // Already visible
        h.actor.handle_signal(HostSignal::VisibilityChanged(true));
        assert!(h.medium.take().is_empty());

        h.actor.handle_signal(HostSignal::FocusChanged(true));
        h.actor.handle_signal(HostSignal::FullscreenChanged(true));
        let sent = h.medium.take();
        assert_eq!(sent.len(), 2);

        let state = h.actor.peers.local().unwrap().state().clone();
        assert!(state.focused);
        assert!(state.fullscreen);
    }

    #[test]
    fn test_teardown_announces_close_and_stops() {
        let mut h = create_actor("a", None);
        let calls = count_notifications(&mut h.actor);
        h.actor.handle_set_local_state(json!({"x": 1})).unwrap();
        h.medium.take();

        assert_eq!(h.actor.handle_signal(HostSignal::AboutToTerminate), Flow::Stop);
        assert_eq!(h.medium.take(), vec![Message::close(PeerId::new("a"))]);
        assert!(h.actor.cancel.is_cancelled());
        assert!(h.signals.try_send(HostSignal::FocusChanged(true)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_capacity_limits_remote_peers() {
        let mut h = create_actor_with("a", None, MethodTable::new(), 2);
        h.actor.handle_message(Message::info(node("b", None, false)));
        h.actor.handle_message(Message::declare(node("c", None, false)));

        assert_eq!(h.actor.peer_count(), 2);
        // Declare is still answered
        assert_eq!(h.medium.take().len(), 1);
    }

    #[test]
    fn test_orphans_include_dangling_parents() {
        let mut h = create_actor("a", None);
        h.actor
            .handle_message(Message::info(node("b", Some("a"), true)));
        h.actor
            .handle_message(Message::info(node("c", Some("gone"), true)));

        let orphans: Vec<String> = h
            .actor
            .handle_get_orphans()
            .into_iter()
            .map(|view| view.id.to_string())
            .collect();
        assert_eq!(orphans, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_apply_screens_tracks_current_screen() {
        let mut h = create_actor("a", None);
        let screens = vec![
            ScreenDescriptor {
                width: 1920,
                height: 1080,
                is_internal: true,
                color_depth: 24,
                device_pixel_ratio: 2.0,
                ..Default::default()
            },
            ScreenDescriptor {
                width: 2560,
                height: 1440,
                color_depth: 30,
                device_pixel_ratio: 1.0,
                left: 1920,
                ..Default::default()
            },
        ];
        let table = ScreenTable::reconcile(&screens, Some(1));
        let expected = table.current.clone();

        h.actor.handle_apply_screens(Some(table.clone())).unwrap();
        assert_eq!(h.actor.peers.local().unwrap().state().screen_id, expected);
        assert_eq!(h.medium.take().len(), 1);

        // Same table again: nothing to propagate
        h.actor.handle_apply_screens(Some(table)).unwrap();
        assert!(h.medium.take().is_empty());

        h.actor.handle_apply_screens(None).unwrap();
        assert_eq!(h.actor.peers.local().unwrap().state().screen_id, None);
        assert_eq!(h.medium.take().len(), 1);
    }

    #[test]
    fn test_undecodable_frame_is_dropped() {
        let mut h = create_actor("a", None);
        h.actor.handle_frame(b"not json");
        h.actor.handle_frame(br#"{"type":"teleport","id":"a"}"#);
        assert_eq!(h.actor.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_command_fires_on_next_tick() {
        let mut h = create_actor("a", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let (tx, rx) = oneshot::channel();

        h.actor.handle_command(RegistryCommand::Subscribe {
            listener: Box::new(move |change| {
                assert!(change.is_none());
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            fire_immediately: true,
            respond_to: tx,
        });
        rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.actor.flush_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_close() {
        let h = create_actor("a", None);
        let cancel = h.actor.cancel.clone();
        let medium = h.medium.clone();

        let task = tokio::spawn(h.actor.run());
        cancel.cancel();
        task.await.unwrap();

        assert!(medium.take().is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_handles_terminate_signal() {
        let h = create_actor("a", None);
        let medium = h.medium.clone();
        let signals = h.signals.clone();

        let task = tokio::spawn(h.actor.run());
        signals.send(HostSignal::AboutToTerminate).await.unwrap();
        task.await.unwrap();

        assert_eq!(medium.take(), vec![Message::close(PeerId::new("a"))]);
    }

    type Calls = Arc<Mutex<Vec<Option<RegistryChange>>>>;

    fn record_peer(actor: &mut PeerActor, id: &str, fire_immediately: bool) -> Calls {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        actor
            .handle_subscribe_peer(
                PeerId::new(id),
                Box::new(move |change: Option<&RegistryChange>| sink.lock().push(change.cloned())),
                fire_immediately,
            )
            .unwrap();
        calls
    }

    #[test]
    fn test_rejected_mutation_leaves_state_untouched() {
        let mut h = create_actor("a", None);
        h.actor.handle_set_local_state(json!({"title": "ok"})).unwrap();
        h.actor.flush_notifications();
        h.medium.take();
        let before = h.actor.peers.local().unwrap().state().clone();
        let count = h.actor.peers.local().unwrap().infra().update_count;

        let oversized = json!({"blob": "x".repeat(winmesh_protocol::MAX_FRAME_SIZE)});
        let err = h.actor.handle_set_local_state(oversized).unwrap_err();
        assert!(matches!(err, RegistryError::Protocol(_)));

        let local = h.actor.peers.local().unwrap();
        assert_eq!(local.state(), &before);
        assert_eq!(local.infra().update_count, count);
        assert!(h.medium.take().is_empty());
        assert!(!h.actor.notifier.is_pending());

        // Later mutations still propagate
        h.actor.handle_set_local_state(json!({"small": 1})).unwrap();
        h.actor.handle_signal(HostSignal::FocusChanged(true));
        let sent = h.medium.take();
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            Message::Update { data, .. } => {
                assert_eq!(data.user, json!({"title": "ok", "small": 1}));
                assert!(data.focused);
            }
            other => panic!("expected update, got {other:?}"),
        }

        // And declares are still answered
        h.actor.handle_message(Message::declare(node("b", None, false)));
        assert_eq!(h.medium.take().len(), 1);
    }

    #[test]
    fn test_peer_listeners_fire_for_each_changed_peer() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::info(node("b", None, false)));
        h.actor.handle_message(Message::info(node("c", None, false)));
        h.actor.flush_notifications();

        let a_calls = record_peer(&mut h.actor, "a", false);
        let b_calls = record_peer(&mut h.actor, "b", false);
        let c_calls = record_peer(&mut h.actor, "c", false);

        // Three peers change within one tick
        h.actor
            .handle_message(Message::update(PeerId::new("b"), PeerState::default()));
        h.actor
            .handle_message(Message::update(PeerId::new("c"), PeerState::default()));
        h.actor
            .handle_message(Message::update(PeerId::new("c"), PeerState::default()));
        h.actor.handle_set_local_state(json!({"x": 1})).unwrap();
        h.actor.flush_notifications();

        assert_eq!(*b_calls.lock(), vec![Some(RegistryChange::Updated(PeerId::new("b")))]);
        assert_eq!(*c_calls.lock(), vec![Some(RegistryChange::Updated(PeerId::new("c")))]);
        assert_eq!(*a_calls.lock(), vec![Some(RegistryChange::Updated(PeerId::new("a")))]);

        // A tick without changes to b leaves its listener alone
        h.actor
            .handle_message(Message::update(PeerId::new("c"), PeerState::default()));
        h.actor.flush_notifications();
        assert_eq!(b_calls.lock().len(), 1);
        assert_eq!(c_calls.lock().len(), 2);
    }

    #[test]
    fn test_peer_listeners_dropped_when_peer_leaves() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::info(node("b", None, false)));
        let calls = record_peer(&mut h.actor, "b", true);
        h.actor.flush_notifications();
        assert_eq!(*calls.lock(), vec![None]);

        h.actor.handle_message(Message::close(PeerId::new("b")));
        assert!(!h.actor.peer_notifiers.contains_key(&PeerId::new("b")));

        // A returning peer starts without listeners
        h.actor.handle_message(Message::info(node("b", None, false)));
        h.actor
            .handle_message(Message::update(PeerId::new("b"), PeerState::default()));
        h.actor.flush_notifications();
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_subscription_commands() {
        let mut h = create_actor("a", None);
        h.actor.handle_message(Message::info(node("b", None, false)));

        let (tx, rx) = oneshot::channel();
        h.actor.handle_command(RegistryCommand::SubscribePeer {
            peer_id: PeerId::new("ghost"),
            listener: Box::new(|_| {}),
            fire_immediately: false,
            respond_to: tx,
        });
        assert_eq!(
            rx.await.unwrap(),
            Err(RegistryError::PeerNotFound(PeerId::new("ghost")))
        );

        let (tx, rx) = oneshot::channel();
        h.actor.handle_command(RegistryCommand::SubscribePeer {
            peer_id: PeerId::new("b"),
            listener: Box::new(|_| {}),
            fire_immediately: false,
            respond_to: tx,
        });
        let id = rx.await.unwrap().unwrap();

        for expected in [true, false] {
            let (tx, rx) = oneshot::channel();
            h.actor.handle_command(RegistryCommand::UnsubscribePeer {
                peer_id: PeerId::new("b"),
                id,
                respond_to: tx,
            });
            assert_eq!(rx.await.unwrap(), expected);
        }
    }
}
