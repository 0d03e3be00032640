//! Broadcast medium abstraction.
//!
//! The medium delivers every frame to every other live endpoint on the same
//! channel, at most once, and never back to the sender. Ordering is only
//! assumed per sender.
//!
//! [`LocalBus`] is an in-process medium built on `tokio::sync::broadcast`,
//! used by the simulation and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

/// Frames buffered per channel before slow receivers start lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Identifies one endpoint attached to a medium.
pub type EndpointId = u64;

/// A payload tagged with the endpoint that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub origin: EndpointId,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum MediumError {
    #[error("medium channel closed")]
    Closed,
    #[error("medium transport error: {0}")]
    Transport(String),
}

pub type MediumResult<T> = Result<T, MediumError>;

/// One endpoint's view of a broadcast medium.
pub trait Medium: Send + Sync {
    /// Sends a frame to every other endpoint on the channel.
    ///
    /// Having nobody listening is not an error.
    fn send(&self, payload: Bytes) -> MediumResult<()>;

    /// Starts receiving frames sent by other endpoints from now on.
    fn subscribe(&self) -> MediumReceiver;
}

/// Receiving half of an endpoint. Skips the endpoint's own frames.
#[derive(Debug)]
pub struct MediumReceiver {
    origin: EndpointId,
    inner: broadcast::Receiver<Frame>,
}

impl MediumReceiver {
    pub fn new(origin: EndpointId, inner: broadcast::Receiver<Frame>) -> Self {
        Self { origin, inner }
    }

    /// Waits for the next frame from another endpoint.
    ///
    /// Frames lost to lagging are logged and skipped; the medium is
    /// best-effort.
    pub async fn recv(&mut self) -> MediumResult<Bytes> {
        loop {
            match self.inner.recv().await {
                Ok(frame) if frame.origin == self.origin => continue,
                Ok(frame) => return Ok(frame.payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(endpoint = self.origin, skipped, "Medium receiver lagged, frames dropped");
                }
                Err(RecvError::Closed) => return Err(MediumError::Closed),
            }
        }
    }

    /// Returns the next already-delivered frame, if any.
    pub fn try_recv(&mut self) -> MediumResult<Option<Bytes>> {
        loop {
            match self.inner.try_recv() {
                Ok(frame) if frame.origin == self.origin => continue,
                Ok(frame) => return Ok(Some(frame.payload)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(endpoint = self.origin, skipped, "Medium receiver lagged, frames dropped");
                }
                Err(TryRecvError::Closed) => return Err(MediumError::Closed),
            }
        }
    }
}

// ============================================================================
// In-process bus
// ============================================================================

/// In-process broadcast medium with named channels.
#[derive(Debug)]
pub struct LocalBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Frame>>>,
    next_endpoint: AtomicU64,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_endpoint: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Frame> {
        if let Some(sender) = self.channels.read().get(channel) {
            return sender.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Attaches a new endpoint to `channel`.
    pub fn endpoint(&self, channel: &str) -> LocalEndpoint {
        LocalEndpoint {
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            channel: channel.to_string(),
            sender: self.sender_for(channel),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`LocalBus`] channel.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    id: EndpointId,
    channel: String,
    sender: broadcast::Sender<Frame>,
}

impl LocalEndpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Medium for LocalEndpoint {
    fn send(&self, payload: Bytes) -> MediumResult<()> {
        let bytes = payload.len();
        if self
            .sender
            .send(Frame {
                origin: self.id,
                payload,
            })
            .is_err()
        {
            trace!(channel = %self.channel, "No receivers on channel, frame dropped");
        } else {
            trace!(channel = %self.channel, bytes, "Frame sent");
        }
        Ok(())
    }

    fn subscribe(&self) -> MediumReceiver {
        MediumReceiver::new(self.id, self.sender.subscribe())
    }
}
