//! Screen reconciler.
//!
//! Watches the host's screen subsystem and keeps the local peer's
//! `screen_id` pointed at the screen the window is currently on. Screen
//! descriptors are volatile, so every refresh rebuilds the whole
//! [`ScreenTable`] from scratch and lets the registry decide whether the
//! local state actually changed.
//!
//! An unsupported subsystem or a denied permission silently disables screen
//! tracking; nothing is reported to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use winmesh_core::{ScreenDescriptor, ScreenTable};

use crate::registry::{PeerHandle, RegistryError};

/// State of the screen-placement permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Prompt,
}

/// Result of one enumeration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScreenDetails {
    pub screens: Vec<ScreenDescriptor>,
    /// Index into `screens` of the screen the window is on.
    pub current: Option<usize>,
}

/// Change notifications from the screen subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenEvent {
    ScreensChanged,
    CurrentScreenChanged,
    PermissionChanged(Permission),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScreenError {
    #[error("screen enumeration is not supported")]
    Unsupported,
    #[error("screen permission denied")]
    PermissionDenied,
    #[error("screen enumeration failed: {0}")]
    Enumeration(String),
}

/// The host's screen subsystem.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    async fn query_permission(&self) -> Result<Permission, ScreenError>;

    async fn enumerate(&self) -> Result<ScreenDetails, ScreenError>;

    /// Starts receiving change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ScreenEvent>;
}

/// Drives screen tracking for one peer until cancelled.
pub struct ScreenReconciler<S: ScreenSource + ?Sized> {
    source: Arc<S>,
    handle: PeerHandle,
    cancel: CancellationToken,
    permission: Permission,
}

impl<S: ScreenSource + ?Sized> ScreenReconciler<S> {
    pub fn new(source: Arc<S>, handle: PeerHandle, cancel: CancellationToken) -> Self {
        Self {
            source,
            handle,
            cancel,
            permission: Permission::Prompt,
        }
    }

    /// Runs the reconciler loop.
    ///
    /// Subscribes to change notifications before the first permission query
    /// so no change between the two is missed.
    pub async fn run(mut self) {
        let mut events = self.source.subscribe();

        self.permission = match self.source.query_permission().await {
            Ok(permission) => permission,
            Err(ScreenError::Unsupported) => {
                debug!("Screen subsystem unsupported, screen tracking disabled");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Screen permission query failed, screen tracking disabled");
                return;
            }
        };
        info!(permission = ?self.permission, "Screen reconciler starting");

        if !self.refresh().await {
            return;
        }

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!("Screen reconciler cancelled");
                    break;
                }

                event = events.recv() => match event {
                    Ok(ScreenEvent::PermissionChanged(permission)) => {
                        debug!(?permission, "Screen permission changed");
                        self.permission = permission;
                        if !self.refresh().await {
                            break;
                        }
                    }
                    Ok(event) => {
                        debug!(?event, "Screen layout changed");
                        if !self.refresh().await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Screen events lagged, refreshing");
                        if !self.refresh().await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Screen subsystem closed its event stream");
                        break;
                    }
                },
            }
        }
    }

    /// Re-enumerates and pushes the result to the registry.
    ///
    /// Returns false once the registry is gone. Any other failure is logged
    /// and the next screen event is reconciled as usual.
    async fn refresh(&self) -> bool {
        let table = match self.permission {
            Permission::Granted => match self.source.enumerate().await {
                Ok(details) => Some(ScreenTable::reconcile(&details.screens, details.current)),
                Err(e) => {
                    warn!(error = %e, "Screen enumeration failed");
                    None
                }
            },
            Permission::Denied | Permission::Prompt => None,
        };

        match self.handle.apply_screens(table).await {
            Ok(()) => true,
            Err(RegistryError::ChannelClosed) => {
                debug!("Registry gone, screen reconciler stopping");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply screen table");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryCommand;
    use crate::sim::SimulatedScreens;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio::time::timeout;
    use winmesh_core::PeerId;

    fn screens() -> Vec<ScreenDescriptor> {
        vec![
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
        ]
    }

    /// A handle whose commands land in the returned receiver instead of an actor.
    fn detached_handle() -> (PeerHandle, mpsc::Receiver<RegistryCommand>, watch::Sender<u64>) {
        let (tx, rx) = mpsc::channel(8);
        let (changes_tx, changes_rx) = watch::channel(0);
        (PeerHandle::new(PeerId::new("a"), tx, changes_rx), rx, changes_tx)
    }

    type Reply = oneshot::Sender<Result<(), RegistryError>>;

    async fn next_apply(rx: &mut mpsc::Receiver<RegistryCommand>) -> (Option<ScreenTable>, Reply) {
        let cmd = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("reconciler should apply within timeout")
            .expect("reconciler still running");
        match cmd {
            RegistryCommand::ApplyScreens { table, respond_to } => (table, respond_to),
            other => panic!("expected apply_screens, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_reconciling() {
        let source = Arc::new(SimulatedScreens::new(screens(), Some(0)));
        let (handle, mut rx, _changes) = detached_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ScreenReconciler::new(source.clone(), handle, cancel.clone()).run());

        let (table, reply) = next_apply(&mut rx).await;
        assert_eq!(table.unwrap().current, Some(screens()[0].compute_id()));
        reply
            .send(Err(RegistryError::Protocol("frame too large".into())))
            .unwrap();

        source.set_current(Some(1));
        let (table, reply) = next_apply(&mut rx).await;
        assert_eq!(table.unwrap().current, Some(screens()[1].compute_id()));
        reply.send(Ok(())).unwrap();

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_registry_stops_reconciler() {
        let source = Arc::new(SimulatedScreens::new(screens(), Some(0)));
        let (handle, mut rx, _changes) = detached_handle();
        let task = tokio::spawn(
            ScreenReconciler::new(source.clone(), handle, CancellationToken::new()).run(),
        );

        let (_table, reply) = next_apply(&mut rx).await;
        drop(reply);

        timeout(Duration::from_secs(1), task)
            .await
            .expect("reconciler should stop once the registry is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_denied_permission_applies_no_table() {
        let source = Arc::new(SimulatedScreens::new(screens(), Some(0)));
        source.set_permission(Permission::Denied);
        let (handle, mut rx, _changes) = detached_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ScreenReconciler::new(source.clone(), handle, cancel.clone()).run());

        let (table, reply) = next_apply(&mut rx).await;
        assert!(table.is_none());
        reply.send(Ok(())).unwrap();

        source.set_permission(Permission::Granted);
        let (table, reply) = next_apply(&mut rx).await;
        assert_eq!(table.unwrap().len(), 2);
        reply.send(Ok(())).unwrap();

        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
