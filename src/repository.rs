//! Single source of truth for the fused view.
//!
//! The repository holds the most recent device fix and the most recent
//! exported peer snapshot. Each mutator replaces its field atomically and
//! sends exactly one notification, even when the new value equals the old one,
//! so observers can treat notifications as ticks.
//!
//! Notifications go out on a bounded broadcast channel. A slow observer falls
//! behind and is told how many events it missed; it never stalls the writer.

use crate::location::{DeviceLocation, LocationError};
use crate::sample::SignalSample;
use log::debug;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

/// Events buffered per observer before it starts lagging.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// Change notification sent to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryEvent {
    LocationChanged(DeviceLocation),
    PeersChanged(Arc<[SignalSample]>),
}

/// The device fix and visible peers, read together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusedView {
    pub location: Option<DeviceLocation>,
    pub peers: Arc<[SignalSample]>,
}

#[derive(Debug)]
pub struct LocationRepository {
    state: RwLock<FusedView>,
    notifier: broadcast::Sender<RepositoryEvent>,
}

impl LocationRepository {
    pub fn new() -> Self {
        Self::with_capacity(OBSERVER_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (notifier, _) = broadcast::channel(capacity);
        Self {
            state: RwLock::new(FusedView::default()),
            notifier,
        }
    }

    /// Replace the device fix. A malformed fix is rejected and the previous one kept.
    pub fn set_current_location(&self, location: DeviceLocation) -> Result<(), LocationError> {
        location.validate()?;

        let mut state = self.write();
        state.location = Some(location);
        // sent under the lock so notification order matches write order
        self.notify(RepositoryEvent::LocationChanged(location));
        Ok(())
    }

    pub fn current_location(&self) -> Option<DeviceLocation> {
        self.read().location
    }

    pub fn has_location(&self) -> bool {
        self.read().location.is_some()
    }

    /// Milliseconds since the Unix epoch of the current fix, 0 without one.
    pub fn current_location_time(&self) -> u128 {
        self.read()
            .location
            .map(|l| l.timestamp_millis())
            .unwrap_or(0)
    }

    /// Replace the visible peers wholesale.
    pub fn set_peer_snapshot(&self, samples: Vec<SignalSample>) {
        let peers: Arc<[SignalSample]> = samples.into();

        let mut state = self.write();
        state.peers = Arc::clone(&peers);
        self.notify(RepositoryEvent::PeersChanged(peers));
    }

    pub fn visible_peers(&self) -> Arc<[SignalSample]> {
        Arc::clone(&self.read().peers)
    }

    /// Location and peers from the same instant.
    pub fn fused_view(&self) -> FusedView {
        self.read().clone()
    }

    /// Register an observer. Dropping the receiver deregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.notifier.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.notifier.receiver_count()
    }

    fn notify(&self, event: RepositoryEvent) {
        if self.notifier.send(event).is_err() {
            debug!("repository updated with no observers");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FusedView> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FusedView> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocationRepository {
    fn default() -> Self {
        Self::new()
    }
}
