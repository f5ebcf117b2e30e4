//! The proximity engine actor.
//!
//! One task owns the [`ScanSession`] (and with it the peer registry). Driver
//! callbacks, platform signals and user commands all arrive as
//! [`EngineEvent`]s on a single channel and are applied strictly in order, so
//! a later sample for a peer always wins over an earlier one. Snapshots are
//! published to the shared [`LocationRepository`]; asynchronous scan failures
//! are reported once on a separate channel.

use crate::driver::{DriverError, DriverEvent, DriverSink, RadioDriver, ScanSettings};
use crate::registry::{FilterCriteria, MatchRules, PeerRegistry};
use crate::repository::LocationRepository;
use crate::session::{Phase, Preconditions, RegistryUpdate, ScanSession, SessionError};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Channel buffer size for engine events.
pub const ENGINE_CHANNEL_BUFFER_SIZE: usize = 256;

/// Channel buffer size for failure reports.
pub const FAILURE_CHANNEL_BUFFER_SIZE: usize = 16;

/// Scan failures the engine could not return to a direct caller.
pub type FailureReports = mpsc::Receiver<SessionError>;

/// External platform state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    RadioEnabled(bool),
    LocationServiceEnabled(bool),
    PermissionGranted(bool),
}

/// Requests from the engine's owner.
#[derive(Debug)]
pub enum Command {
    Start(oneshot::Sender<Result<(), SessionError>>),
    Stop(oneshot::Sender<Result<(), SessionError>>),
    SetFilters(FilterCriteria, oneshot::Sender<bool>),
    Clear,
    Shutdown,
}

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Driver(DriverEvent),
    Platform(PlatformSignal),
    Command(Command),
}

/// Engine construction parameters.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub settings: ScanSettings,
    pub criteria: FilterCriteria,
    pub rules: MatchRules,
    pub preconditions: Preconditions,
}

pub struct Engine<D> {
    events: mpsc::Receiver<EngineEvent>,
    session: ScanSession<D>,
    repository: Arc<LocationRepository>,
    failures: mpsc::Sender<SessionError>,
}

impl<D: RadioDriver> Engine<D> {
    /// Build an engine around the driver returned by `make_driver`.
    ///
    /// The driver receives a [`DriverSink`] for posting its events.
    pub fn new<F>(
        config: EngineConfig,
        repository: Arc<LocationRepository>,
        make_driver: F,
    ) -> Result<(Self, EngineHandle, FailureReports), DriverError>
    where
        F: FnOnce(DriverSink) -> Result<D, DriverError>,
    {
        let (events_tx, events) = mpsc::channel(ENGINE_CHANNEL_BUFFER_SIZE);
        let (failures, failure_rx) = mpsc::channel(FAILURE_CHANNEL_BUFFER_SIZE);

        let driver = make_driver(DriverSink::new(events_tx.clone()))?;
        let registry = PeerRegistry::new(config.criteria, config.rules);
        let session = ScanSession::new(driver, config.settings, registry, config.preconditions);

        let handle = EngineHandle {
            events: events_tx,
            phase: session.subscribe_phase(),
        };
        let engine = Self {
            events,
            session,
            repository,
            failures,
        };
        Ok((engine, handle, failure_rx))
    }

    /// Process events until a shutdown command arrives or every sender is gone.
    pub async fn run(mut self) {
        info!("proximity engine running");
        while let Some(event) = self.events.recv().await {
            if let EngineEvent::Command(Command::Shutdown) = event {
                break;
            }
            self.handle(event);
        }
        if let Err(e) = self.session.stop() {
            warn!("stopping scan on shutdown failed: {e}");
        }
        info!("proximity engine stopped");
    }

    /// Apply one event to the session.
    pub fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Driver(event) => self.on_driver_event(event),
            EngineEvent::Platform(signal) => self.on_platform_signal(signal),
            EngineEvent::Command(command) => self.on_command(command),
        }
    }

    pub fn session(&self) -> &ScanSession<D> {
        &self.session
    }

    fn on_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Started => self.session.on_driver_started(),
            DriverEvent::Stopped => self.session.on_driver_stopped(),
            DriverEvent::Sample(sample) => {
                let update = self.session.on_sample(sample);
                self.publish(update);
            }
            DriverEvent::Batch(samples) => {
                let update = self.session.on_batch(samples);
                self.publish(update);
            }
            DriverEvent::Failed { code } => {
                let err = self.session.on_driver_failure(code);
                self.report(err);
            }
            DriverEvent::AdapterPowered(powered) => self.session.on_adapter_state_changed(powered),
        }
    }

    fn on_platform_signal(&mut self, signal: PlatformSignal) {
        match signal {
            PlatformSignal::RadioEnabled(enabled) => self.session.on_adapter_state_changed(enabled),
            PlatformSignal::LocationServiceEnabled(enabled) => {
                self.session.on_location_service_changed(enabled)
            }
            PlatformSignal::PermissionGranted(granted) => self.session.on_permission_changed(granted),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.session.start());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.session.stop());
            }
            Command::SetFilters(criteria, reply) => {
                let update = self.session.set_filters(criteria);
                let any_match = update.any_match;
                self.publish(Some(update));
                let _ = reply.send(any_match);
            }
            Command::Clear => {
                let update = self.session.clear();
                self.publish(Some(update));
            }
            Command::Shutdown => {}
        }
    }

    fn publish(&self, update: Option<RegistryUpdate>) {
        if let Some(update) = update {
            self.repository.set_peer_snapshot(update.snapshot);
        }
    }

    fn report(&self, err: SessionError) {
        if let Err(e) = self.failures.try_send(err) {
            warn!("failure report dropped: {e}");
        }
    }
}

/// Cloneable handle for controlling a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    phase: watch::Receiver<Phase>,
}

impl EngineHandle {
    pub async fn start(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start(reply)).await?;
        rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop(reply)).await?;
        rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    /// Replace the filters. Returns whether any discovered peer matches them.
    pub async fn set_filters(&self, criteria: FilterCriteria) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetFilters(criteria, reply)).await?;
        rx.await.map_err(|_| SessionError::EngineClosed)
    }

    pub async fn clear(&self) -> Result<(), SessionError> {
        self.send(Command::Clear).await
    }

    pub async fn signal(&self, signal: PlatformSignal) -> Result<(), SessionError> {
        self.post(EngineEvent::Platform(signal)).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown).await
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe scan phase changes. Dropping the receiver unsubscribes.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    /// A sink for posting driver events from outside the engine.
    pub fn driver_sink(&self) -> DriverSink {
        DriverSink::new(self.events.clone())
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.post(EngineEvent::Command(command)).await
    }

    async fn post(&self, event: EngineEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::EngineClosed)
    }
}
