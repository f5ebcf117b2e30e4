//! Scan session state machine.
//!
//! `Idle → Starting → Active → Stopping → Idle`, with a forced shortcut to
//! `Idle` when the radio, location services (if required) or the scan
//! permission disappear. The session owns the [`PeerRegistry`] and turns
//! incoming samples into registry updates for publication.

use crate::driver::{DriverAck, DriverError, RadioDriver, ScanSettings};
use crate::registry::{FilterCriteria, PeerRegistry};
use crate::sample::SignalSample;
use log::{debug, error, info, warn};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle phase of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Active => "active",
            Phase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// An external condition a scan depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Radio,
    LocationService,
    Permission,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precondition::Radio => "radio",
            Precondition::LocationService => "location service",
            Precondition::Permission => "permission",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by session operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot scan: {which} not available")]
    PreconditionNotMet { which: Precondition },
    #[error("scan failed with driver error code {code}")]
    DriverReportedFailure { code: i32 },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("proximity engine is not running")]
    EngineClosed,
}

/// Mirrors of the platform conditions a scan depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preconditions {
    pub radio_enabled: bool,
    pub location_service_enabled: bool,
    pub permission_granted: bool,
    /// Whether the platform needs location services for discovery
    pub location_required: bool,
}

impl Default for Preconditions {
    fn default() -> Self {
        Self {
            radio_enabled: true,
            location_service_enabled: true,
            permission_granted: true,
            location_required: true,
        }
    }
}

impl Preconditions {
    /// The first unmet precondition, if any.
    pub fn missing(&self) -> Option<Precondition> {
        if !self.radio_enabled {
            Some(Precondition::Radio)
        } else if self.location_required && !self.location_service_enabled {
            Some(Precondition::LocationService)
        } else if !self.permission_granted {
            Some(Precondition::Permission)
        } else {
            None
        }
    }
}

/// A change to the exported peer view, ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryUpdate {
    /// Whether any retained peer matches the current filters
    pub any_match: bool,
    pub snapshot: Vec<SignalSample>,
}

/// One discovery session against a radio driver.
pub struct ScanSession<D> {
    driver: D,
    settings: ScanSettings,
    registry: PeerRegistry,
    preconditions: Preconditions,
    phase: watch::Sender<Phase>,
}

impl<D: RadioDriver> ScanSession<D> {
    pub fn new(
        driver: D,
        settings: ScanSettings,
        registry: PeerRegistry,
        preconditions: Preconditions,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            driver,
            settings,
            registry,
            preconditions,
            phase,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase changes. Dropping the receiver unsubscribes.
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn preconditions(&self) -> Preconditions {
        self.preconditions
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Request a scan. Idempotent while starting or active.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let phase = self.phase();
        if matches!(phase, Phase::Active | Phase::Starting) {
            debug!("start ignored, scan already {phase}");
            return Ok(());
        }

        if let Some(which) = self.preconditions.missing() {
            warn!("cannot start scan: {which} not available");
            return Err(SessionError::PreconditionNotMet { which });
        }

        match self.driver.start_discovery(&self.settings) {
            Ok(ack) => {
                self.set_phase(Phase::Starting);
                if ack == DriverAck::Confirmed {
                    self.set_phase(Phase::Active);
                }
                Ok(())
            }
            Err(e) => {
                error!("driver rejected scan request: {e}");
                self.set_phase(Phase::Idle);
                Err(e.into())
            }
        }
    }

    /// Cancel the scan. No-op when idle or already stopping.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if !matches!(self.phase(), Phase::Active | Phase::Starting) {
            return Ok(());
        }

        self.set_phase(Phase::Stopping);
        match self.driver.stop_discovery() {
            Ok(DriverAck::Confirmed) => {
                self.set_phase(Phase::Idle);
                Ok(())
            }
            Ok(DriverAck::Pending) => Ok(()),
            Err(e) => {
                error!("driver failed to cancel scan: {e}");
                self.set_phase(Phase::Idle);
                Err(e.into())
            }
        }
    }

    /// The driver confirmed a pending start.
    pub fn on_driver_started(&mut self) {
        match self.phase() {
            Phase::Starting => self.set_phase(Phase::Active),
            phase => debug!("ignoring start acknowledgment while {phase}"),
        }
    }

    /// The driver confirmed a pending stop.
    pub fn on_driver_stopped(&mut self) {
        match self.phase() {
            Phase::Stopping => self.set_phase(Phase::Idle),
            phase => debug!("ignoring stop acknowledgment while {phase}"),
        }
    }

    /// The driver reported that the scan failed. The session goes idle; no retry.
    pub fn on_driver_failure(&mut self, code: i32) -> SessionError {
        error!("scan failed with driver error code {code}");
        self.set_phase(Phase::Idle);
        SessionError::DriverReportedFailure { code }
    }

    pub fn on_adapter_state_changed(&mut self, enabled: bool) {
        self.preconditions.radio_enabled = enabled;
        if !enabled {
            self.force_stop(Precondition::Radio);
        }
    }

    pub fn on_location_service_changed(&mut self, enabled: bool) {
        self.preconditions.location_service_enabled = enabled;
        if !enabled && self.preconditions.location_required {
            self.force_stop(Precondition::LocationService);
        }
    }

    pub fn on_permission_changed(&mut self, granted: bool) {
        self.preconditions.permission_granted = granted;
        if !granted {
            self.force_stop(Precondition::Permission);
        }
    }

    /// Relay one sample to the registry. Returns an update when the export changed.
    pub fn on_sample(&mut self, sample: SignalSample) -> Option<RegistryUpdate> {
        if !self.accepting_samples() {
            debug!("dropping sample from {} while {}", sample.identity(), self.phase());
            return None;
        }
        self.note_sample_received();

        if self.registry.observe(sample) {
            Some(self.refresh())
        } else {
            None
        }
    }

    /// Fold a whole batch into the registry, then re-apply filters once.
    pub fn on_batch(&mut self, samples: Vec<SignalSample>) -> Option<RegistryUpdate> {
        if !self.accepting_samples() {
            debug!("dropping batch of {} while {}", samples.len(), self.phase());
            return None;
        }
        if samples.is_empty() {
            return None;
        }
        self.note_sample_received();

        let mut matched = false;
        for sample in samples {
            matched |= self.registry.observe(sample);
        }

        if matched { Some(self.refresh()) } else { None }
    }

    pub fn set_filters(&mut self, criteria: FilterCriteria) -> RegistryUpdate {
        let any_match = self.registry.apply_filters(criteria);
        RegistryUpdate {
            any_match,
            snapshot: self.registry.export_snapshot(),
        }
    }

    pub fn set_require_known_service(&mut self, required: bool) -> RegistryUpdate {
        let criteria = FilterCriteria {
            require_known_service: required,
            ..self.registry.criteria()
        };
        self.set_filters(criteria)
    }

    pub fn set_nearby_only(&mut self, nearby_only: bool) -> RegistryUpdate {
        let criteria = FilterCriteria {
            nearby_only,
            ..self.registry.criteria()
        };
        self.set_filters(criteria)
    }

    /// Forget every discovered peer.
    pub fn clear(&mut self) -> RegistryUpdate {
        self.registry.clear();
        RegistryUpdate {
            any_match: false,
            snapshot: Vec::new(),
        }
    }

    fn refresh(&mut self) -> RegistryUpdate {
        let criteria = self.registry.criteria();
        self.set_filters(criteria)
    }

    fn accepting_samples(&self) -> bool {
        matches!(self.phase(), Phase::Starting | Phase::Active)
    }

    // A sample that arrives while location services are off proves that
    // discovery works without them on this platform.
    fn note_sample_received(&mut self) {
        if self.preconditions.location_required && !self.preconditions.location_service_enabled {
            info!("samples arrive with location services off, location no longer required");
            self.preconditions.location_required = false;
        }
    }

    fn force_stop(&mut self, lost: Precondition) {
        if self.phase() == Phase::Idle {
            return;
        }
        warn!("{lost} lost, stopping scan");
        self.set_phase(Phase::Stopping);
        if let Err(e) = self.driver.stop_discovery() {
            debug!("cancel after losing {lost} failed: {e}");
        }
        self.set_phase(Phase::Idle);
    }

    fn set_phase(&self, next: Phase) {
        self.phase.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("scan phase {current} -> {next}");
            *current = next;
            true
        });
    }
}
