//! Radio driver boundary.
//!
//! A driver turns scan requests into radio activity and reports back through
//! discrete [`DriverEvent`] messages posted into the engine's channel, so
//! callbacks from driver-internal threads never touch session state directly.
//! Two Linux backends are provided behind cargo features: BlueZ over D-Bus
//! (`bluer`) and raw HCI sockets (`hci`).

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::engine::EngineEvent;
use crate::sample::SignalSample;
use std::mem;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Scan failure codes, numbered like the platform scan-failure callback.
pub mod failure {
    /// A scan with the same settings is already running.
    pub const SCAN_FAILED_ALREADY_STARTED: i32 = 1;
    /// The scanner could not be registered with the radio stack.
    pub const SCAN_FAILED_APPLICATION_REGISTRATION_FAILED: i32 = 2;
    /// Internal radio or stack error.
    pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
    /// The adapter does not support the requested scan.
    pub const SCAN_FAILED_FEATURE_UNSUPPORTED: i32 = 4;
}

/// Default delay over which samples are collected into one batch.
pub const DEFAULT_REPORT_DELAY: Duration = Duration::from_millis(100);

/// Error type for driver requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[allow(dead_code)]
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

impl DriverError {
    /// The scan failure code reported when this error ends a running scan.
    pub fn code(&self) -> i32 {
        match self {
            DriverError::Bluetooth(_) => failure::SCAN_FAILED_INTERNAL_ERROR,
            DriverError::BackendNotAvailable(_) => failure::SCAN_FAILED_FEATURE_UNSUPPORTED,
        }
    }
}

/// Parameters handed to the driver with every discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    /// Collect samples for this long and deliver them as one batch. Zero delivers each sample.
    pub report_delay: Duration,
    /// Only report peers advertising exactly this name
    pub name_filter: Option<String>,
}

impl ScanSettings {
    /// Whether a sample passes the driver-level filter.
    pub fn accepts(&self, sample: &SignalSample) -> bool {
        match &self.name_filter {
            Some(name) => sample.display_name.as_deref() == Some(name.as_str()),
            None => true,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            report_delay: DEFAULT_REPORT_DELAY,
            name_filter: None,
        }
    }
}

/// How a driver acknowledged a start or stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverAck {
    /// The request took effect before the call returned.
    Confirmed,
    /// The driver will post [`DriverEvent::Started`] or [`DriverEvent::Stopped`] later.
    Pending,
}

/// Messages a driver posts to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Started,
    Stopped,
    Sample(SignalSample),
    Batch(Vec<SignalSample>),
    Failed { code: i32 },
    AdapterPowered(bool),
}

/// The command side of a radio driver.
///
/// Calls must return promptly; long-running work belongs on the driver's own
/// task, which reports through its [`DriverSink`].
pub trait RadioDriver: Send {
    fn start_discovery(&mut self, settings: &ScanSettings) -> Result<DriverAck, DriverError>;
    fn stop_discovery(&mut self) -> Result<DriverAck, DriverError>;
}

impl<D: RadioDriver + ?Sized> RadioDriver for Box<D> {
    fn start_discovery(&mut self, settings: &ScanSettings) -> Result<DriverAck, DriverError> {
        (**self).start_discovery(settings)
    }

    fn stop_discovery(&mut self) -> Result<DriverAck, DriverError> {
        (**self).stop_discovery()
    }
}

/// Handle through which a driver posts events into the engine.
#[derive(Debug, Clone)]
pub struct DriverSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl DriverSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Post an event, waiting for channel capacity. Returns `false` once the engine is gone.
    pub async fn post(&self, event: DriverEvent) -> bool {
        self.tx.send(EngineEvent::Driver(event)).await.is_ok()
    }

    /// Post from a plain (non-async) driver thread.
    pub fn post_blocking(&self, event: DriverEvent) -> bool {
        self.tx.blocking_send(EngineEvent::Driver(event)).is_ok()
    }

    /// Post without waiting; the event is dropped when the channel is full.
    pub fn try_post(&self, event: DriverEvent) -> bool {
        self.tx.try_send(EngineEvent::Driver(event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Applies the report delay and name filter to raw samples.
#[derive(Debug)]
pub struct SampleBatcher {
    settings: ScanSettings,
    pending: Vec<SignalSample>,
}

impl SampleBatcher {
    pub fn new(settings: ScanSettings) -> Self {
        Self {
            settings,
            pending: Vec::new(),
        }
    }

    /// Whether samples are held back until [`SampleBatcher::flush`].
    pub fn is_batching(&self) -> bool {
        !self.settings.report_delay.is_zero()
    }

    pub fn report_delay(&self) -> Duration {
        self.settings.report_delay
    }

    /// Accept a sample. Returns an event to post right away when not batching.
    pub fn push(&mut self, sample: SignalSample) -> Option<DriverEvent> {
        if !self.settings.accepts(&sample) {
            return None;
        }
        if self.is_batching() {
            self.pending.push(sample);
            None
        } else {
            Some(DriverEvent::Sample(sample))
        }
    }

    /// Drain held samples into one batch event, if any.
    pub fn flush(&mut self) -> Option<DriverEvent> {
        if self.pending.is_empty() {
            None
        } else {
            Some(DriverEvent::Batch(mem::take(&mut self.pending)))
        }
    }
}

/// Available radio backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Create a driver for the chosen backend, posting its events through `sink`.
pub fn open(backend: Backend, sink: DriverSink) -> Result<Box<dyn RadioDriver>, DriverError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerDriver::new(sink))),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciDriver::new(0, sink))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample;
    use std::str::FromStr;

    fn settings(report_delay: Duration, name_filter: Option<&str>) -> ScanSettings {
        ScanSettings {
            report_delay,
            name_filter: name_filter.map(str::to_string),
        }
    }

    #[test]
    fn test_batcher_passes_samples_through_without_delay() {
        let mut batcher = SampleBatcher::new(settings(Duration::ZERO, None));
        assert!(!batcher.is_batching());
        assert_eq!(
            batcher.push(sample(1, -60, 1)),
            Some(DriverEvent::Sample(sample(1, -60, 1)))
        );
        assert_eq!(batcher.flush(), None);
    }

    #[test]
    fn test_batcher_holds_samples_until_flush() {
        let mut batcher = SampleBatcher::new(ScanSettings::default());
        assert!(batcher.push(sample(1, -60, 1)).is_none());
        assert!(batcher.push(sample(2, -70, 1)).is_none());

        match batcher.flush() {
            Some(DriverEvent::Batch(samples)) => assert_eq!(samples.len(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
        assert_eq!(batcher.flush(), None);
    }

    #[test]
    fn test_name_filter_drops_other_peers() {
        let mut batcher = SampleBatcher::new(settings(Duration::ZERO, Some("softlogistics")));
        assert!(batcher.push(sample(1, -60, 1)).is_none());
        assert!(batcher.push(sample(2, -60, 1).with_name("other")).is_none());
        assert!(
            batcher
                .push(sample(3, -60, 1).with_name("softlogistics"))
                .is_some()
        );
    }

    #[test]
    fn test_driver_error_codes() {
        assert_eq!(
            DriverError::Bluetooth("gone".into()).code(),
            failure::SCAN_FAILED_INTERNAL_ERROR
        );
        assert_eq!(
            DriverError::BackendNotAvailable("hci".into()).code(),
            failure::SCAN_FAILED_FEATURE_UNSUPPORTED
        );
    }

    #[test]
    fn test_sink_reports_closed_engine() {
        let (tx, rx) = mpsc::channel(1);
        let sink = DriverSink::new(tx);
        assert!(sink.try_post(DriverEvent::Started));
        assert!(!sink.try_post(DriverEvent::Stopped)); // full
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.try_post(DriverEvent::Stopped));
    }

    #[test]
    #[cfg(all(feature = "bluer", feature = "hci"))]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("bluer").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("bluez").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("hci").unwrap(), Backend::Hci);
        assert_eq!(Backend::from_str("raw").unwrap(), Backend::Hci);
        assert!(Backend::from_str("invalid").is_err());
    }

    #[test]
    #[cfg(all(feature = "bluer", feature = "hci"))]
    fn test_backend_display() {
        assert_eq!(format!("{}", Backend::Bluer), "bluer");
        assert_eq!(format!("{}", Backend::Hci), "hci");
    }
}
