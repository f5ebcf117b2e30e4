use crate::driver::{DriverAck, DriverError, DriverEvent, DriverSink, RadioDriver, ScanSettings};
use crate::identity::{MacAddress, PeerIdentity};
use crate::sample::SignalSample;
use crate::session::Phase;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// `secs` seconds after the Unix epoch.
pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// Identity of test peer `id`.
pub fn peer(id: u8) -> PeerIdentity {
    PeerIdentity::Address(MacAddress([0x02, 0, 0, 0, 0, id]))
}

/// A sample from test peer `id` without name, TX power or services.
///
/// Tests add just the fields they care about with the builder methods.
pub fn sample(id: u8, rssi: i16, secs: u64) -> SignalSample {
    SignalSample::new(peer(id), rssi, at(secs))
}

/// A request the fake driver received.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Start(ScanSettings),
    Stop,
}

/// Radio driver that records requests and optionally replays scripted events.
#[derive(Debug)]
pub struct FakeDriver {
    calls: Arc<Mutex<Vec<DriverCall>>>,
    ack: DriverAck,
    start_error: Option<DriverError>,
    script: Vec<DriverEvent>,
    sink: Option<DriverSink>,
    phase: Mutex<Option<watch::Receiver<Phase>>>,
    phases_at_stop: Mutex<Vec<Phase>>,
}

impl FakeDriver {
    /// A driver that acknowledges every request synchronously.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            ack: DriverAck::Confirmed,
            start_error: None,
            script: Vec::new(),
            sink: None,
            phase: Mutex::new(None),
            phases_at_stop: Mutex::new(Vec::new()),
        }
    }

    /// A driver whose acknowledgments arrive later as events.
    pub fn pending() -> Self {
        Self {
            ack: DriverAck::Pending,
            ..Self::new()
        }
    }

    /// A driver that rejects every start request.
    pub fn failing(err: DriverError) -> Self {
        Self {
            start_error: Some(err),
            ..Self::new()
        }
    }

    /// Post `events` through `sink` once discovery starts.
    pub fn scripted(sink: DriverSink, events: Vec<DriverEvent>) -> Self {
        Self {
            script: events,
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Record the session phase every time discovery is stopped.
    pub fn watch_phase(&self, phase: watch::Receiver<Phase>) {
        *self.phase.lock().unwrap() = Some(phase);
    }

    /// Phases seen inside `stop_discovery`, oldest first.
    pub fn phases_at_stop(&self) -> Vec<Phase> {
        self.phases_at_stop.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, DriverCall::Start(_)))
            .count()
    }
}

impl RadioDriver for FakeDriver {
    fn start_discovery(&mut self, settings: &ScanSettings) -> Result<DriverAck, DriverError> {
        self.calls
            .lock()
            .unwrap()
            .push(DriverCall::Start(settings.clone()));
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }

        if let Some(sink) = self.sink.take() {
            let events = std::mem::take(&mut self.script);
            tokio::spawn(async move {
                for event in events {
                    if !sink.post(event).await {
                        break;
                    }
                }
            });
        }
        Ok(self.ack)
    }

    fn stop_discovery(&mut self) -> Result<DriverAck, DriverError> {
        self.calls.lock().unwrap().push(DriverCall::Stop);
        if let Some(phase) = self.phase.lock().unwrap().as_ref() {
            self.phases_at_stop.lock().unwrap().push(*phase.borrow());
        }
        Ok(self.ack)
    }
}
