//! `proximity-fusion` library.
//!
//! Scans for nearby radio peers, estimates their distance from signal strength
//! and fuses the visible peers with the device's own location into one
//! observable view.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing and process exit codes.
//! The run loop lives in [`crate::app`] where it can be tested
//! deterministically with an injected driver and injected output streams.

pub mod app;
pub mod distance;
pub mod driver;
pub mod engine;
pub mod identity;
pub mod location;
pub mod output;
pub mod registry;
pub mod repository;
pub mod sample;
pub mod service_uuid;
pub mod session;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use driver::{Backend, DriverAck, DriverError, DriverEvent, DriverSink, RadioDriver, ScanSettings};
pub use engine::{Engine, EngineConfig, EngineHandle, PlatformSignal};
pub use identity::{MacAddress, PeerIdentity};
pub use location::DeviceLocation;
pub use output::OutputFormatter;
pub use output::influxdb::InfluxDbFormatter;
pub use registry::{FilterCriteria, MatchRules, PeerRegistry};
pub use repository::{FusedView, LocationRepository, RepositoryEvent};
pub use sample::SignalSample;
pub use service_uuid::ServiceUuid;
pub use session::{Phase, ScanSession, SessionError};
