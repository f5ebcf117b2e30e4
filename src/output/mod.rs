//! Report formatters for the fused view.
//!
//! The binary's report loop renders every repository notification through an
//! [`OutputFormatter`]. InfluxDB line protocol is the only format so far.

pub mod influxdb;

use crate::location::DeviceLocation;
use crate::sample::SignalSample;
use std::time::SystemTime;

/// Turns repository notifications into output lines.
pub trait OutputFormatter: Send + Sync {
    /// Format a new device fix as one line.
    fn format_location(&self, location: &DeviceLocation) -> String;

    /// Format a peer snapshot published at `published_at`.
    ///
    /// Always yields at least one line so an empty snapshot is still visible.
    fn format_peers(&self, peers: &[SignalSample], published_at: SystemTime) -> Vec<String>;
}
