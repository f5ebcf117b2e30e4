//! A single observed peer reading.

use crate::distance::{self, DistanceError};
use crate::identity::PeerIdentity;
use crate::service_uuid::ServiceUuid;
use std::time::SystemTime;

/// One advertisement received from a peer.
///
/// - RSSI in dBm, roughly `-100..=0`
/// - Transmit power in dBm at 1 m, `None` when the peer does not declare it
///
/// The identity is fixed at construction; use [`SignalSample::identity`] to read it.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSample {
    identity: PeerIdentity,
    /// Human-readable label (advertised local name or alias)
    pub display_name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Declared transmit power at 1 m in dBm
    pub tx_power: Option<i16>,
    /// Service UUIDs advertised in this reading
    pub service_uuids: Vec<ServiceUuid>,
    /// When the advertisement was captured
    pub observed_at: SystemTime,
}

impl SignalSample {
    pub fn new(identity: impl Into<PeerIdentity>, rssi: i16, observed_at: SystemTime) -> Self {
        Self {
            identity: identity.into(),
            display_name: None,
            rssi,
            tx_power: None,
            service_uuids: Vec::new(),
            observed_at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_tx_power(mut self, tx_power: i16) -> Self {
        self.tx_power = Some(tx_power);
        self
    }

    pub fn with_service(mut self, uuid: ServiceUuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Estimated distance in meters using the default path-loss curve.
    pub fn distance(&self) -> Result<f64, DistanceError> {
        distance::estimate(self.rssi, self.tx_power)
    }

    /// Timestamp in milliseconds since the Unix epoch (0 for pre-epoch clocks).
    pub fn observed_at_millis(&self) -> u128 {
        self.observed_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;
    use std::time::Duration;

    #[test]
    fn test_builder_sets_fields() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        let sample = SignalSample::new(TEST_MAC, -61, at)
            .with_name("desk")
            .with_tx_power(-59)
            .with_service(ServiceUuid::from_u16(0x180F))
            .with_service(ServiceUuid::from_u16(0x180F));

        assert_eq!(sample.identity(), &PeerIdentity::Address(TEST_MAC));
        assert_eq!(sample.display_name.as_deref(), Some("desk"));
        assert_eq!(sample.tx_power, Some(-59));
        assert_eq!(sample.service_uuids.len(), 1);
        assert_eq!(sample.observed_at_millis(), 1_500);
    }

    #[test]
    fn test_distance_unknown_without_tx_power() {
        let sample = SignalSample::new(TEST_MAC, -61, SystemTime::UNIX_EPOCH);
        assert_eq!(
            sample.distance(),
            Err(DistanceError::InsufficientCalibrationData)
        );
        assert!(sample.with_tx_power(-59).distance().is_ok());
    }
}
