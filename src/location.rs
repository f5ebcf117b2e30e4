//! Device location fixes.

use std::time::SystemTime;
use thiserror::Error;

/// Errors returned when a location fix is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("malformed location: {0}")]
    MalformedLocation(String),
}

/// A single position fix of this device.
///
/// Coordinates are WGS84 degrees, accuracy is the radius in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: SystemTime,
}

impl DeviceLocation {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp: SystemTime) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            timestamp,
        }
    }

    /// The same position captured at another time.
    pub fn at(self, timestamp: SystemTime) -> Self {
        Self { timestamp, ..self }
    }

    /// Check that the fix describes a real position.
    pub fn validate(&self) -> Result<(), LocationError> {
        let malformed = |reason: String| Err(LocationError::MalformedLocation(reason));

        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return malformed(format!("latitude {} out of range", self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return malformed(format!("longitude {} out of range", self.longitude));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return malformed(format!("accuracy {} is not a distance", self.accuracy));
        }
        Ok(())
    }

    /// Timestamp in milliseconds since the Unix epoch (0 for pre-epoch clocks).
    pub fn timestamp_millis(&self) -> u128 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }
}

/// Parse a fix from `LAT,LON` or `LAT,LON,ACCURACY`.
///
/// The timestamp is left at the Unix epoch; callers stamp it when publishing.
///
/// # Example
/// ```
/// use proximity_fusion::location::parse_fix;
///
/// let fix = parse_fix("60.1699,24.9384,12").unwrap();
/// assert_eq!(fix.accuracy, 12.0);
/// assert!(parse_fix("60.1699").is_err());
/// ```
pub fn parse_fix(src: &str) -> Result<DeviceLocation, String> {
    let parts: Vec<&str> = src.split(',').map(str::trim).collect();
    let number = |part: &str| {
        part.parse::<f64>()
            .map_err(|_| format!("invalid coordinate: {part}"))
    };

    let (latitude, longitude, accuracy) = match parts.as_slice() {
        [lat, lon] => (number(lat)?, number(lon)?, 0.0),
        [lat, lon, acc] => (number(lat)?, number(lon)?, number(acc)?),
        _ => return Err("invalid location: expected format LAT,LON[,ACCURACY]".into()),
    };

    let fix = DeviceLocation::new(latitude, longitude, accuracy, SystemTime::UNIX_EPOCH);
    fix.validate().map_err(|e| e.to_string())?;
    Ok(fix)
}
